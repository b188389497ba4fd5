/// Storage module - file and firmware-slot collaborators
///
/// [`Storage`] covers the file operations the SDK needs (log upload,
/// settings persistence); [`FirmwareSlot`] covers the secondary image slot
/// written by downloads. Both have filesystem-backed implementations.
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{Result, SomError};

/// File operations used by the SDK
pub trait Storage: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read
    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn append(&self, name: &str, data: &[u8]) -> Result<usize>;
    fn overwrite(&self, name: &str, data: &[u8]) -> Result<usize>;
    fn delete(&self, name: &str) -> Result<()>;
    fn rename(&self, old_name: &str, new_name: &str) -> Result<()>;
    fn file_size(&self, name: &str) -> Result<u64>;
    fn free_space(&self) -> Result<u64>;
    /// Files starting with `prefix`, oldest first
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Outcome of the last firmware upgrade, as seen at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwUpgradeStatus {
    Success,
    None,
    Failed,
}

/// Image-slot state reported by the bootloader side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSlotState {
    /// Running an image that was swapped in but not yet confirmed
    pub running_unconfirmed: bool,
    /// The secondary slot holds an image the bootloader rejected
    pub secondary_rejected: bool,
    /// An upgrade was requested and awaits reboot
    pub upgrade_pending: bool,
}

impl ImageSlotState {
    /// Pure classification of the slot state
    pub fn upgrade_status(&self) -> FwUpgradeStatus {
        if self.secondary_rejected {
            FwUpgradeStatus::Failed
        } else if self.running_unconfirmed {
            FwUpgradeStatus::Success
        } else {
            FwUpgradeStatus::None
        }
    }
}

/// Secondary firmware image slot
pub trait FirmwareSlot: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn erase(&mut self) -> Result<()>;
    /// Mark the written image for swap on next boot
    fn request_upgrade(&mut self) -> Result<()>;
    fn confirm(&mut self) -> Result<()>;
    fn state(&self) -> ImageSlotState;
    fn written(&self) -> u64;
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(SomError::InvalidArgument(format!("invalid file name: {:?}", name)));
    }
    Ok(())
}

/// Storage rooted in one directory with a fixed volume budget
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    volume_size: u64,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, volume_size: u64) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, volume_size })
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }

    fn used_bytes(&self) -> Result<u64> {
        let mut used = 0;
        for entry in fs::read_dir(&self.root)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                used += meta.len();
            }
        }
        Ok(used)
    }
}

impl Storage for FsStorage {
    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = File::open(self.path(name)?)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn append(&self, name: &str, data: &[u8]) -> Result<usize> {
        if data.len() as u64 > self.free_space()? {
            return Err(SomError::IoError(format!("no space left for {}", name)));
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name)?)?;
        file.write_all(data)?;
        Ok(data.len())
    }

    fn overwrite(&self, name: &str, data: &[u8]) -> Result<usize> {
        fs::write(self.path(name)?, data)?;
        Ok(data.len())
    }

    fn delete(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path(name)?)?;
        Ok(())
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        fs::rename(self.path(old_name)?, self.path(new_name)?)?;
        Ok(())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.path(name)?)?.len())
    }

    fn free_space(&self) -> Result<u64> {
        Ok(self.volume_size.saturating_sub(self.used_bytes()?))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && entry.metadata()?.is_file() {
                files.push(name);
            }
        }
        // Log names embed a timestamp, so lexical order is age order.
        files.sort();
        Ok(files)
    }
}

const IMAGE_FILE: &str = "secondary.bin";
const STATE_FILE: &str = "slot_state.json";

/// Firmware slot persisted as an image file plus a JSON state file
#[derive(Debug)]
pub struct FileFirmwareSlot {
    dir: PathBuf,
    state: ImageSlotState,
    written: u64,
}

impl FileFirmwareSlot {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let state = match fs::read_to_string(dir.join(STATE_FILE)) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ImageSlotState::default(),
            Err(e) => return Err(e.into()),
        };
        let written = fs::metadata(dir.join(IMAGE_FILE)).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            dir,
            state,
            written,
        })
    }

    /// Record bootloader findings (used by the host after reboot)
    pub fn set_state(&mut self, state: ImageSlotState) -> Result<()> {
        self.state = state;
        self.persist_state()
    }

    fn persist_state(&self) -> Result<()> {
        let json = serde_json::to_string(&self.state)
            .map_err(|e| SomError::SerializationError(e.to_string()))?;
        fs::write(self.dir.join(STATE_FILE), json)?;
        Ok(())
    }
}

impl FirmwareSlot for FileFirmwareSlot {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(IMAGE_FILE))?;
        file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        match fs::remove_file(self.dir.join(IMAGE_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.written = 0;
        self.state.secondary_rejected = false;
        self.state.upgrade_pending = false;
        info!("Secondary image slot erased");
        self.persist_state()
    }

    fn request_upgrade(&mut self) -> Result<()> {
        self.state.upgrade_pending = true;
        debug!("Upgrade requested for {} byte image", self.written);
        self.persist_state()
    }

    fn confirm(&mut self) -> Result<()> {
        self.state.running_unconfirmed = false;
        self.persist_state()
    }

    fn state(&self) -> ImageSlotState {
        self.state
    }

    fn written(&self) -> u64 {
        self.written
    }
}
