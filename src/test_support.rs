/// In-memory collaborators for unit tests
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::contracts::{FileBlock, ImageBlock};
use crate::errors::{Result, SomError};
use crate::sdk::{Sdk, SdkBuilder};
use crate::storage::{FirmwareSlot, ImageSlotState, Storage};
use crate::transport::Transport;

/// What the mock link saw, plus scripted responses
#[derive(Debug, Default)]
pub(crate) struct LinkLog {
    pub sent: Vec<Vec<u8>>,
    /// ACK outcomes consumed in order; empty means ACK
    pub acks: VecDeque<bool>,
    /// Number of upcoming sends that fail locally
    pub fail_send: usize,
    pub closed: usize,
    pub files: Vec<FileBlock>,
    pub image: Vec<Vec<u8>>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    log: Arc<Mutex<LinkLog>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut log = self.log.lock();
        if log.fail_send > 0 {
            log.fail_send -= 1;
            return Err(SomError::IoError("modem not attached".to_string()));
        }
        log.sent.push(bytes.to_vec());
        Ok(())
    }

    async fn wait_for_ack(&mut self, timeout: Duration) -> Result<bool> {
        let acked = self.log.lock().acks.pop_front().unwrap_or(true);
        if !acked {
            tokio::time::sleep(timeout).await;
        }
        Ok(acked)
    }

    async fn send_file_block(&mut self, block: &FileBlock, _timeout: Duration) -> Result<()> {
        self.log.lock().files.push(block.clone());
        Ok(())
    }

    async fn fetch_block(&mut self, _path: &str, index: u32, _timeout: Duration) -> Result<ImageBlock> {
        let log = self.log.lock();
        let i = index as usize;
        let data = log.image.get(i).cloned().ok_or(SomError::AckTimeout)?;
        Ok(ImageBlock {
            index,
            more: i + 1 < log.image.len(),
            data,
        })
    }

    async fn close(&mut self) {
        self.log.lock().closed += 1;
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Storage for MemStorage {
    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| SomError::IoError(format!("{} not found", name)))?;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn append(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.files
            .lock()
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn overwrite(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.files.lock().insert(name.to_string(), data.to_vec());
        Ok(data.len())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| SomError::IoError(format!("{} not found", old_name)))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.files
            .lock()
            .get(name)
            .map(|d| d.len() as u64)
            .ok_or_else(|| SomError::IoError(format!("{} not found", name)))
    }

    fn free_space(&self) -> Result<u64> {
        Ok(u64::MAX)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemorySlot {
    pub data: Vec<u8>,
    pub state: ImageSlotState,
    /// Every append fails, like a worn-out flash page
    pub fail_append: bool,
}

impl FirmwareSlot for MemorySlot {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.fail_append {
            return Err(SomError::IoError("flash write failed".to_string()));
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.data.clear();
        self.state.secondary_rejected = false;
        self.state.upgrade_pending = false;
        Ok(())
    }

    fn request_upgrade(&mut self) -> Result<()> {
        self.state.upgrade_pending = true;
        Ok(())
    }

    fn confirm(&mut self) -> Result<()> {
        self.state.running_unconfirmed = false;
        Ok(())
    }

    fn state(&self) -> ImageSlotState {
        self.state
    }

    fn written(&self) -> u64 {
        self.data.len() as u64
    }
}

pub(crate) fn test_sdk_with_slot(slot: MemorySlot) -> (Sdk, Arc<Mutex<LinkLog>>) {
    let log = Arc::new(Mutex::new(LinkLog::default()));
    let transport = MockTransport {
        log: Arc::clone(&log),
    };
    let sdk = SdkBuilder::new(
        Box::new(transport),
        Arc::new(MemStorage::default()),
        Box::new(slot),
    )
    .reset_hook(|| {})
    .build();
    (sdk, log)
}

pub(crate) fn test_sdk() -> (Sdk, Arc<Mutex<LinkLog>>) {
    test_sdk_with_slot(MemorySlot::default())
}
