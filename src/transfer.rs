/// Chunked transfer engine - block-wise file uploads and firmware downloads
///
/// The engine has no task of its own: it is driven by whoever holds the
/// link. At most one transfer (upload or download) is active at a time and
/// only one block is buffered.
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::contracts::FileBlock;
use crate::errors::{Result, SomError};
use crate::storage::{FirmwareSlot, FwUpgradeStatus, Storage};
use crate::transport::Transport;
use crate::{APP_COAP_MAX_MSG_LEN, FILE_CHUNK_SIZE};

/// Largest firmware image accepted into the secondary slot
pub const MAX_IMAGE_SIZE: u64 = 1024 * 1024;

/// Result of storing one firmware block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Block stored, more expected
    Continue,
    /// Last block stored and the upgrade has been requested
    UpgradeRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransferState {
    Idle,
    Downloading { blocks: u32 },
    Uploading { filename: String, sent: u32, total: u32 },
}

pub struct ChunkedTransfer {
    slot: Box<dyn FirmwareSlot>,
    state: TransferState,
    /// A download block failed; the slot must be erased before the next download
    download_failed: bool,
}

impl std::fmt::Debug for ChunkedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTransfer")
            .field("state", &self.state)
            .field("download_failed", &self.download_failed)
            .field("written", &self.slot.written())
            .finish()
    }
}

impl ChunkedTransfer {
    pub fn new(slot: Box<dyn FirmwareSlot>) -> Self {
        Self {
            slot,
            state: TransferState::Idle,
            download_failed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            TransferState::Downloading { .. } | TransferState::Uploading { .. }
        )
    }

    /// Start a firmware download into a freshly erased secondary slot
    pub fn begin_download(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(SomError::LinkBusy);
        }
        if self.download_failed {
            return Err(SomError::TransferFailed);
        }
        self.slot.erase()?;
        self.state = TransferState::Downloading { blocks: 0 };
        info!("Firmware download started");
        Ok(())
    }

    fn fail_download(&mut self, err: SomError) -> SomError {
        error!("Firmware download aborted: {}", err);
        self.state = TransferState::Idle;
        self.download_failed = true;
        err
    }

    /// Append one block of the incoming image.
    ///
    /// Any failure aborts the transfer and leaves the slot partially written.
    pub fn save_fw_chunk(&mut self, data: &[u8], is_last: bool) -> Result<ChunkOutcome> {
        let blocks = match self.state {
            TransferState::Downloading { blocks } => blocks,
            _ if self.download_failed => return Err(SomError::TransferFailed),
            _ => return Err(SomError::TransferNotStarted),
        };

        if data.len() > APP_COAP_MAX_MSG_LEN {
            return Err(self.fail_download(SomError::BufferTooSmall {
                required: data.len(),
                available: APP_COAP_MAX_MSG_LEN,
            }));
        }
        if self.slot.written() + data.len() as u64 > MAX_IMAGE_SIZE {
            return Err(self.fail_download(SomError::BufferTooSmall {
                required: (self.slot.written() + data.len() as u64) as usize,
                available: MAX_IMAGE_SIZE as usize,
            }));
        }
        if let Err(e) = self.slot.append(data) {
            return Err(self.fail_download(e));
        }

        if !is_last {
            self.state = TransferState::Downloading { blocks: blocks + 1 };
            return Ok(ChunkOutcome::Continue);
        }

        if let Err(e) = self.slot.request_upgrade() {
            return Err(self.fail_download(e));
        }
        info!(
            "Firmware download complete: {} blocks, {} bytes",
            blocks + 1,
            self.slot.written()
        );
        self.state = TransferState::Idle;
        Ok(ChunkOutcome::UpgradeRequested)
    }

    /// Erase the secondary slot, clearing a failed download
    pub fn erase_secondary_slot(&mut self) -> Result<()> {
        if matches!(self.state, TransferState::Uploading { .. }) {
            return Err(SomError::LinkBusy);
        }
        self.slot.erase()?;
        self.state = TransferState::Idle;
        self.download_failed = false;
        Ok(())
    }

    pub fn check_fw_upgrade_status(&self) -> FwUpgradeStatus {
        self.slot.state().upgrade_status()
    }

    pub fn confirm_image(&mut self) -> Result<()> {
        self.slot.confirm()
    }

    /// Send one block of a file; chunks must arrive in order.
    ///
    /// An error leaves the upload position unchanged so the caller can
    /// resend the same block or abort the whole transfer.
    pub async fn send_file_chunk(
        &mut self,
        transport: &mut dyn Transport,
        filename: &str,
        chunk: &[u8],
        total_size: u32,
        timeout: Duration,
    ) -> Result<()> {
        if chunk.is_empty() || chunk.len() > FILE_CHUNK_SIZE {
            return Err(SomError::InvalidArgument(format!(
                "chunk size {} not in 1..={}",
                chunk.len(),
                FILE_CHUNK_SIZE
            )));
        }

        let offset = match &self.state {
            TransferState::Idle => 0,
            TransferState::Uploading {
                filename: active,
                sent,
                total,
            } if active == filename && *total == total_size => *sent,
            _ => return Err(SomError::LinkBusy),
        };
        if u64::from(offset) + chunk.len() as u64 > u64::from(total_size) {
            return Err(SomError::InvalidArgument(format!(
                "chunk at {} overruns {} byte file",
                offset, total_size
            )));
        }

        let block = FileBlock {
            filename: filename.to_string(),
            offset,
            total_size,
            data: chunk.to_vec(),
        };
        if offset == 0 {
            debug!("Upload of {} ({} bytes) started", filename, total_size);
        }
        // Claim the engine before the first await so no download can start.
        if !matches!(self.state, TransferState::Uploading { .. }) {
            self.state = TransferState::Uploading {
                filename: filename.to_string(),
                sent: 0,
                total: total_size,
            };
        }

        transport.send_file_block(&block, timeout).await?;

        let sent = offset + chunk.len() as u32;
        self.state = if sent >= total_size {
            info!("Upload of {} complete", filename);
            TransferState::Idle
        } else {
            TransferState::Uploading {
                filename: filename.to_string(),
                sent,
                total: total_size,
            }
        };
        Ok(())
    }

    pub fn abort_upload(&mut self) {
        if let TransferState::Uploading { filename, sent, .. } = &self.state {
            warn!("Upload of {} aborted at {} bytes", filename, sent);
            self.state = TransferState::Idle;
        }
    }

    /// Upload a stored file block by block, retrying each block.
    ///
    /// Refused with `LinkBusy` while another transfer is active; a transfer
    /// started elsewhere is never aborted from here.
    pub async fn upload_file(
        &mut self,
        transport: &mut dyn Transport,
        storage: &dyn Storage,
        name: &str,
        retries: u8,
        timeout: Duration,
    ) -> Result<()> {
        if self.is_active() {
            return Err(SomError::LinkBusy);
        }
        let size = storage.file_size(name)?;
        let total = u32::try_from(size)
            .map_err(|_| SomError::InvalidArgument(format!("{} too large to upload", name)))?;
        if total == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut offset = 0u32;
        while offset < total {
            let n = storage.read_at(name, u64::from(offset), &mut buf)?;
            if n == 0 {
                self.abort_upload();
                return Err(SomError::IoError(format!("{} truncated at {}", name, offset)));
            }

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self
                    .send_file_chunk(transport, name, &buf[..n], total, timeout)
                    .await
                {
                    Ok(()) => break,
                    Err(e) if attempt < retries.max(1) => {
                        warn!("Block at {} of {} failed ({}), retry {}", offset, name, e, attempt);
                    }
                    Err(e) => {
                        self.abort_upload();
                        return Err(e);
                    }
                }
            }
            offset += n as u32;
        }
        Ok(())
    }

    /// Fetch a remote image block by block into the secondary slot
    pub async fn download_image(
        &mut self,
        transport: &mut dyn Transport,
        path: &str,
        timeout: Duration,
    ) -> Result<ChunkOutcome> {
        self.begin_download()?;
        let mut index = 0;
        loop {
            let block = match transport.fetch_block(path, index, timeout).await {
                Ok(block) => block,
                Err(e) => return Err(self.fail_download(e)),
            };
            if self.save_fw_chunk(&block.data, !block.more)? == ChunkOutcome::UpgradeRequested {
                return Ok(ChunkOutcome::UpgradeRequested);
            }
            index += 1;
        }
    }
}
