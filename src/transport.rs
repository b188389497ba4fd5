/// Transport module - delivery of encoded payloads to the collector
///
/// The pipelines only see the [`Transport`] trait: send a payload, learn
/// whether it was acknowledged. [`UdpTransport`] is the datagram
/// implementation: every payload travels in a CRC-protected [`Datagram`]
/// and is answered by an [`AckPacket`] carrying the same session and
/// message id.
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::contracts::{
    AckPacket, Datagram, FetchRequest, FileBlock, ImageBlock, DATAGRAM_FETCH_BLOCK,
    DATAGRAM_FILE_BLOCK, DATAGRAM_UPLINK,
};
use crate::errors::{Result, SomError};
use crate::{APP_COAP_MAX_MSG_LEN, MAX_COAP_MESSAGE_HEAD_SIZE};

/// Link to the collector
#[async_trait]
pub trait Transport: Send {
    /// Transmit one encoded uplink
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Wait for the acknowledgment of the last `send`.
    ///
    /// `Ok(false)` means no ACK arrived in time (or the collector NACKed).
    async fn wait_for_ack(&mut self, timeout: Duration) -> Result<bool>;

    /// Upload one block of a file and wait for its acknowledgment
    async fn send_file_block(&mut self, block: &FileBlock, timeout: Duration) -> Result<()>;

    /// Download one block of a remote image
    async fn fetch_block(&mut self, path: &str, index: u32, timeout: Duration) -> Result<ImageBlock>;

    /// Close the session; the next send opens a fresh one
    async fn close(&mut self);
}

/// Receive buffer: largest payload plus frame overhead
const RECV_BUFFER_SIZE: usize = APP_COAP_MAX_MSG_LEN + 2 * MAX_COAP_MESSAGE_HEAD_SIZE + 64;

/// Datagram transport over UDP
pub struct UdpTransport {
    socket: UdpSocket,
    session_id: u32,
    next_message_id: u32,
    last_message_id: Option<u32>,
    buffer: Vec<u8>,
}

impl UdpTransport {
    /// Bind `local` and connect to the collector at `remote`
    pub async fn connect(local: &str, remote: &str) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let session_id = rand::random();
        info!("UDP transport session {:#x} to {}", session_id, remote);
        Ok(Self {
            socket,
            session_id,
            next_message_id: 1,
            last_message_id: None,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    async fn transmit(&mut self, kind: u8, payload: Vec<u8>) -> Result<u32> {
        if payload.len() > APP_COAP_MAX_MSG_LEN {
            return Err(SomError::BufferTooSmall {
                required: payload.len(),
                available: APP_COAP_MAX_MSG_LEN,
            });
        }
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let frame = Datagram::new(self.session_id, message_id, kind, payload).to_bytes()?;
        self.socket.send(&frame).await?;
        debug!("Sent datagram {} ({} bytes)", message_id, frame.len());
        Ok(message_id)
    }

    // Wait for the ACK/NACK matching `message_id`; stale frames are skipped.
    async fn receive_ack(&mut self, message_id: u32, timeout: Duration) -> Result<Option<AckPacket>> {
        let deadline = Instant::now() + timeout;
        loop {
            let received = match timeout_at(deadline, self.socket.recv(&mut self.buffer)).await {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };
            match AckPacket::from_bytes(&self.buffer[..received]) {
                Ok(ack) if ack.session_id == self.session_id && ack.message_id == message_id => {
                    match ack.verify() {
                        Ok(()) => return Ok(Some(ack)),
                        Err(e) => warn!("Dropping ACK {} with corrupt body: {}", message_id, e),
                    }
                }
                Ok(ack) => {
                    debug!("Ignoring stale ACK {} of session {:#x}", ack.message_id, ack.session_id);
                }
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }
    }

    async fn exchange(&mut self, kind: u8, payload: Vec<u8>, timeout: Duration) -> Result<AckPacket> {
        let message_id = self.transmit(kind, payload).await?;
        match self.receive_ack(message_id, timeout).await? {
            Some(ack) if ack.is_ack() => Ok(ack),
            Some(_) => Err(SomError::IoError(format!("message {} NACKed", message_id))),
            None => Err(SomError::AckTimeout),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let message_id = self.transmit(DATAGRAM_UPLINK, bytes.to_vec()).await?;
        self.last_message_id = Some(message_id);
        Ok(())
    }

    async fn wait_for_ack(&mut self, timeout: Duration) -> Result<bool> {
        let Some(message_id) = self.last_message_id else {
            return Ok(false);
        };
        Ok(self
            .receive_ack(message_id, timeout)
            .await?
            .is_some_and(|ack| ack.is_ack()))
    }

    async fn send_file_block(&mut self, block: &FileBlock, timeout: Duration) -> Result<()> {
        let payload = block.to_bytes()?;
        self.exchange(DATAGRAM_FILE_BLOCK, payload, timeout).await?;
        Ok(())
    }

    async fn fetch_block(&mut self, path: &str, index: u32, timeout: Duration) -> Result<ImageBlock> {
        let request = FetchRequest {
            path: path.to_string(),
            index,
        }
        .to_bytes()?;
        let ack = self.exchange(DATAGRAM_FETCH_BLOCK, request, timeout).await?;
        let block = ImageBlock::from_bytes(&ack.body)?;
        if block.index != index {
            return Err(SomError::DeserializationError(format!(
                "expected block {}, got {}",
                index, block.index
            )));
        }
        Ok(block)
    }

    async fn close(&mut self) {
        let old = self.session_id;
        self.session_id = rand::random();
        self.last_message_id = None;
        info!("Session {:#x} closed, next session {:#x}", old, self.session_id);
    }
}
