/// Codec boundary - converts tape snapshots into uplink bytes and back
///
/// The pipeline only talks to [`MessageCodec`]; [`RkyvCodec`] is the
/// reference implementation built on the rkyv contracts.
use blake2::{Blake2s256, Digest};
use tracing::debug;

use crate::contracts::{
    DownlinkMessage, NetworkQuality, PeriodRecord, TapeRecord, UplinkEvent, UplinkMessage,
};
use crate::errors::{Result, SomError};
use crate::tape::StoreSnapshot;
use crate::{APP_COAP_MAX_MSG_LEN, MAX_COAP_MESSAGE_HEAD_SIZE, MAX_TRACKS_COUNT};

/// Metadata attached to an uplink besides the tape contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkMeta {
    pub event: UplinkEvent,
    pub radio: Option<NetworkQuality>,
    pub packet_counter: u32,
}

impl UplinkMeta {
    pub fn periodic(packet_counter: u32) -> Self {
        Self {
            event: UplinkEvent::Periodic,
            radio: None,
            packet_counter,
        }
    }
}

/// Encode/decode contract consumed by the packer
pub trait MessageCodec: Send {
    /// Whether `snapshot` + `meta` differ from the last encoded message
    fn is_data_changed(&self, snapshot: &StoreSnapshot, meta: &UplinkMeta) -> bool;

    /// Encode into the internal buffer
    fn encode(&mut self, snapshot: &StoreSnapshot, meta: &UplinkMeta) -> Result<()>;

    fn encoded_buffer(&self) -> &[u8];

    fn encoded_len(&self) -> u16 {
        self.encoded_buffer().len().min(u16::MAX as usize) as u16
    }

    /// The full-width encoding did not fit and had to be compacted
    fn is_compression_check_required(&self) -> bool;

    /// The encoded message does not fit a single datagram
    fn is_udp_packet_full(&self) -> bool;

    fn decode(&mut self, bytes: &[u8]) -> Result<DownlinkMessage>;
}

/// Payload budget once the transport header is accounted for
pub const MAX_ENCODED_LEN: usize = APP_COAP_MAX_MSG_LEN - MAX_COAP_MESSAGE_HEAD_SIZE;

/// Reference codec producing [`UplinkMessage`] archives
#[derive(Debug, Default)]
pub struct RkyvCodec {
    buffer: Vec<u8>,
    last_digest: Option<[u8; 32]>,
    compression_required: bool,
    packet_full: bool,
}

impl RkyvCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(snapshot: &StoreSnapshot, meta: &UplinkMeta) -> [u8; 32] {
        let mut hasher = Blake2s256::new();
        let (kind, value) = meta.event.code();
        hasher.update([kind]);
        hasher.update(value.to_le_bytes());
        hasher.update([u8::from(meta.radio.is_some())]);
        for (i, tape) in snapshot.tapes.iter().enumerate() {
            hasher.update((i as u32).to_le_bytes());
            for period in &tape.periods {
                hasher.update(period.period.to_le_bytes());
                hasher.update((period.columns.len() as u32).to_le_bytes());
                for column in &period.columns {
                    for value in column {
                        hasher.update(value.to_le_bytes());
                    }
                }
            }
        }
        hasher.finalize().into()
    }

    // Number of leading tracks holding a non-zero value in any column.
    fn used_tracks(snapshot: &StoreSnapshot) -> usize {
        snapshot
            .tapes
            .iter()
            .flat_map(|t| t.periods.iter())
            .flat_map(|p| p.columns.iter())
            .map(|c| c.iter().rposition(|v| *v != 0).map_or(0, |i| i + 1))
            .max()
            .unwrap_or(0)
    }

    fn build(snapshot: &StoreSnapshot, meta: &UplinkMeta, tracks: usize) -> UplinkMessage {
        let tapes = snapshot
            .tapes
            .iter()
            .map(|tape| TapeRecord {
                periods: tape
                    .periods
                    .iter()
                    .map(|p| PeriodRecord {
                        period: p.period,
                        tracks: tracks as u8,
                        values: p
                            .columns
                            .iter()
                            .flat_map(|c| c[..tracks].iter().copied())
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        UplinkMessage {
            packet_counter: meta.packet_counter,
            event: meta.event,
            radio: meta.radio,
            tapes,
        }
    }
}

impl MessageCodec for RkyvCodec {
    fn is_data_changed(&self, snapshot: &StoreSnapshot, meta: &UplinkMeta) -> bool {
        self.last_digest != Some(Self::digest(snapshot, meta))
    }

    fn encode(&mut self, snapshot: &StoreSnapshot, meta: &UplinkMeta) -> Result<()> {
        let mut bytes = Self::build(snapshot, meta, MAX_TRACKS_COUNT).to_bytes()?;
        self.compression_required = bytes.len() > MAX_ENCODED_LEN;

        if self.compression_required {
            let tracks = Self::used_tracks(snapshot);
            debug!(
                "Full-width uplink is {} bytes, trimming to {} tracks",
                bytes.len(),
                tracks
            );
            bytes = Self::build(snapshot, meta, tracks).to_bytes()?;
        }

        self.packet_full = bytes.len() > MAX_ENCODED_LEN;
        self.buffer = bytes;
        self.last_digest = Some(Self::digest(snapshot, meta));
        Ok(())
    }

    fn encoded_buffer(&self) -> &[u8] {
        &self.buffer
    }

    fn is_compression_check_required(&self) -> bool {
        self.compression_required
    }

    fn is_udp_packet_full(&self) -> bool {
        self.packet_full
    }

    fn decode(&mut self, bytes: &[u8]) -> Result<DownlinkMessage> {
        if bytes.len() > APP_COAP_MAX_MSG_LEN {
            return Err(SomError::BufferTooSmall {
                required: bytes.len(),
                available: APP_COAP_MAX_MSG_LEN,
            });
        }
        DownlinkMessage::from_bytes(bytes)
    }
}
