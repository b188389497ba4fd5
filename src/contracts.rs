/// Wire contracts exchanged with the collector
///
/// All structures are archived with rkyv and validated with `check_bytes`
/// on the way in. Incoming buffers are copied into an `AlignedVec` before
/// validation since datagram buffers carry no alignment guarantee.
use rkyv::{AlignedVec, Archive, Deserialize, Infallible, Serialize};

use crate::errors::{Result, SomError};
use crate::{MAX_TRACKS_COUNT, SOMLINK_VERSION};

/// Scratch space for the rkyv serializer
const SCRATCH_SIZE: usize = 1024;

fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}

macro_rules! rkyv_codec {
    ($ty:ty, $name:literal) => {
        impl $ty {
            /// Serialize to archived bytes
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                rkyv::to_bytes::<_, SCRATCH_SIZE>(self)
                    .map(|aligned_vec| aligned_vec.to_vec())
                    .map_err(|_| {
                        SomError::SerializationError(concat!("Failed to serialize ", $name).to_string())
                    })
            }

            /// Validate and deserialize archived bytes
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                let buf = aligned(bytes);
                let archived = rkyv::check_archived_root::<$ty>(&buf).map_err(|_| {
                    SomError::DeserializationError(concat!("Failed to validate ", $name).to_string())
                })?;
                archived.deserialize(&mut Infallible).map_err(|_| {
                    SomError::DeserializationError(concat!("Failed to deserialize ", $name).to_string())
                })
            }
        }
    };
}

/// Why an uplink was produced
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum UplinkEvent {
    /// Regular measurement report
    Periodic,
    /// Report requested together with radio quality
    RadioData,
    FwUpgradeOk,
    FwUpgradeFailed,
    LogsSent,
    /// Terminal command finished with the given result code
    CommandResult(i32),
}

impl UplinkEvent {
    /// Event uplinks are sent even when no measurement changed
    pub fn is_notification(&self) -> bool {
        !matches!(self, Self::Periodic | Self::RadioData)
    }

    pub fn code(&self) -> (u8, i32) {
        match self {
            Self::Periodic => (0, 0),
            Self::RadioData => (1, 0),
            Self::FwUpgradeOk => (2, 0),
            Self::FwUpgradeFailed => (3, 0),
            Self::LogsSent => (4, 0),
            Self::CommandResult(res) => (5, *res),
        }
    }
}

/// Cached modem signal quality
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct NetworkQuality {
    pub rsrp: i32,
    pub rsrq: i32,
    pub snr: i32,
}

/// One period of a tape on the wire.
///
/// `values` is row-major with `tracks` values per column; trailing tracks
/// that are zero in every column may be trimmed by the encoder.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PeriodRecord {
    pub period: u32,
    pub tracks: u8,
    pub values: Vec<i32>,
}

impl PeriodRecord {
    pub fn column_count(&self) -> usize {
        if self.tracks == 0 {
            return 0;
        }
        self.values.len() / usize::from(self.tracks)
    }

    /// Expand back to full-width columns
    pub fn columns(&self) -> Vec<[i32; MAX_TRACKS_COUNT]> {
        let tracks = usize::from(self.tracks).min(MAX_TRACKS_COUNT);
        if tracks == 0 {
            return Vec::new();
        }
        self.values
            .chunks(usize::from(self.tracks))
            .map(|chunk| {
                let mut column = [0; MAX_TRACKS_COUNT];
                column[..tracks].copy_from_slice(&chunk[..tracks]);
                column
            })
            .collect()
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct TapeRecord {
    pub periods: Vec<PeriodRecord>,
}

/// Uplink message produced by the packer
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct UplinkMessage {
    pub packet_counter: u32,
    pub event: UplinkEvent,
    pub radio: Option<NetworkQuality>,
    pub tapes: Vec<TapeRecord>,
}

rkyv_codec!(UplinkMessage, "UplinkMessage");

/// Downlink message received from the collector
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct DownlinkMessage {
    /// Firmware image path to download
    pub fw_upgrade_path: Option<String>,
    /// Upload stored log files
    pub log_read: bool,
    /// Raw terminal command
    pub terminal_cmd: Option<Vec<u8>>,
    /// JSON object with settings to update
    pub settings_patch: Option<String>,
}

rkyv_codec!(DownlinkMessage, "DownlinkMessage");

/// Datagram payload kinds
pub const DATAGRAM_UPLINK: u8 = 0;
pub const DATAGRAM_FILE_BLOCK: u8 = 1;
pub const DATAGRAM_FETCH_BLOCK: u8 = 2;

/// Compare a frame's CRC32 against its data
pub fn check_crc(expected: u32, data: &[u8]) -> Result<()> {
    let actual = crc32fast::hash(data);
    if actual != expected {
        return Err(SomError::IntegrityCheckFailed { expected, actual });
    }
    Ok(())
}

/// Transport frame carrying one payload
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Datagram {
    pub version: u16,
    pub session_id: u32,
    pub message_id: u32,
    pub kind: u8,
    /// CRC32 of `payload`
    pub crc32: u32,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn new(session_id: u32, message_id: u32, kind: u8, payload: Vec<u8>) -> Self {
        Self {
            version: SOMLINK_VERSION,
            session_id,
            message_id,
            kind,
            crc32: crc32fast::hash(&payload),
            payload,
        }
    }
}

rkyv_codec!(Datagram, "Datagram");

/// One block of a file upload
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct FileBlock {
    pub filename: String,
    pub offset: u32,
    pub total_size: u32,
    pub data: Vec<u8>,
}

rkyv_codec!(FileBlock, "FileBlock");

/// Request for one block of a remote image
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct FetchRequest {
    pub path: String,
    pub index: u32,
}

rkyv_codec!(FetchRequest, "FetchRequest");

/// One block of a remote image, carried in an ACK
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ImageBlock {
    pub index: u32,
    pub more: bool,
    pub data: Vec<u8>,
}

rkyv_codec!(ImageBlock, "ImageBlock");

/// ACK/NACK from the collector
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct AckPacket {
    pub session_id: u32,
    pub message_id: u32,
    /// 0 = ACK, 1 = NACK
    pub ack_type: u8,
    /// CRC32 of `body`
    pub crc32: u32,
    /// Optional response body (image blocks)
    pub body: Vec<u8>,
}

impl AckPacket {
    pub fn ack(session_id: u32, message_id: u32, body: Vec<u8>) -> Self {
        Self {
            session_id,
            message_id,
            ack_type: 0,
            crc32: crc32fast::hash(&body),
            body,
        }
    }

    pub fn nack(session_id: u32, message_id: u32) -> Self {
        Self {
            session_id,
            message_id,
            ack_type: 1,
            crc32: crc32fast::hash(&[]),
            body: Vec::new(),
        }
    }

    pub fn verify(&self) -> Result<()> {
        check_crc(self.crc32, &self.body)
    }

    pub fn is_ack(&self) -> bool {
        self.ack_type == 0
    }
}

rkyv_codec!(AckPacket, "AckPacket");
