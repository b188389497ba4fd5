/// SomLink Core - uplink pipeline of an IoT device SDK
///
/// **Creator**: Shayan Golmezerji
/// **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
///
/// Aggregates periodic sensor measurements on fixed-capacity tapes, packs
/// them into encoded uplinks and delivers those over an unreliable link with
/// bounded retry and backoff. Chunked transfers (firmware download, log
/// upload) and deferred actions share the link with the delivery pipeline.
///
/// # Design Principles
/// - Fixed-capacity containers, bounded queue with drop-oldest overflow
/// - One message in flight at a time
/// - Failures surface as events, never as panics
/// - Zero-copy validated frames using rkyv

pub mod errors;
pub mod settings;
pub mod tape;
pub mod packet_counter;
pub mod contracts;
pub mod codec;
pub mod queue;
pub mod events;
pub mod action;
pub mod transport;
pub mod storage;
pub mod transfer;
pub mod packer;
pub mod mailer;
pub mod sdk;

#[cfg(test)]
mod test_support;

pub use action::PendingAction;
pub use codec::{MessageCodec, RkyvCodec, UplinkMeta};
pub use contracts::{DownlinkMessage, NetworkQuality, UplinkEvent, UplinkMessage};
pub use errors::{Result, SomError};
pub use events::{EventData, SomEvent};
pub use mailer::{MailerState, MailerWaitMode};
pub use packer::PackerState;
pub use sdk::{Sdk, SdkBuilder};
pub use settings::Settings;
pub use storage::{FileFirmwareSlot, FirmwareSlot, FsStorage, FwUpgradeStatus, Storage};
pub use transfer::ChunkOutcome;
pub use transport::{Transport, UdpTransport};

/// Protocol version
pub const SOMLINK_VERSION: u16 = 1;

/// Measurement slots per column
pub const MAX_TRACKS_COUNT: usize = 12;

/// Period entries per tape
pub const MAX_PERIODS_COUNT: usize = 3;

/// Columns per tape
pub const MAX_COLUMNS_COUNT: usize = 50;

/// Number of tapes
pub const MAX_TAPE_COUNT: usize = 1;

/// Index of the default tape
pub const I_TAPE: usize = 0;

/// Largest terminal command accepted by the action slot
pub const MAX_ACTION_PARAMETERS_SIZE: usize = 256;

/// Largest encoded or chunked payload (in bytes)
pub const APP_COAP_MAX_MSG_LEN: usize = 1280;

/// Room reserved for the message header
pub const MAX_COAP_MESSAGE_HEAD_SIZE: usize = 30;

/// File upload block size
pub const FILE_CHUNK_SIZE: usize = 1024;

/// Backoff multiplier for retransmission (exponential)
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Prefix of log files uploaded on a log-read request
pub const LOG_FILE_PREFIX: &str = "app_";

/// Settings document name in storage
pub const SETTINGS_FILE: &str = "settings.txt";
