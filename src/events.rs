/// Event bus and boot-status bookkeeping
///
/// Events are dispatched synchronously on the thread that raised them.
/// Handlers must not block and must not wait on the pipeline that invoked
/// them.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::errors::{Result, SomError};

/// Lifecycle and status events raised by the SDK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SomEvent {
    /// All internal and user boot bits are set
    DeviceInitOk,
    LoggerInitOk,
    PackerInitOk,
    MailerInitOk,

    /// Outbound queue full, oldest message dropped
    DroppingOldest,

    PackerStarted,
    PackingFailed,
    EnqueueFailed,
    PackerDoneOk,

    UlStart,
    UlMaxRetry,
    UlRetry,
    UlDone,

    CoapStart,
    CoapFail,
    CoapNoAck,
    CoapOk,

    LogError,
    LogWarning,
    LogInfo,
    /// Terminal command received; bytes carry the command
    TerminalCmd,

    /// Last firmware block stored, reboot into the new image
    FwUpgradeRequested,
    /// Chunked upload or download aborted
    TransferFailed,
    /// Invariant violation, a reset follows
    CriticalError,
}

/// Optional payload attached to an event
#[derive(Debug, Clone, Copy, Default)]
pub struct EventData<'a> {
    pub bytes: Option<&'a [u8]>,
    pub value: i32,
}

impl<'a> EventData<'a> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn value(value: i32) -> Self {
        Self { bytes: None, value }
    }

    pub fn bytes(bytes: &'a [u8]) -> Self {
        Self {
            bytes: Some(bytes),
            value: bytes.len() as i32,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(SomEvent, &EventData<'_>) + Send + Sync>;

/// Registered handlers; `None` filter receives every event
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(Option<SomEvent>, EventHandler)>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind
    pub fn on<F>(&self, event: SomEvent, f: F)
    where
        F: Fn(SomEvent, &EventData<'_>) + Send + Sync + 'static,
    {
        self.handlers.write().push((Some(event), Arc::new(f)));
    }

    /// Register a handler receiving every event
    pub fn on_any<F>(&self, f: F)
    where
        F: Fn(SomEvent, &EventData<'_>) + Send + Sync + 'static,
    {
        self.handlers.write().push((None, Arc::new(f)));
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Dispatch to every matching handler; no handler is a no-op
    pub fn emit(&self, event: SomEvent, data: EventData<'_>) {
        trace!(?event, value = data.value, "event");
        // Release the lock before calling out so handlers may register others.
        let matching: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(filter, _)| filter.map_or(true, |e| e == event))
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in matching {
            handler(event, &data);
        }
    }

    pub fn emit_simple(&self, event: SomEvent) {
        self.emit(event, EventData::none());
    }
}

pub const MAILER_BOOT_OK_BIT: u32 = 0;
pub const PACKER_BOOT_OK_BIT: u32 = 1;
pub const LOGGER_BOOT_OK_BIT: u32 = 2;
pub const FIRST_USER_STATUS_BIT: u32 = 16;
pub const LAST_USER_STATUS_BIT: u32 = 31;

const INTERNAL_BOOT_MASK: u32 = (1 << MAILER_BOOT_OK_BIT) | (1 << PACKER_BOOT_OK_BIT);
const USER_BITS_MASK: u32 = u32::MAX << FIRST_USER_STATUS_BIT;

/// Boot status bits shared by the pipelines and the host application
#[derive(Debug, Default)]
pub struct BootStatus {
    bits: AtomicU32,
    user_mask: AtomicU32,
    init_reported: AtomicBool,
}

fn check_user_bit(bit: u32) -> Result<()> {
    if !(FIRST_USER_STATUS_BIT..=LAST_USER_STATUS_BIT).contains(&bit) {
        return Err(SomError::out_of_range(
            "user_status_bit",
            bit.into(),
            FIRST_USER_STATUS_BIT.into(),
            LAST_USER_STATUS_BIT.into(),
        ));
    }
    Ok(())
}

impl BootStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bits(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// True when every bit of `mask` is set
    pub fn check_mask(&self, mask: u32) -> bool {
        self.bits() & mask == mask
    }

    /// Bits the host requires before `DeviceInitOk`; only user bits are kept
    pub fn set_user_mask(&self, mask: u32) {
        self.user_mask.store(mask & USER_BITS_MASK, Ordering::Release);
    }

    /// Set a bit; returns true exactly once, when the boot mask completes
    pub(crate) fn set_bit(&self, bit: u32) -> bool {
        self.bits.fetch_or(1 << bit, Ordering::AcqRel);
        self.try_complete()
    }

    pub fn set_user_bit(&self, bit: u32) -> Result<bool> {
        check_user_bit(bit)?;
        Ok(self.set_bit(bit))
    }

    pub fn reset_user_bit(&self, bit: u32) -> Result<()> {
        check_user_bit(bit)?;
        self.reset_bit(bit);
        Ok(())
    }

    pub(crate) fn reset_bit(&self, bit: u32) {
        self.bits.fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    fn try_complete(&self) -> bool {
        let required = INTERNAL_BOOT_MASK | self.user_mask.load(Ordering::Acquire);
        self.check_mask(required)
            && self
                .init_reported
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}
