use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::MAX_ACTION_PARAMETERS_SIZE;

/// Longest accepted firmware path, in bytes
pub const MAX_FW_PATH_LEN: usize = 64;

/// A deferred non-uplink operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    FirmwareUpgrade(String),
    LogRead,
    TerminalCommand(Vec<u8>),
}

impl PendingAction {
    /// Numeric tag reported by [`ActionSlot::requested_action`]
    pub fn code(&self) -> u8 {
        match self {
            Self::FirmwareUpgrade(_) => 1,
            Self::LogRead => 2,
            Self::TerminalCommand(_) => 3,
        }
    }
}

/// Single-slot holder for one pending action.
///
/// A postponement is accepted when the slot is empty or already holds the
/// same kind of request (its parameters are replaced). A request of a
/// different kind is refused until the slot has been consumed.
#[derive(Debug, Default)]
pub struct ActionSlot {
    slot: Mutex<Option<PendingAction>>,
}

impl ActionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn postpone(&self, action: PendingAction) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(current) if current.code() != action.code() => {
                warn!(
                    "Refusing action {} while action {} is pending",
                    action.code(),
                    current.code()
                );
                false
            }
            _ => {
                debug!("Postponed action {}", action.code());
                *slot = Some(action);
                true
            }
        }
    }

    /// Returns false if refused (slot busy or path too long)
    pub fn postpone_upgrade_fw(&self, path: &[u8]) -> bool {
        if path.is_empty() || path.len() > MAX_FW_PATH_LEN {
            warn!("Firmware path length {} rejected", path.len());
            return false;
        }
        let path = String::from_utf8_lossy(path).into_owned();
        self.postpone(PendingAction::FirmwareUpgrade(path))
    }

    pub fn postpone_log_read(&self) -> bool {
        self.postpone(PendingAction::LogRead)
    }

    /// Returns false if refused (slot busy or command too long)
    pub fn postpone_terminal_cmd(&self, cmd: &[u8]) -> bool {
        if cmd.is_empty() || cmd.len() > MAX_ACTION_PARAMETERS_SIZE {
            warn!("Terminal command length {} rejected", cmd.len());
            return false;
        }
        self.postpone(PendingAction::TerminalCommand(cmd.to_vec()))
    }

    /// 0 if empty, action code otherwise
    pub fn requested_action(&self) -> u8 {
        self.slot.lock().as_ref().map_or(0, PendingAction::code)
    }

    /// Consume the pending action, leaving the slot empty
    pub fn take(&self) -> Option<PendingAction> {
        self.slot.lock().take()
    }
}
