/// SDK context - owns the shared state and exposes the host-facing calls
///
/// One [`Sdk`] value exists per device. It owns the tapes, the outbound
/// queue, the pending-action slot, the counters and the collaborators, and
/// spawns the packer and mailer tasks once on [`Sdk::start`].
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::action::ActionSlot;
use crate::codec::{MessageCodec, RkyvCodec};
use crate::contracts::{NetworkQuality, UplinkEvent};
use crate::errors::{Result, SomError};
use crate::events::{BootStatus, EventBus, EventData, SomEvent, LOGGER_BOOT_OK_BIT};
use crate::mailer::{self, MailerState, MailerWaitMode};
use crate::packer::{self, PackerState};
use crate::packet_counter::{PacketCounter, DEFAULT_PACKET_COUNTER_LIMIT};
use crate::queue::{EncodedMessage, OutboundQueue, DEFAULT_QUEUE_CAPACITY};
use crate::settings::Settings;
use crate::storage::{FirmwareSlot, FwUpgradeStatus, Storage};
use crate::tape::{Column, TapeStore};
use crate::transfer::{ChunkOutcome, ChunkedTransfer};
use crate::transport::Transport;
use crate::SETTINGS_FILE;

type ResetHook = Box<dyn Fn() + Send + Sync>;

/// State shared by the host calls and both pipeline tasks
pub(crate) struct SdkContext {
    pub(crate) settings: RwLock<Settings>,
    pub(crate) tapes: Mutex<TapeStore>,
    pub(crate) packet_counter: PacketCounter,
    pub(crate) queue: Mutex<OutboundQueue>,
    pub(crate) actions: ActionSlot,
    pub(crate) events: EventBus,
    pub(crate) boot: BootStatus,
    pub(crate) network_quality: Mutex<Option<NetworkQuality>>,
    pub(crate) codec: Mutex<Box<dyn MessageCodec>>,
    pub(crate) pack_trigger: Notify,
    pub(crate) mail_trigger: Notify,
    /// Interrupts the mailer's current wait so it picks up a new wait mode
    pub(crate) mode_changed: Notify,
    // The link is held for a whole delivery pass or transfer.
    pub(crate) transport: AsyncMutex<Box<dyn Transport>>,
    pub(crate) transfer: AsyncMutex<ChunkedTransfer>,
    pub(crate) storage: Arc<dyn Storage>,
    staged_events: Mutex<VecDeque<UplinkEvent>>,
    radio_requested: AtomicBool,
    packer_state: Mutex<PackerState>,
    mailer_state: Mutex<MailerState>,
    wait_mode: Mutex<MailerWaitMode>,
    message_ids: AtomicU32,
    reset_hook: ResetHook,
}

impl SdkContext {
    pub(crate) fn emit(&self, event: SomEvent, data: EventData<'_>) {
        self.events.emit(event, data);
    }

    /// Report an invariant violation and reset the device
    pub(crate) fn critical_error(&self, err: SomError) {
        error!("Critical error: {}", err);
        let message = err.to_string();
        self.emit(SomEvent::CriticalError, EventData::bytes(message.as_bytes()));
        (self.reset_hook)();
    }

    /// Push into the outbound queue, reporting a drop-oldest eviction
    pub(crate) fn enqueue(&self, msg: EncodedMessage) {
        let dropped = self.queue.lock().push(msg);
        if let Some(dropped) = dropped {
            warn!("Outbound queue full, dropped message {}", dropped.id);
            self.emit(SomEvent::DroppingOldest, EventData::value(dropped.id as i32));
        }
    }

    pub(crate) fn boot_ok(&self, bit: u32, event: SomEvent) {
        self.emit(event, EventData::none());
        if self.boot.set_bit(bit) {
            info!("Device init complete");
            self.emit(SomEvent::DeviceInitOk, EventData::none());
        }
    }

    pub(crate) fn stage_uplink_event(&self, event: UplinkEvent) {
        self.staged_events.lock().push_back(event);
    }

    pub(crate) fn take_staged_events(&self) -> Vec<UplinkEvent> {
        self.staged_events.lock().drain(..).collect()
    }

    pub(crate) fn take_radio_request(&self) -> bool {
        self.radio_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn next_message_id(&self) -> u32 {
        self.message_ids.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub(crate) fn set_packer_state(&self, state: PackerState) {
        *self.packer_state.lock() = state;
    }

    pub(crate) fn set_mailer_state(&self, state: MailerState) {
        *self.mailer_state.lock() = state;
    }

    pub(crate) fn wait_mode(&self) -> MailerWaitMode {
        *self.wait_mode.lock()
    }
}

/// Collects the collaborators and options of an [`Sdk`]
pub struct SdkBuilder {
    settings: Settings,
    transport: Box<dyn Transport>,
    storage: Arc<dyn Storage>,
    firmware_slot: Box<dyn FirmwareSlot>,
    codec: Box<dyn MessageCodec>,
    queue_capacity: usize,
    packet_counter_limit: u32,
    wait_mode: MailerWaitMode,
    reset_hook: ResetHook,
}

impl SdkBuilder {
    pub fn new(
        transport: Box<dyn Transport>,
        storage: Arc<dyn Storage>,
        firmware_slot: Box<dyn FirmwareSlot>,
    ) -> Self {
        Self {
            settings: Settings::default(),
            transport,
            storage,
            firmware_slot,
            codec: Box::new(RkyvCodec::new()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            packet_counter_limit: DEFAULT_PACKET_COUNTER_LIMIT,
            wait_mode: MailerWaitMode::default(),
            reset_hook: Box::new(|| std::process::abort()),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn codec(mut self, codec: Box<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Fixed for the lifetime of the SDK
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn packet_counter_limit(mut self, limit: u32) -> Self {
        self.packet_counter_limit = limit;
        self
    }

    pub fn wait_mode(mut self, mode: MailerWaitMode) -> Self {
        self.wait_mode = mode;
        self
    }

    /// Called after a critical error has been reported
    pub fn reset_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reset_hook = Box::new(hook);
        self
    }

    pub fn build(self) -> Sdk {
        let ctx = SdkContext {
            settings: RwLock::new(self.settings),
            tapes: Mutex::new(TapeStore::new()),
            packet_counter: PacketCounter::new(self.packet_counter_limit),
            queue: Mutex::new(OutboundQueue::new(self.queue_capacity)),
            actions: ActionSlot::new(),
            events: EventBus::new(),
            boot: BootStatus::new(),
            network_quality: Mutex::new(None),
            codec: Mutex::new(self.codec),
            pack_trigger: Notify::new(),
            mail_trigger: Notify::new(),
            mode_changed: Notify::new(),
            transport: AsyncMutex::new(self.transport),
            transfer: AsyncMutex::new(ChunkedTransfer::new(self.firmware_slot)),
            storage: self.storage,
            staged_events: Mutex::new(VecDeque::new()),
            radio_requested: AtomicBool::new(false),
            packer_state: Mutex::new(PackerState::Idle),
            mailer_state: Mutex::new(MailerState::Idle),
            wait_mode: Mutex::new(self.wait_mode),
            message_ids: AtomicU32::new(0),
            reset_hook: self.reset_hook,
        };
        Sdk {
            ctx: Arc::new(ctx),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Handle to the running uplink pipeline
pub struct Sdk {
    ctx: Arc<SdkContext>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sdk {
    /// Spawn the packer and mailer tasks; later calls are no-ops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(packer::run(Arc::clone(&self.ctx))));
        tasks.push(tokio::spawn(mailer::run(Arc::clone(&self.ctx))));
    }

    /// Abort both pipeline tasks
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &SdkContext {
        &self.ctx
    }

    // ---- triggers ----

    /// Wake the packer; a trigger while packing is coalesced
    pub fn pack(&self, include_radio_data: bool) {
        if include_radio_data {
            self.ctx.radio_requested.store(true, Ordering::Release);
        }
        self.ctx.set_packer_state(PackerState::Triggered);
        self.ctx.pack_trigger.notify_one();
    }

    /// Wake the mailer, optionally packing radio data first
    pub fn mail(&self, include_radio_packing: bool) {
        if include_radio_packing {
            self.pack(true);
        }
        self.ctx.mail_trigger.notify_one();
    }

    /// Change how the idle mailer waits; applies to the wait in progress
    pub fn set_wait_mode(&self, mode: MailerWaitMode) {
        *self.ctx.wait_mode.lock() = mode;
        self.ctx.mode_changed.notify_one();
    }

    pub fn wait_mode(&self) -> MailerWaitMode {
        self.ctx.wait_mode()
    }

    pub fn packer_state(&self) -> PackerState {
        *self.ctx.packer_state.lock()
    }

    pub fn mailer_state(&self) -> MailerState {
        *self.ctx.mailer_state.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.ctx.queue.lock().len()
    }

    // ---- tapes ----

    pub fn update_period(&self, i_tape: usize, period: u32) -> Result<()> {
        self.ctx.tapes.lock().update_period(i_tape, period)
    }

    /// Append a column; returns the free column slots left
    pub fn add_column(&self, i_tape: usize, period: u32, measurements: &Column) -> Result<usize> {
        self.ctx.tapes.lock().add_column(i_tape, period, measurements)
    }

    pub fn last_period(&self, i_tape: usize) -> Result<u32> {
        self.ctx.tapes.lock().last_period(i_tape)
    }

    pub fn record_count(&self, i_tape: usize) -> Result<usize> {
        self.ctx.tapes.lock().record_count(i_tape)
    }

    pub fn rewind_tape(&self, i_tape: usize) -> Result<()> {
        self.ctx.tapes.lock().rewind(i_tape)
    }

    pub fn restart_all(&self) {
        self.ctx.tapes.lock().restart_all();
    }

    pub fn set_column_limit(&self, i_tape: usize, limit: usize) -> Result<()> {
        self.ctx.tapes.lock().set_column_limit(i_tape, limit)
    }

    // ---- packet counter ----

    pub fn packet_counter(&self) -> u32 {
        self.ctx.packet_counter.get()
    }

    pub fn set_packet_counter(&self, value: u32) {
        self.ctx.packet_counter.set(value);
    }

    pub fn reset_packet_counter(&self) {
        self.ctx.packet_counter.reset();
    }

    pub fn packet_counter_limit(&self) -> u32 {
        self.ctx.packet_counter.limit()
    }

    pub fn set_packet_counter_limit(&self, limit: u32) {
        self.ctx.packet_counter.set_limit(limit);
    }

    // ---- pending actions ----

    pub fn postpone_upgrade_fw(&self, path: &[u8]) -> bool {
        self.ctx.actions.postpone_upgrade_fw(path)
    }

    pub fn postpone_log_read(&self) -> bool {
        self.ctx.actions.postpone_log_read()
    }

    pub fn postpone_terminal_cmd(&self, cmd: &[u8]) -> bool {
        self.ctx.actions.postpone_terminal_cmd(cmd)
    }

    /// 0 when no action is pending
    pub fn requested_action(&self) -> u8 {
        self.ctx.actions.requested_action()
    }

    /// Decode a downlink and route its requests.
    ///
    /// Action requests go to the pending-action slot and wake the mailer;
    /// a settings fragment is applied as a whole or not at all.
    pub fn handle_downlink(&self, bytes: &[u8]) -> Result<()> {
        let downlink = self.ctx.codec.lock().decode(bytes)?;
        let mut refused = false;
        let mut postponed = false;

        if let Some(path) = &downlink.fw_upgrade_path {
            let accepted = self.postpone_upgrade_fw(path.as_bytes());
            postponed |= accepted;
            refused |= !accepted;
        }
        if downlink.log_read {
            let accepted = self.postpone_log_read();
            postponed |= accepted;
            refused |= !accepted;
        }
        if let Some(cmd) = &downlink.terminal_cmd {
            let accepted = self.postpone_terminal_cmd(cmd);
            postponed |= accepted;
            refused |= !accepted;
        }
        if postponed {
            self.ctx.mail_trigger.notify_one();
        }

        if let Some(patch) = &downlink.settings_patch {
            self.ctx.settings.write().apply_json_patch(patch)?;
            info!("Settings updated from downlink");
        }
        if refused {
            return Err(SomError::SlotOccupied);
        }
        Ok(())
    }

    // ---- uplink events ----

    fn send_uplink_event(&self, event: UplinkEvent) {
        self.ctx.stage_uplink_event(event);
        self.pack(false);
    }

    pub fn set_fw_upgrade_event(&self, success: bool) {
        self.send_uplink_event(if success {
            UplinkEvent::FwUpgradeOk
        } else {
            UplinkEvent::FwUpgradeFailed
        });
    }

    pub fn send_event_log_sent(&self) {
        self.send_uplink_event(UplinkEvent::LogsSent);
    }

    pub fn send_event_cmd_result(&self, result: i32) {
        self.send_uplink_event(UplinkEvent::CommandResult(result));
    }

    // ---- network quality ----

    pub fn set_network_quality(&self, quality: NetworkQuality) {
        *self.ctx.network_quality.lock() = Some(quality);
    }

    pub fn network_quality(&self) -> Result<NetworkQuality> {
        (*self.ctx.network_quality.lock())
            .ok_or_else(|| SomError::InvalidArgument("network quality not available".to_string()))
    }

    // ---- boot status ----

    /// User bits that must be set before `DeviceInitOk` is raised
    pub fn set_user_boot_ok_mask(&self, mask: u32) {
        self.ctx.boot.set_user_mask(mask);
    }

    pub fn set_boot_ok_bit(&self, bit: u32) -> Result<()> {
        if self.ctx.boot.set_user_bit(bit)? {
            info!("Device init complete");
            self.ctx.emit(SomEvent::DeviceInitOk, EventData::none());
        }
        Ok(())
    }

    pub fn reset_status_bit(&self, bit: u32) -> Result<()> {
        self.ctx.boot.reset_user_bit(bit)
    }

    pub fn check_boot_ok_mask(&self, mask: u32) -> bool {
        self.ctx.boot.check_mask(mask)
    }

    pub fn boot_status_bits(&self) -> u32 {
        self.ctx.boot.bits()
    }

    /// Called by the host once its persistent logger is running
    pub fn set_logger_boot_ok(&self) {
        self.ctx.boot_ok(LOGGER_BOOT_OK_BIT, SomEvent::LoggerInitOk);
    }

    pub fn critical_error(&self, err: SomError) {
        self.ctx.critical_error(err);
    }

    // ---- events ----

    pub fn on_event<F>(&self, event: SomEvent, f: F)
    where
        F: Fn(SomEvent, &EventData<'_>) + Send + Sync + 'static,
    {
        self.ctx.events.on(event, f);
    }

    pub fn on_any_event<F>(&self, f: F)
    where
        F: Fn(SomEvent, &EventData<'_>) + Send + Sync + 'static,
    {
        self.ctx.events.on_any(f);
    }

    pub fn clear_event_handlers(&self) {
        self.ctx.events.clear();
    }

    // ---- chunked transfer ----

    /// Query the image slot once at boot and report the outcome uplink
    pub async fn check_fw_upgrade_status(&self) -> Result<FwUpgradeStatus> {
        let mut transfer = self.ctx.transfer.lock().await;
        let status = transfer.check_fw_upgrade_status();
        match status {
            FwUpgradeStatus::Success => {
                info!("Running upgraded firmware, confirming image");
                transfer.confirm_image()?;
                drop(transfer);
                self.set_fw_upgrade_event(true);
            }
            FwUpgradeStatus::Failed => {
                warn!("Firmware upgrade was rejected, erasing secondary slot");
                transfer.erase_secondary_slot()?;
                drop(transfer);
                self.set_fw_upgrade_event(false);
            }
            FwUpgradeStatus::None => {}
        }
        Ok(status)
    }

    /// Upload one file block; fails with `LinkBusy` while the mailer holds the link
    pub async fn send_file_chunk(&self, filename: &str, chunk: &[u8], total_size: u32) -> Result<()> {
        let mut transport = self.ctx.transport.try_lock().map_err(|_| SomError::LinkBusy)?;
        let mut transfer = self.ctx.transfer.try_lock().map_err(|_| SomError::LinkBusy)?;
        let timeout = self.ctx.settings.read().ack_timeout();
        let result = transfer
            .send_file_chunk(&mut **transport, filename, chunk, total_size, timeout)
            .await;
        if let Err(e) = &result {
            warn!("Block of {} failed: {}", filename, e);
        }
        result
    }

    pub fn abort_file_upload(&self) -> Result<()> {
        let mut transfer = self.ctx.transfer.try_lock().map_err(|_| SomError::LinkBusy)?;
        transfer.abort_upload();
        Ok(())
    }

    /// Start receiving a firmware image pushed by the host
    pub fn begin_fw_download(&self) -> Result<()> {
        self.ctx
            .transfer
            .try_lock()
            .map_err(|_| SomError::LinkBusy)?
            .begin_download()
    }

    /// Store one firmware block
    pub fn save_fw_chunk(&self, data: &[u8], is_last: bool) -> Result<ChunkOutcome> {
        let mut transfer = self.ctx.transfer.try_lock().map_err(|_| SomError::LinkBusy)?;
        let result = transfer.save_fw_chunk(data, is_last);
        drop(transfer);
        match &result {
            Ok(ChunkOutcome::UpgradeRequested) => {
                self.ctx.emit(SomEvent::FwUpgradeRequested, EventData::none());
            }
            Ok(ChunkOutcome::Continue) | Err(SomError::TransferNotStarted) => {}
            Err(_) => self.ctx.emit(SomEvent::TransferFailed, EventData::none()),
        }
        result
    }

    pub fn erase_secondary_slot(&self) -> Result<()> {
        self.ctx
            .transfer
            .try_lock()
            .map_err(|_| SomError::LinkBusy)?
            .erase_secondary_slot()
    }

    // ---- settings ----

    pub fn settings(&self) -> Settings {
        self.ctx.settings.read().clone()
    }

    /// Apply validated changes to the live settings
    pub fn update_settings<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Settings) -> Result<R>,
    {
        f(&mut self.ctx.settings.write())
    }

    pub fn save_settings(&self) -> Result<()> {
        let json = self.ctx.settings.read().to_json()?;
        self.ctx.storage.overwrite(SETTINGS_FILE, json.as_bytes())?;
        Ok(())
    }

    /// Replace the live settings with the stored document; false if none is stored
    pub fn load_settings(&self) -> Result<bool> {
        let storage = &self.ctx.storage;
        if !storage.list(SETTINGS_FILE)?.iter().any(|n| n == SETTINGS_FILE) {
            return Ok(false);
        }
        let size = storage.file_size(SETTINGS_FILE)? as usize;
        let mut buf = vec![0u8; size];
        let read = storage.read_at(SETTINGS_FILE, 0, &mut buf)?;
        let json = String::from_utf8_lossy(&buf[..read]);
        let settings = Settings::from_json(&json)?;
        *self.ctx.settings.write() = settings;
        Ok(true)
    }

    pub fn storage(&self) -> &dyn Storage {
        self.ctx.storage.as_ref()
    }
}

impl Drop for Sdk {
    fn drop(&mut self) {
        self.shutdown();
    }
}
