/// Mailer pipeline - delivery of queued uplinks with retry and backoff
///
/// The mailer task drains the outbound queue one message at a time. Each
/// message is transmitted, acknowledged or retried with exponential backoff,
/// and dropped after `max_resend_attempts` failed attempts. Once the queue
/// is empty a single pending action is dispatched on the same link.
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::action::PendingAction;
use crate::contracts::UplinkEvent;
use crate::events::{EventData, SomEvent, MAILER_BOOT_OK_BIT};
use crate::queue::EncodedMessage;
use crate::sdk::SdkContext;
use crate::transport::Transport;
use crate::LOG_FILE_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailerState {
    Idle,
    WaitingForWake,
    Sending,
    AwaitingAck,
    Retrying,
    Done,
    Aborted,
}

/// How the mailer task waits between passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailerWaitMode {
    /// Wake on trigger or after the uplink interval
    #[default]
    WaitOnTimeout,
    /// Wake only on an explicit trigger
    WaitForever,
}

/// Calculate exponential backoff delay
///
/// Formula: delay = min(initial * (BACKOFF_MULTIPLIER ^ attempt), max)
pub fn calculate_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = crate::BACKOFF_MULTIPLIER.saturating_pow(attempt);
    initial.saturating_mul(factor).min(max)
}

/// Retransmission state tracker
///
/// Maintains state for a single message's delivery attempts.
#[derive(Debug, Clone)]
pub struct RetransmissionState {
    /// Message being delivered
    pub message_id: u32,

    /// Failed attempts so far
    pub attempt: u32,

    max_attempts: u32,
}

impl RetransmissionState {
    pub fn new(message_id: u32, max_attempts: u32) -> Self {
        Self {
            message_id,
            attempt: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn record_failure(&mut self) {
        self.attempt += 1;
    }

    /// Check if max attempts exceeded
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay before the next attempt, based on failures so far
    pub fn next_delay(&self, initial: Duration, max: Duration) -> Duration {
        calculate_backoff(self.attempt.saturating_sub(1), initial, max)
    }
}

/// Deliver one message; returns true once it was acknowledged.
///
/// A send error or a missing ACK both count as a failed attempt. After the
/// last allowed attempt the message is dropped and the session is closed.
pub(crate) async fn deliver(
    ctx: &SdkContext,
    transport: &mut dyn Transport,
    msg: &EncodedMessage,
) -> bool {
    let (max_attempts, ack_timeout, initial, max) = {
        let settings = ctx.settings.read();
        (
            u32::from(settings.max_resend_attempts()),
            settings.ack_timeout(),
            settings.initial_backoff(),
            settings.max_backoff(),
        )
    };
    let mut state = RetransmissionState::new(msg.id, max_attempts);
    ctx.emit(SomEvent::UlStart, EventData::value(msg.id as i32));

    loop {
        ctx.set_mailer_state(MailerState::Sending);
        ctx.emit(SomEvent::CoapStart, EventData::value(msg.bytes.len() as i32));

        let acked = match transport.send(&msg.bytes).await {
            Ok(()) => {
                ctx.set_mailer_state(MailerState::AwaitingAck);
                match transport.wait_for_ack(ack_timeout).await {
                    Ok(true) => true,
                    Ok(false) => {
                        debug!("No ACK for message {}", msg.id);
                        ctx.emit(SomEvent::CoapNoAck, EventData::value(msg.id as i32));
                        false
                    }
                    Err(e) => {
                        warn!("Waiting for ACK of message {} failed: {}", msg.id, e);
                        ctx.emit(SomEvent::CoapFail, EventData::value(msg.id as i32));
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Sending message {} failed: {}", msg.id, e);
                ctx.emit(SomEvent::CoapFail, EventData::value(msg.id as i32));
                false
            }
        };

        if acked {
            info!("Message {} delivered after {} retries", msg.id, state.attempt);
            ctx.emit(SomEvent::CoapOk, EventData::value(msg.id as i32));
            ctx.emit(SomEvent::UlDone, EventData::value(msg.id as i32));
            ctx.set_mailer_state(MailerState::Done);
            return true;
        }

        state.record_failure();
        if state.is_exhausted() {
            warn!(
                "Message {} dropped after {} attempts",
                msg.id, state.attempt
            );
            ctx.emit(SomEvent::UlMaxRetry, EventData::value(state.attempt as i32));
            transport.close().await;
            ctx.set_mailer_state(MailerState::Aborted);
            return false;
        }

        let delay = state.next_delay(initial, max);
        info!(
            "Message {} attempt {} failed, retrying in {:?}",
            msg.id, state.attempt, delay
        );
        ctx.set_mailer_state(MailerState::Retrying);
        ctx.emit(SomEvent::UlRetry, EventData::value(state.attempt as i32));
        tokio::time::sleep(delay).await;
    }
}

/// Drain the queue, then dispatch at most one pending action
pub(crate) async fn mail_pass(ctx: &SdkContext) {
    let mut transport = ctx.transport.lock().await;
    loop {
        let next = ctx.queue.lock().pop();
        let Some(msg) = next else { break };
        deliver(ctx, &mut **transport, &msg).await;
    }
    ctx.set_mailer_state(MailerState::Idle);
    dispatch_pending_action(ctx, &mut **transport).await;
}

/// Take at most one pending action and run it.
///
/// While a transfer is active the action stays in the slot and is picked up
/// by a later pass.
async fn dispatch_pending_action(ctx: &SdkContext, transport: &mut dyn Transport) {
    if ctx.actions.requested_action() == 0 {
        return;
    }
    let mut transfer = ctx.transfer.lock().await;
    if transfer.is_active() {
        debug!("Transfer in progress, pending action deferred");
        return;
    }
    let Some(action) = ctx.actions.take() else {
        return;
    };
    let code = i32::from(action.code());
    info!("Dispatching pending action {}", code);
    let (timeout, retries) = {
        let settings = ctx.settings.read();
        (settings.ack_timeout(), settings.file_ul_retries())
    };

    match action {
        PendingAction::FirmwareUpgrade(path) => {
            match transfer.download_image(transport, &path, timeout).await {
                Ok(_) => ctx.emit(SomEvent::FwUpgradeRequested, EventData::bytes(path.as_bytes())),
                Err(e) => {
                    error!("Firmware download of {} failed: {}", path, e);
                    ctx.emit(SomEvent::TransferFailed, EventData::value(code));
                }
            }
        }
        PendingAction::LogRead => {
            let names = match ctx.storage.list(LOG_FILE_PREFIX) {
                Ok(names) => names,
                Err(e) => {
                    error!("Listing log files failed: {}", e);
                    ctx.emit(SomEvent::TransferFailed, EventData::value(code));
                    return;
                }
            };
            for name in &names {
                if let Err(e) = transfer
                    .upload_file(transport, ctx.storage.as_ref(), name, retries, timeout)
                    .await
                {
                    error!("Upload of {} failed: {}", name, e);
                    ctx.emit(SomEvent::TransferFailed, EventData::value(code));
                    return;
                }
            }
            drop(transfer);
            info!("Uploaded {} log file(s)", names.len());
            ctx.stage_uplink_event(UplinkEvent::LogsSent);
            ctx.pack_trigger.notify_one();
        }
        PendingAction::TerminalCommand(cmd) => {
            drop(transfer);
            ctx.emit(SomEvent::TerminalCmd, EventData::bytes(&cmd));
        }
    }
}

/// Mailer task body
pub(crate) async fn run(ctx: Arc<SdkContext>) {
    ctx.boot_ok(MAILER_BOOT_OK_BIT, SomEvent::MailerInitOk);
    info!("Mailer started");
    loop {
        ctx.set_mailer_state(MailerState::WaitingForWake);
        let woke = match ctx.wait_mode() {
            MailerWaitMode::WaitOnTimeout => {
                let interval = ctx.settings.read().uplink_interval();
                tokio::select! {
                    _ = ctx.mail_trigger.notified() => true,
                    _ = ctx.mode_changed.notified() => false,
                    _ = tokio::time::sleep(interval) => {
                        debug!("Mailer woke on uplink interval");
                        true
                    }
                }
            }
            MailerWaitMode::WaitForever => tokio::select! {
                _ = ctx.mail_trigger.notified() => true,
                _ = ctx.mode_changed.notified() => false,
            },
        };
        if woke {
            mail_pass(&ctx).await;
        } else {
            debug!("Mailer wait mode changed to {:?}", ctx.wait_mode());
        }
    }
}
