/// Packer pipeline - turns a trigger and a tape snapshot into queued uplinks
///
/// The packer task sleeps on its trigger. Each wake takes one consistent
/// snapshot of the tapes, encodes it through the codec (splitting it when the
/// result would not fit a datagram) and enqueues the encoded messages.
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::codec::{MessageCodec, UplinkMeta, MAX_ENCODED_LEN};
use crate::contracts::UplinkEvent;
use crate::errors::{Result, SomError};
use crate::events::{EventData, SomEvent, PACKER_BOOT_OK_BIT};
use crate::queue::EncodedMessage;
use crate::sdk::SdkContext;
use crate::tape::StoreSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackerState {
    Idle,
    Triggered,
    Packing,
    Done,
}

/// Encode `snapshot`, halving it column-wise until every part fits
fn encode_split(
    codec: &mut dyn MessageCodec,
    snapshot: &StoreSnapshot,
    meta: &UplinkMeta,
    out: &mut Vec<Vec<u8>>,
) -> Result<()> {
    codec.encode(snapshot, meta)?;
    if codec.is_compression_check_required() {
        debug!("Uplink compacted to {} bytes", codec.encoded_len());
    }
    if !codec.is_udp_packet_full() {
        out.push(codec.encoded_buffer().to_vec());
        return Ok(());
    }

    match snapshot.split() {
        Some((left, right)) => {
            debug!(
                "Uplink of {} columns does not fit, splitting",
                snapshot.column_count()
            );
            encode_split(codec, &left, meta, out)?;
            encode_split(codec, &right, meta, out)
        }
        None => Err(SomError::BufferTooSmall {
            required: usize::from(codec.encoded_len()),
            available: MAX_ENCODED_LEN,
        }),
    }
}

/// Pack one uplink for `event`; returns the number of messages enqueued
fn pack_event(ctx: &SdkContext, event: UplinkEvent, radio_requested: bool) -> Result<usize> {
    let snapshot = {
        let tapes = ctx.tapes.lock();
        tapes.check_invariants()?;
        tapes.snapshot()
    };

    let mut meta = UplinkMeta::periodic(0);
    meta.event = event;
    if radio_requested || ctx.packet_counter.radio_data_due() {
        meta.radio = *ctx.network_quality.lock();
        match meta.radio {
            Some(_) => ctx.packet_counter.reset(),
            None => warn!("Radio data due but network quality is unknown"),
        }
    }
    if meta.radio.is_some() && meta.event == UplinkEvent::Periodic {
        meta.event = UplinkEvent::RadioData;
    }

    if snapshot.is_empty() && meta.radio.is_none() && !meta.event.is_notification() {
        debug!("Nothing to pack");
        return Ok(0);
    }

    let mut codec = ctx.codec.lock();
    if !meta.event.is_notification() && !codec.is_data_changed(&snapshot, &meta) {
        debug!("Tape data unchanged, uplink suppressed");
        return Ok(0);
    }

    meta.packet_counter = ctx.packet_counter.increment();
    let mut encoded = Vec::new();
    if let Err(e) = encode_split(&mut **codec, &snapshot, &meta, &mut encoded) {
        warn!("Packing failed: {}", e);
        ctx.emit(SomEvent::PackingFailed, EventData::none());
        return Err(e);
    }
    drop(codec);

    let count = encoded.len();
    for bytes in encoded {
        let msg = match EncodedMessage::new(ctx.next_message_id(), bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Enqueue failed: {}", e);
                ctx.emit(SomEvent::EnqueueFailed, EventData::none());
                return Err(e);
            }
        };
        ctx.enqueue(msg);
    }

    let mut tapes = ctx.tapes.lock();
    if tapes.snapshot() == snapshot {
        tapes.restart_all();
    } else {
        debug!("Tapes changed while packing, keeping measurements for the next uplink");
    }
    drop(tapes);

    info!(
        "Packed {:?} uplink #{} into {} message(s)",
        meta.event, meta.packet_counter, count
    );
    Ok(count)
}

/// Run one pack cycle: staged uplink events first, otherwise a periodic one
pub(crate) fn pack_now(ctx: &SdkContext) -> Result<usize> {
    ctx.set_packer_state(PackerState::Packing);
    ctx.emit(SomEvent::PackerStarted, EventData::none());

    let mut radio_requested = ctx.take_radio_request();
    let staged = ctx.take_staged_events();
    let events = if staged.is_empty() {
        vec![UplinkEvent::Periodic]
    } else {
        staged
    };

    let mut total = 0;
    let mut result = Ok(());
    for event in events {
        match pack_event(ctx, event, radio_requested) {
            Ok(n) => total += n,
            Err(e) if e.is_critical() => {
                ctx.set_packer_state(PackerState::Idle);
                ctx.critical_error(e.clone());
                return Err(e);
            }
            Err(e) => result = Err(e),
        }
        radio_requested = false;
    }

    if total > 0 {
        ctx.set_packer_state(PackerState::Done);
        ctx.emit(SomEvent::PackerDoneOk, EventData::value(total as i32));
    }
    ctx.set_packer_state(PackerState::Idle);
    result.map(|()| total)
}

/// Packer task body; waits for triggers forever
pub(crate) async fn run(ctx: Arc<SdkContext>) {
    ctx.boot_ok(PACKER_BOOT_OK_BIT, SomEvent::PackerInitOk);
    info!("Packer started");
    loop {
        ctx.pack_trigger.notified().await;
        if let Err(e) = pack_now(&ctx) {
            error!("Pack cycle failed: {}", e);
        }
    }
}
