use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use somlink_core::contracts::{
    check_crc, AckPacket, Datagram, FileBlock, ImageBlock, DATAGRAM_FILE_BLOCK, DATAGRAM_UPLINK,
};
use somlink_core::mailer::calculate_backoff;
use somlink_core::queue::{EncodedMessage, OutboundQueue};
use somlink_core::{
    ChunkOutcome, FileFirmwareSlot, FsStorage, MailerWaitMode, Result, Sdk, SdkBuilder,
    SomError, SomEvent, Storage, Transport, UdpTransport, UplinkEvent, UplinkMessage,
    I_TAPE, MAX_COLUMNS_COUNT, MAX_TRACKS_COUNT,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

#[derive(Default)]
struct Link {
    sent: Vec<Vec<u8>>,
    acks: VecDeque<bool>,
    closed: usize,
}

/// Transport whose ACK outcomes are scripted by the test
struct ScriptedTransport(Arc<Mutex<Link>>);

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.lock().sent.push(bytes.to_vec());
        Ok(())
    }

    async fn wait_for_ack(&mut self, timeout: Duration) -> Result<bool> {
        let acked = self.0.lock().acks.pop_front().unwrap_or(true);
        if !acked {
            tokio::time::sleep(timeout).await;
        }
        Ok(acked)
    }

    async fn send_file_block(&mut self, _block: &FileBlock, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn fetch_block(&mut self, _path: &str, _index: u32, _timeout: Duration) -> Result<ImageBlock> {
        Err(SomError::AckTimeout)
    }

    async fn close(&mut self) {
        self.0.lock().closed += 1;
    }
}

fn scripted_sdk(dir: &tempfile::TempDir) -> (Sdk, Arc<Mutex<Link>>) {
    let link = Arc::new(Mutex::new(Link::default()));
    let storage = FsStorage::new(dir.path().join("fs"), 1 << 20).unwrap();
    let slot = FileFirmwareSlot::open(dir.path().join("fw")).unwrap();
    let sdk = SdkBuilder::new(
        Box::new(ScriptedTransport(Arc::clone(&link))),
        Arc::new(storage),
        Box::new(slot),
    )
    .wait_mode(MailerWaitMode::WaitForever)
    .reset_hook(|| {})
    .build();
    (sdk, link)
}

fn event_stream(sdk: &Sdk) -> UnboundedReceiver<(SomEvent, i32)> {
    let (tx, rx) = unbounded_channel();
    sdk.on_any_event(move |event, data| {
        let _ = tx.send((event, data.value));
    });
    rx
}

/// Receive events until `wanted` arrives; returns everything seen
async fn wait_for(rx: &mut UnboundedReceiver<(SomEvent, i32)>, wanted: SomEvent) -> Vec<SomEvent> {
    let mut seen = Vec::new();
    while let Some((event, _)) = rx.recv().await {
        seen.push(event);
        if event == wanted {
            break;
        }
    }
    seen
}

fn column(v: i32) -> [i32; MAX_TRACKS_COUNT] {
    let mut c = [0; MAX_TRACKS_COUNT];
    c[0] = v;
    c[1] = -v;
    c
}

#[test]
fn test_tape_wrap_preserves_period() {
    let dir = tempfile::tempdir().unwrap();
    let (sdk, _link) = scripted_sdk(&dir);

    sdk.update_period(I_TAPE, 300).unwrap();
    for i in 0..MAX_COLUMNS_COUNT {
        let remaining = sdk.add_column(I_TAPE, 300, &column(i as i32)).unwrap();
        assert_eq!(remaining, MAX_COLUMNS_COUNT - i - 1);
    }
    sdk.add_column(I_TAPE, 300, &column(99)).unwrap();

    assert_eq!(sdk.record_count(I_TAPE).unwrap(), 0);
    assert_eq!(sdk.last_period(I_TAPE).unwrap(), 300);
    assert!(sdk.add_column(7, 300, &column(1)).is_err());

    println!("✓ Tape wrap on column 51: empty tape, period 300 kept");
}

#[test]
fn test_queue_drop_oldest_order() {
    let mut queue = OutboundQueue::new(5);
    let mut drops = 0;
    for id in 1..=6 {
        if queue.push(EncodedMessage::new(id, vec![id as u8]).unwrap()).is_some() {
            drops += 1;
        }
        assert!(queue.len() <= 5);
    }
    let order: Vec<u32> = std::iter::from_fn(|| queue.pop()).map(|m| m.id).collect();
    assert_eq!(order, vec![2, 3, 4, 5, 6]);
    assert_eq!(drops, 1);

    println!("✓ Queue overflow: M1 dropped, M2..M6 delivered in order");
}

#[tokio::test(start_paused = true)]
async fn test_packer_overflow_raises_one_drop_event() {
    let dir = tempfile::tempdir().unwrap();
    let (sdk, _link) = scripted_sdk(&dir);
    let mut events = event_stream(&sdk);
    sdk.start();

    let mut seen = Vec::new();
    for i in 1..=6 {
        sdk.add_column(I_TAPE, 60, &column(i)).unwrap();
        sdk.pack(false);
        seen.extend(wait_for(&mut events, SomEvent::PackerDoneOk).await);
    }
    assert_eq!(sdk.queue_len(), 5);
    assert_eq!(seen.iter().filter(|e| **e == SomEvent::DroppingOldest).count(), 1);

    sdk.shutdown();
    println!("✓ Sixth uplink evicted the oldest queued message");
}

#[tokio::test(start_paused = true)]
async fn test_max_retry_then_next_message() {
    let dir = tempfile::tempdir().unwrap();
    let (sdk, link) = scripted_sdk(&dir);
    sdk.update_settings(|s| s.set_max_resend_attempts(3)).unwrap();
    link.lock().acks.extend([false, false, false]);
    let mut events = event_stream(&sdk);
    sdk.start();

    for i in 1..=2 {
        sdk.add_column(I_TAPE, 60, &column(i)).unwrap();
        sdk.pack(false);
        wait_for(&mut events, SomEvent::PackerDoneOk).await;
    }
    sdk.mail(false);
    let seen = wait_for(&mut events, SomEvent::UlDone).await;

    let no_acks = seen.iter().filter(|e| **e == SomEvent::CoapNoAck).count();
    let max_retry = seen.iter().filter(|e| **e == SomEvent::UlMaxRetry).count();
    assert_eq!(no_acks, 3);
    assert_eq!(max_retry, 1);
    assert_eq!(seen.last(), Some(&SomEvent::UlDone));

    let link = link.lock();
    assert_eq!(link.sent.len(), 4);
    assert_eq!(link.closed, 1);
    let delivered = UplinkMessage::from_bytes(&link.sent[3]).unwrap();
    assert_eq!(delivered.tapes[0].periods[0].columns()[0], column(2));
    assert_eq!(sdk.queue_len(), 0);

    sdk.shutdown();
    println!("✓ Max retry after 3 no-acks, queue advanced to next message");
}

#[test]
fn test_backoff_non_decreasing_and_bounded() {
    let initial = Duration::from_secs(5 * 60);
    let max = Duration::from_secs(3600);
    let delays: Vec<Duration> = (0..10).map(|k| calculate_backoff(k, initial, max)).collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert!(delays.iter().all(|d| *d <= max));
    assert_eq!(delays[0], initial);

    println!("✓ Backoff: {:?}", delays);
}

#[test]
fn test_last_firmware_block_requests_upgrade_once() {
    let dir = tempfile::tempdir().unwrap();
    let (sdk, _link) = scripted_sdk(&dir);

    sdk.begin_fw_download().unwrap();
    assert_eq!(sdk.save_fw_chunk(&[0xAA; 512], false).unwrap(), ChunkOutcome::Continue);
    assert_eq!(
        sdk.save_fw_chunk(&[0xBB; 128], true).unwrap(),
        ChunkOutcome::UpgradeRequested
    );
    assert_eq!(
        sdk.save_fw_chunk(&[0xCC; 16], true),
        Err(SomError::TransferNotStarted)
    );

    let slot = FileFirmwareSlot::open(dir.path().join("fw")).unwrap();
    assert!(somlink_core::FirmwareSlot::state(&slot).upgrade_pending);

    println!("✓ Last block saved, upgrade requested exactly once");
}

#[test]
fn test_pending_action_slot_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let (sdk, _link) = scripted_sdk(&dir);

    assert!(sdk.postpone_upgrade_fw(b"fw/v1.bin"));
    assert!(!sdk.postpone_log_read());
    assert!(!sdk.postpone_terminal_cmd(b"reset"));
    assert!(sdk.postpone_upgrade_fw(b"fw/v2.bin"));
    assert_eq!(sdk.requested_action(), 1);

    println!("✓ Distinct postponement refused while slot occupied");
}

#[tokio::test]
async fn test_udp_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (uplinks_tx, mut uplinks) = unbounded_channel();

    let collector = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let datagram = Datagram::from_bytes(&buf[..n]).unwrap();
            assert!(check_crc(datagram.crc32, &datagram.payload).is_ok());
            if datagram.kind == DATAGRAM_UPLINK || datagram.kind == DATAGRAM_FILE_BLOCK {
                let _ = uplinks_tx.send((datagram.kind, datagram.payload.clone()));
            }
            let ack = AckPacket::ack(datagram.session_id, datagram.message_id, Vec::new());
            server.send_to(&ack.to_bytes().unwrap(), peer).await.unwrap();
        }
    });

    let transport = UdpTransport::connect("127.0.0.1:0", &addr).await.unwrap();
    let storage = FsStorage::new(dir.path().join("fs"), 1 << 20).unwrap();
    storage.overwrite("app_0001.log", b"boot ok\n").unwrap();
    let sdk = SdkBuilder::new(
        Box::new(transport),
        Arc::new(storage),
        Box::new(FileFirmwareSlot::open(dir.path().join("fw")).unwrap()),
    )
    .wait_mode(MailerWaitMode::WaitForever)
    .reset_hook(|| {})
    .build();
    let mut events = event_stream(&sdk);
    sdk.start();

    for i in 0..3 {
        sdk.add_column(I_TAPE, 600, &column(i + 10)).unwrap();
    }
    sdk.pack(false);
    wait_for(&mut events, SomEvent::PackerDoneOk).await;
    sdk.mail(false);
    wait_for(&mut events, SomEvent::UlDone).await;

    let (kind, payload) = uplinks.recv().await.unwrap();
    assert_eq!(kind, DATAGRAM_UPLINK);
    let uplink = UplinkMessage::from_bytes(&payload).unwrap();
    assert_eq!(uplink.event, UplinkEvent::Periodic);
    assert_eq!(uplink.tapes[0].periods[0].period, 600);
    assert_eq!(uplink.tapes[0].periods[0].column_count(), 3);

    // log read runs once the queue is drained, then reports LogsSent
    assert!(sdk.postpone_log_read());
    sdk.mail(false);
    let (kind, payload) = uplinks.recv().await.unwrap();
    assert_eq!(kind, DATAGRAM_FILE_BLOCK);
    let block = FileBlock::from_bytes(&payload).unwrap();
    assert_eq!(block.filename, "app_0001.log");
    assert_eq!(block.data, b"boot ok\n");

    wait_for(&mut events, SomEvent::PackerDoneOk).await;
    sdk.mail(false);
    let (_, payload) = uplinks.recv().await.unwrap();
    assert_eq!(UplinkMessage::from_bytes(&payload).unwrap().event, UplinkEvent::LogsSent);

    sdk.shutdown();
    collector.abort();
    println!("✓ UDP end-to-end: uplink, log upload and LogsSent event delivered");
}

#[test]
fn test_settings_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (sdk, _link) = scripted_sdk(&dir);

    sdk.update_settings(|s| s.set_response_wait_timeout(30)).unwrap();
    assert!(sdk.update_settings(|s| s.set_response_wait_timeout(61)).is_err());
    assert_eq!(sdk.settings().response_wait_timeout(), 30);
    sdk.save_settings().unwrap();

    let json = std::fs::read_to_string(dir.path().join("fs").join("settings.txt")).unwrap();
    assert!(json.contains("\"response_wait_timeout\": 30"));

    sdk.update_settings(|s| s.set_response_wait_timeout(5)).unwrap();
    assert!(sdk.load_settings().unwrap());
    assert_eq!(sdk.settings().response_wait_timeout(), 30);

    println!("✓ Settings persisted as JSON and restored");
}
