use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use somlink_core::codec::{MessageCodec, RkyvCodec, UplinkMeta};
use somlink_core::mailer::calculate_backoff;
use somlink_core::queue::{EncodedMessage, OutboundQueue};
use somlink_core::tape::TapeStore;
use somlink_core::{MAX_COLUMNS_COUNT, MAX_TRACKS_COUNT};

fn full_store(tracks_used: usize) -> TapeStore {
    let mut store = TapeStore::new();
    for i in 0..MAX_COLUMNS_COUNT {
        let mut column = [0; MAX_TRACKS_COUNT];
        for (t, slot) in column.iter_mut().take(tracks_used).enumerate() {
            *slot = (i * 100 + t) as i32;
        }
        store.add_column(0, 300, &column).unwrap();
    }
    store
}

fn benchmark_tape_fill(c: &mut Criterion) {
    let column = [42; MAX_TRACKS_COUNT];
    c.bench_function("fill_tape_50_columns", |b| {
        b.iter(|| {
            let mut store = TapeStore::new();
            for _ in 0..MAX_COLUMNS_COUNT {
                store.add_column(0, 300, black_box(&column)).unwrap();
            }
            store
        });
    });
}

fn benchmark_encode(c: &mut Criterion) {
    let snapshot = full_store(4).snapshot();
    let meta = UplinkMeta::periodic(1);
    let mut codec = RkyvCodec::new();

    c.bench_function("encode_full_tape_4_tracks", |b| {
        b.iter(|| {
            codec.encode(black_box(&snapshot), &meta).unwrap();
            codec.encoded_len()
        });
    });

    c.bench_function("is_data_changed_full_tape", |b| {
        b.iter(|| codec.is_data_changed(black_box(&snapshot), &meta));
    });
}

fn benchmark_queue_overflow(c: &mut Criterion) {
    c.bench_function("queue_push_drop_oldest", |b| {
        let mut queue = OutboundQueue::new(5);
        let mut id = 0u32;
        b.iter(|| {
            id = id.wrapping_add(1);
            queue.push(EncodedMessage::new(id, vec![0u8; 256]).unwrap())
        });
    });
}

fn benchmark_backoff(c: &mut Criterion) {
    c.bench_function("calculate_exponential_backoff", |b| {
        b.iter(|| {
            for attempt in 0..10 {
                calculate_backoff(
                    attempt,
                    black_box(Duration::from_secs(300)),
                    black_box(Duration::from_secs(3600)),
                );
            }
        });
    });
}

criterion_group!(
    benches,
    benchmark_tape_fill,
    benchmark_encode,
    benchmark_queue_overflow,
    benchmark_backoff
);
criterion_main!(benches);
