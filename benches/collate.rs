use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use collator::{BlockFileEncoder, Collator, CollatorConfig, GroupChannel, LocalGroup, WriteOptions};

const PAYLOAD: usize = 64 * 1024;

fn solo_collator(max_buffer_size: u64) -> Collator {
    let member: Arc<dyn GroupChannel> = Arc::new(LocalGroup::new(1).unwrap().remove(0));
    // No fsync: measure the collator, not the disk.
    Collator::with_encoder(
        member,
        CollatorConfig::with_max_buffer_size(max_buffer_size),
        Arc::new(BlockFileEncoder::new().with_sync(false)),
    )
    .unwrap()
}

fn bench_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("collate");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    // Budget 0 is synchronous, a small budget gates every write, a large one
    // lets the caller run ahead of the worker.
    for (name, max) in [("scheduled", 0u64), ("gated", PAYLOAD as u64), ("buffered", 256 * PAYLOAD as u64)] {
        group.bench_function(name, |b| {
            b.iter_custom(|iters| {
                let dir = tempfile::tempdir().unwrap();
                let collator = solo_collator(max);
                let payload = vec![7u8; PAYLOAD];

                let start = Instant::now();
                for i in 0..iters {
                    let path = dir.path().join(format!("f{}", i % 16));
                    collator.write("bench", path, payload.clone(), WriteOptions::binary()).unwrap();
                }
                collator.flush();
                start.elapsed()
            })
        });
    }

    group.finish();
}

criterion_group!(collate, bench_paths);
criterion_main!(collate);
