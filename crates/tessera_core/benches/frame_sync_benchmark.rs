//! # Frame Sync Benchmark
//!
//! Measures the per-frame cost of the handoff machinery:
//! 1. Write + commit of a snapshot (includes the copy from the last commit)
//! 2. Read + release of the latest snapshot
//! 3. Command queue submit + drain throughput
//!
//! Target: handoff overhead well under 1% of a 16.6ms frame.

#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use tessera_core::{BufferHandle, CommandQueue, EntityInstance, TripleBuffer};

fn populated_buffer(entity_count: u32) -> TripleBuffer {
    let buffer = TripleBuffer::new();
    let mut write = buffer.begin_write();
    for id in 0..entity_count {
        write.upsert_entity(EntityInstance::new(id, [id as f32, 0.0, 0.0], 0, BufferHandle(0)));
    }
    write.commit();
    buffer
}

/// Benchmark commit cost as the scene grows
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("triple_buffer_commit");

    for entity_count in [1_000u32, 10_000, 100_000] {
        let buffer = populated_buffer(entity_count);
        group.throughput(Throughput::Bytes(
            u64::from(entity_count) * EntityInstance::SIZE as u64,
        ));

        group.bench_with_input(BenchmarkId::new("write_commit", entity_count), &entity_count, |b, _| {
            b.iter(|| {
                let mut write = buffer.begin_write();
                if let Some(entity) = write.entity_mut(0) {
                    entity.set_position([1.0, 2.0, 3.0]);
                }
                black_box(write.commit());
            });
        });
    }

    group.finish();
}

/// Benchmark the consumer side, fresh and stale
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("triple_buffer_read");
    let buffer = populated_buffer(10_000);

    group.bench_function("start_finish_stale", |b| {
        b.iter(|| {
            let read = buffer.start_read();
            black_box(read.entities().len());
            black_box(read.finish());
        });
    });

    group.bench_function("commit_during_read", |b| {
        b.iter(|| {
            let read = buffer.start_read();
            buffer.begin_write().commit();
            black_box(read.finish());
        });
    });

    group.finish();
}

/// Benchmark command queue drain and inline execution
fn bench_command_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_queue");

    for batch in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::new("drain", batch), &batch, |b, &batch| {
            b.iter_batched(
                || {
                    // Unbound while filling, so work is queued rather than run inline
                    let queue = CommandQueue::new(batch);
                    for i in 0..batch {
                        let _ = queue.execute(move || {
                            black_box(i);
                        });
                    }
                    queue
                },
                |queue| {
                    queue.bind_current_thread();
                    black_box(queue.drain())
                },
                BatchSize::LargeInput,
            );
        });

        let inline_queue = CommandQueue::new(batch);
        inline_queue.bind_current_thread();
        group.bench_with_input(BenchmarkId::new("inline", batch), &batch, |b, &batch| {
            b.iter(|| {
                for i in 0..batch {
                    let _ = inline_queue.execute(move || {
                        black_box(i);
                    });
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_commit, bench_read, bench_command_queue);
criterion_main!(benches);
