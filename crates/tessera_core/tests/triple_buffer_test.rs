//! Integration test for the triple-buffered scene state.
//!
//! Role rotation sequences are randomized with a seeded RNG so failures
//! reproduce.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera_core::{BufferHandle, CameraData, EntityInstance, TripleBuffer};

/// Stamps every field the reader checks with the same generation.
fn write_stamped(buffer: &TripleBuffer) -> u64 {
    let mut write = buffer.begin_write();
    let stamp = write.generation() as f32;
    let mut camera = CameraData::default();
    camera.position = [stamp, stamp, stamp, 1.0];
    write.set_camera(camera);
    for id in 0..16 {
        write.upsert_entity(EntityInstance::new(id, [stamp, id as f32, 0.0], 0, BufferHandle(id)));
    }
    write.commit()
}

#[test]
fn test_random_rotation_keeps_write_and_read_apart() {
    let mut rng = StdRng::seed_from_u64(0x7E55_E2A);
    let buffer = TripleBuffer::new();
    let mut last_seen = 0;
    let mut committed = 0;

    for _ in 0..10_000 {
        match rng.gen_range(0..3) {
            0 => {
                committed = write_stamped(&buffer);
            }
            1 => {
                let read = buffer.start_read();
                assert!(read.generation() >= last_seen, "freshness went backwards");
                last_seen = read.generation();

                // Producer commits a few times while the read is held
                for _ in 0..rng.gen_range(0..3) {
                    committed = write_stamped(&buffer);
                    let roles = buffer.roles();
                    assert_ne!(roles.write, roles.read);
                    assert_eq!(roles.read, read.slot());
                }
                read.finish();
            }
            _ => {
                // Abandoned write: nothing published
                let before = buffer.committed_generation();
                drop(buffer.begin_write());
                assert_eq!(buffer.committed_generation(), before);
            }
        }

        let roles = buffer.roles();
        assert_ne!(roles.write, roles.read);
        assert_ne!(roles.write, roles.spare);
        assert_ne!(roles.read, roles.spare);
        assert!(!roles.read_busy);
        assert!(!roles.spare_fresh, "parked snapshot not promoted after read");
    }

    // Idle reader always sees the latest commit
    let read = buffer.start_read();
    assert_eq!(read.generation(), committed);
}

#[test]
fn test_concurrent_reads_are_never_torn() {
    const COMMITS: u64 = 5_000;

    let buffer = Arc::new(TripleBuffer::new());
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let buffer = Arc::clone(&buffer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for _ in 0..COMMITS {
                write_stamped(&buffer);
            }
            done.store(true, Ordering::Release);
        })
    };

    let consumer = {
        let buffer = Arc::clone(&buffer);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = 0;
            let mut reads = 0u64;
            while !done.load(Ordering::Acquire) || reads == 0 {
                let floor = buffer.committed_generation();
                let read = buffer.start_read();
                let generation = read.generation();

                assert!(generation >= floor, "read {generation} older than commit {floor}");
                assert!(generation >= last);
                last = generation;

                if generation > 0 {
                    let stamp = generation as f32;
                    assert_eq!(read.camera().position[0], stamp);
                    assert_eq!(read.entities().len(), 16);
                    assert!(read.entities().iter().all(|e| e.position()[0] == stamp));
                }
                reads += 1;
                read.finish();
            }
            last
        })
    };

    producer.join().unwrap();
    let last_read = consumer.join().unwrap();
    assert!(last_read <= COMMITS);

    // After the producer is done, the next read sees the final commit
    assert_eq!(buffer.start_read().generation(), COMMITS);
    let stats = buffer.stats();
    assert_eq!(stats.commits, COMMITS);
    assert!(stats.true_swaps <= stats.parked_commits);
}

#[test]
fn test_singleton_requested_from_many_threads_applies_once() {
    let buffer = Arc::new(TripleBuffer::new());
    let applied = Arc::new(AtomicU64::new(0));
    {
        let applied = Arc::clone(&applied);
        buffer.register_singleton_action("rebuffer-entities", move |_| {
            applied.fetch_add(1, Ordering::SeqCst);
        });
    }

    let requesters: Vec<_> = (0..8)
        .map(|_| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.request_singleton_action("rebuffer-entities").unwrap())
        })
        .collect();
    let newly_queued = requesters
        .into_iter()
        .map(|r| r.join().unwrap())
        .filter(|queued| *queued)
        .count();

    assert_eq!(newly_queued, 1);
    buffer.begin_write().commit();
    assert_eq!(applied.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deferred_commands_apply_in_submission_order() {
    let buffer = TripleBuffer::new();
    for material in 1..=10 {
        buffer.add_command(move |state| {
            state.upsert_entity(EntityInstance::new(1, [0.0; 3], material, BufferHandle::NONE));
        });
    }
    buffer.begin_write().commit();

    let read = buffer.start_read();
    assert_eq!(read.entity(1).map(|e| e.material), Some(10));
    assert_eq!(buffer.stats().commands_applied, 10);
}

#[test]
fn test_producer_survives_panicking_deferred_commands() {
    let buffer = Arc::new(TripleBuffer::new());

    // Every third command panics; the rest each add one entity
    let submitter = {
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || {
            for id in 0..300u32 {
                if id % 3 == 0 {
                    buffer.add_command(move |_| panic!("callback {id} failed"));
                } else {
                    buffer.add_command(move |state| {
                        state.upsert_entity(EntityInstance::new(id, [0.0; 3], 0, BufferHandle(id)));
                    });
                }
            }
        })
    };

    let mut cycles = 0;
    while !submitter.is_finished() || buffer.pending_commands() > 0 {
        buffer.begin_write().commit();
        cycles += 1;
        assert!(cycles < 1_000_000, "producer stopped making progress");
    }
    submitter.join().unwrap();

    let read = buffer.start_read();
    assert_eq!(read.entities().len(), 200);
    assert_eq!(read.generation(), cycles);
    drop(read);
    assert_eq!(buffer.stats().mutations_failed, 100);
}
