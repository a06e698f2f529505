//! Performance benchmarks for the hot paths of a worker and a client

use client::entity_cache::EntityCache;
use client::reconciler::{IncrementalUpdate, Reconciler, SnapshotEnvelope};
use server::world::WorldState;
use shared::{decode, encode, EntitySnapshot, Packet};
use std::time::Instant;

/// Benchmarks envelope encoding and decoding of position updates
#[test]
fn benchmark_packet_codec() {
    let packet = Packet::PositionUpdate {
        entity_id: 42,
        x: 123.5,
        y: 456.5,
        revision: Some(1_000),
    };

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = encode(&packet.clone().into_envelope().unwrap()).unwrap();
        let envelope = decode(&bytes).unwrap();
        let _ = Packet::from_envelope(&envelope).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Packet codec: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds even unoptimized
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks snapshot replay over a large pre-snapshot buffer
#[test]
fn benchmark_snapshot_replay() {
    let entities: Vec<EntitySnapshot> = (0..100)
        .map(|id| EntitySnapshot::new(id, "player", 0.0, 0.0))
        .collect();

    let iterations = 100;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut cache = EntityCache::new();
        let mut reconciler = Reconciler::default();

        // Revisions arrive shuffled: descending within each block of ten.
        for block in 0..100u64 {
            for offset in (0..10u64).rev() {
                let revision = block * 10 + offset;
                let entity_id = (revision % 100) as u32;
                let update = if revision % 3 == 0 {
                    IncrementalUpdate::animation(entity_id, "run", Some(revision))
                } else {
                    IncrementalUpdate::position(entity_id, 1.0, 1.0, Some(revision))
                };
                reconciler.on_incremental_update(update, &mut cache).unwrap();
            }
        }

        let report = reconciler.on_snapshot(
            SnapshotEnvelope {
                entities: entities.clone(),
                snapshot_revision: Some(499),
            },
            &mut cache,
        );
        assert_eq!(report.applied.len(), 500);
    }

    let duration = start.elapsed();
    println!(
        "Snapshot replay: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks world mutations on a populated worker
#[test]
fn benchmark_world_updates() {
    let mut world = WorldState::new();
    for id in 0..200 {
        world.add_entity(id, "player");
    }

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let id = (i % 200) as u32;
        world.move_entity(id, (i % 800) as f32, (i % 600) as f32);
    }

    let duration = start.elapsed();
    println!(
        "World updates: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert_eq!(world.revision(), iterations as u64);
    assert!(duration.as_millis() < 1000);
}
