//! End-to-end placement scenarios: balance under construction, incremental
//! membership churn, and snapshot hand-off across replication factors.

use chrono::{Duration, Utc};
use embercache_core::{
    BIN_COUNT, BinManager, BinMappings, Clock, Config, LocationId, ManualClock, SystemClock,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn locations(count: usize, prefix: &str) -> Vec<LocationId> {
    (0..count)
        .map(|i| LocationId::from(format!("{}{}", prefix, i)))
        .collect()
}

/// Walks the public API and checks the placement invariants: per-bin active
/// counts, no duplicate location within a bin, record agreement, and the
/// one-assignment balance spread. Returns active counts per location.
fn assert_invariants(engine: &BinManager) -> HashMap<LocationId, u32> {
    let k = engine.locations_per_bin();
    let active_locations = engine.active_location_count() as u32;
    let expected_per_bin = k.min(active_locations);

    let mut counts: HashMap<LocationId, u32> = HashMap::new();
    for bin in 0..BIN_COUNT {
        let assignments = engine.bin_assignments(bin as u16);
        let mut seen = HashSet::new();
        let mut active = 0u32;
        for assignment in &assignments {
            if assignment.is_active() {
                active += 1;
                assert!(
                    seen.insert(assignment.location.clone()),
                    "bin {} holds {} twice",
                    bin,
                    assignment.location
                );
                *counts.entry(assignment.location.clone()).or_insert(0) += 1;
            }
        }
        assert!(active <= k, "bin {} overfull", bin);
        assert_eq!(active, expected_per_bin, "bin {} underfull", bin);
    }

    for (id, count) in &counts {
        assert_eq!(engine.active_count(id), Some(*count));
        assert!(engine.is_active(id));
    }

    if counts.len() > 1 {
        let min = counts.values().min().unwrap();
        let max = counts.values().max().unwrap();
        assert!(
            max - min <= 1,
            "active counts spread beyond one: {}..{}",
            min,
            max
        );
    }

    counts
}

#[test]
fn initial_balance_at_power_of_two() {
    let engine = BinManager::new(4, locations(8, ""), clock()).unwrap();
    let counts = assert_invariants(&engine);

    assert_eq!(counts.len(), 8);
    for (id, count) in counts {
        assert_eq!(count, 32768, "{} is off balance", id);
    }
    assert_eq!(engine.lookup(&[0x00, 0x80]).len(), 4);
}

#[test]
fn incremental_growth_from_empty() {
    let mut engine = BinManager::new(3, Vec::new(), clock()).unwrap();
    assert!(engine.lookup(&[0x01, 0x02]).is_empty());

    for i in 0..1024usize {
        engine.add_location(LocationId::from(i.to_string()));
        assert_eq!(engine.active_location_count(), i + 1);
        // The full sweep is costly, so sample it on the way up.
        if (i + 1) % 128 == 0 || i < 4 {
            assert_invariants(&engine);
        }
    }

    let counts = assert_invariants(&engine);
    assert_eq!(counts.len(), 1024);
    for count in counts.values() {
        assert_eq!(*count, 192);
    }
}

#[test]
fn growth_through_a_non_power_of_two() {
    let mut engine = BinManager::new(3, locations(1000, "loc-"), clock()).unwrap();
    let counts = assert_invariants(&engine);
    for count in counts.values() {
        assert!(
            *count == 196 || *count == 197,
            "count {} outside 196..=197",
            count
        );
    }

    for i in 1000..1024usize {
        engine.add_location(LocationId::from(format!("loc-{}", i)));
    }

    let counts = assert_invariants(&engine);
    assert_eq!(counts.len(), 1024);
    for count in counts.values() {
        assert_eq!(*count, 192);
    }
}

#[test]
fn removal_replaces_assignments_in_place() {
    let mut engine = BinManager::new(3, locations(10, "n"), clock()).unwrap();
    let victim = LocationId::from("n3");
    let victim_active = engine.active_count(&victim).unwrap();
    assert!(victim_active == 19660 || victim_active == 19661);

    engine.remove_location(&victim);
    let counts = assert_invariants(&engine);

    // Every former assignment is now a tombstone, still in its bin.
    let mut tombstones = 0u32;
    for bin in 0..BIN_COUNT {
        for assignment in engine.bin_assignments(bin as u16) {
            if assignment.location == victim {
                assert!(!assignment.is_active());
                tombstones += 1;
            }
        }
    }
    assert_eq!(tombstones, victim_active);

    // The survivors absorbed the freed assignments evenly.
    assert_eq!(counts.len(), 9);
    let total: u32 = counts.values().sum();
    assert_eq!(total, 3 * 65536);
    assert!(!engine.is_active(&victim));
}

#[test]
fn removal_without_enough_survivors() {
    let mut engine = BinManager::new(3, locations(2, "edge/"), clock()).unwrap();
    engine.remove_location(&LocationId::from("edge/0"));
    assert_invariants(&engine);

    let survivor = LocationId::from("edge/1");
    assert_eq!(engine.active_count(&survivor), Some(65536));

    for bin in [0u16, 1, 9999, 65535] {
        let assignments = engine.bin_assignments(bin);
        assert_eq!(assignments.iter().filter(|a| a.is_active()).count(), 1);
        assert_eq!(assignments.iter().filter(|a| !a.is_active()).count(), 1);
    }
}

#[test]
fn snapshot_restores_identically_at_same_factor() {
    let start = Utc::now();
    let manual = Arc::new(ManualClock::new(start));
    let mut engine = BinManager::new(3, locations(16, "cache-"), manual.clone()).unwrap();
    engine.remove_location(&LocationId::from("cache-7"));

    let snapshot = engine.snapshot();
    let encoded = snapshot.encode();

    let decoded = BinMappings::decode(&encoded).unwrap();
    let restored = BinManager::from_snapshot(3, &decoded, manual.clone()).unwrap();
    assert_invariants(&restored);

    // Rehydrating at the same factor reproduces the byte stream exactly.
    assert_eq!(restored.snapshot().encode(), encoded);
    assert_eq!(restored.active_location_count(), 15);
    assert_eq!(restored.location_count(), 16);
    assert!(!restored.is_active(&LocationId::from("cache-7")));
}

#[test]
fn snapshot_hand_off_to_a_larger_factor() {
    let start = Utc::now();
    let manual = Arc::new(ManualClock::new(start));
    let mut engine = BinManager::new(3, locations(16, "cache-"), manual.clone()).unwrap();
    engine.remove_location(&LocationId::from("cache-7"));

    let snapshot = engine.snapshot();
    let restored = BinManager::from_snapshot(4, &snapshot, manual.clone()).unwrap();
    let counts = assert_invariants(&restored);
    assert_eq!(counts.len(), 15);

    for bin in 0..BIN_COUNT {
        let prior = &snapshot.bins()[bin];
        let current = restored.bin_assignments(bin as u16);

        // Every active assignment from the snapshot is still active.
        let now_active: HashSet<_> = current
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.location.clone())
            .collect();
        for assignment in prior.iter().filter(|a| a.is_active()) {
            assert!(
                now_active.contains(&assignment.location),
                "bin {} dropped {}",
                bin,
                assignment.location
            );
        }

        // Every tombstone survives with its original expiry.
        for assignment in prior.iter().filter(|a| !a.is_active()) {
            assert!(
                current
                    .iter()
                    .any(|a| a.location == assignment.location
                        && a.expires_at == assignment.expires_at),
                "bin {} lost a tombstone for {}",
                bin,
                assignment.location
            );
        }
    }
}

#[test]
fn snapshot_hand_off_to_a_smaller_factor() {
    let engine = BinManager::new(3, locations(16, "cache-"), clock()).unwrap();
    let snapshot = engine.snapshot();

    let restored = BinManager::from_snapshot(2, &snapshot, clock()).unwrap();
    let counts = assert_invariants(&restored);

    // All sixteen locations keep participating at the smaller factor.
    assert_eq!(counts.len(), 16);
    for count in counts.values() {
        assert_eq!(*count, 2 * 65536 / 16);
    }
}

#[test]
fn tombstones_expire_through_prune() {
    let start = Utc::now();
    let manual = Arc::new(ManualClock::new(start));
    let mut engine = BinManager::new(2, locations(6, "n"), manual.clone()).unwrap();

    engine.remove_location(&LocationId::from("n2"));
    manual.advance(Duration::minutes(10));
    engine.remove_location(&LocationId::from("n4"));

    // Horizon between the two removals: only the first batch goes.
    engine.prune(start + Duration::minutes(5));
    assert_invariants(&engine);
    assert_eq!(engine.location_count(), 5);
    assert_eq!(engine.active_count(&LocationId::from("n2")), None);
    assert_eq!(engine.active_count(&LocationId::from("n4")), Some(0));

    engine.prune(start + Duration::minutes(10));
    assert_eq!(engine.location_count(), 4);
}

#[test]
fn config_drives_the_replication_factor() {
    let config = Config::default();
    let engine = BinManager::new(
        config.replication.locations_per_bin,
        locations(8, "node-"),
        clock(),
    )
    .unwrap();
    assert_eq!(engine.locations_per_bin(), 3);
    assert_eq!(engine.lookup(&[0x42, 0x42]).len(), 3);
}
