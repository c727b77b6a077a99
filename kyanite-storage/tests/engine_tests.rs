//! # LSM Engine Integration Tests
//!
//! Covers the write path (admission, flush, compaction), the read path
//! (memtable shadowing, level ordering, tombstones), range scans, and
//! reopen recovery.

use bytes::Bytes;
use tempfile::TempDir;

use kyanite_core::config::StorageConfig;
use kyanite_storage::LsmEngine;

fn small_budget() -> StorageConfig {
    StorageConfig {
        // Tiny budget so a handful of records forces a flush.
        run_budget: 32 + 10240 + 2048,
        ..Default::default()
    }
}

fn value_for(key: u64) -> Bytes {
    Bytes::from(format!("value-{:05}", key))
}

#[test]
fn test_put_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();

    for key in 0..128u64 {
        engine.put(key, value_for(key)).unwrap();
    }
    for key in 0..128u64 {
        assert_eq!(engine.get(key).unwrap(), value_for(key));
    }
    assert!(engine.get(999).is_none());
}

#[test]
fn test_delete_hides_key() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();

    for key in 0..128u64 {
        engine.put(key, value_for(key)).unwrap();
    }
    for key in 0..64u64 {
        engine.del(key).unwrap();
    }
    for key in 0..64u64 {
        assert!(engine.get(key).is_none(), "key {} should be deleted", key);
    }
    for key in 64..128u64 {
        assert_eq!(engine.get(key).unwrap(), value_for(key));
    }

    // A later put revives the key.
    engine.put(3, Bytes::from("back")).unwrap();
    assert_eq!(engine.get(3).unwrap(), Bytes::from("back"));
}

#[test]
fn test_flush_and_read_from_runs() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), small_budget()).unwrap();

    for key in 0..200u64 {
        engine.put(key, value_for(key)).unwrap();
    }
    assert!(
        dir.path().join("level-0").is_dir(),
        "small budget must have forced at least one flush"
    );

    for key in (0..200u64).step_by(7) {
        assert_eq!(engine.get(key).unwrap(), value_for(key));
    }
}

#[test]
fn test_update_after_flush_wins() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();

    engine.put(42, Bytes::from("old")).unwrap();
    engine.flush().unwrap();
    engine.put(42, Bytes::from("new")).unwrap();

    assert_eq!(engine.get(42).unwrap(), Bytes::from("new"));

    // Newest run shadows the older one after a second flush too.
    engine.flush().unwrap();
    assert_eq!(engine.get(42).unwrap(), Bytes::from("new"));
}

#[test]
fn test_tombstone_shadows_older_run() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();

    engine.put(9, Bytes::from("alive")).unwrap();
    engine.flush().unwrap();
    engine.del(9).unwrap();
    engine.flush().unwrap();

    assert!(engine.get(9).is_none());
}

#[test]
fn test_scan_merges_memtable_and_runs() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();

    for key in (0..50u64).step_by(2) {
        engine.put(key, value_for(key)).unwrap();
    }
    engine.flush().unwrap();
    for key in (1..50u64).step_by(2) {
        engine.put(key, value_for(key)).unwrap();
    }
    // Overwrite one flushed key from the memtable.
    engine.put(10, Bytes::from("fresh")).unwrap();
    engine.del(20).unwrap();

    let entries = engine.scan(5, 25);
    let keys: Vec<u64> = entries.iter().map(|e| e.key).collect();
    let expected: Vec<u64> = (5..=25).filter(|&k| k != 20).collect();
    assert_eq!(keys, expected);

    let ten = entries.iter().find(|e| e.key == 10).unwrap();
    assert_eq!(ten.value, Bytes::from("fresh"));
}

#[test]
fn test_scan_empty_when_reversed() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
    engine.put(1, Bytes::from("x")).unwrap();
    assert!(engine.scan(5, 1).is_empty());
}

#[test]
fn test_compaction_bounds_level_zero() {
    let dir = TempDir::new().unwrap();
    let config = small_budget();
    let limit = config.level0_limit;
    let mut engine = LsmEngine::open(dir.path(), config.clone()).unwrap();

    // Interleave key ranges so level-0 runs overlap, then force many
    // flushes.
    for round in 0..10u64 {
        for key in 0..64u64 {
            engine.put(key * 10 + round, value_for(key * 10 + round)).unwrap();
        }
        engine.flush().unwrap();
    }

    let level0_files = std::fs::read_dir(dir.path().join("level-0"))
        .map(|rd| rd.count())
        .unwrap_or(0);
    assert!(
        level0_files <= limit,
        "level 0 holds {} files, cap is {}",
        level0_files,
        limit
    );

    // Every key still readable after compaction.
    for round in 0..10u64 {
        for key in (0..64u64).step_by(5) {
            let k = key * 10 + round;
            assert_eq!(engine.get(k).unwrap(), value_for(k), "key {}", k);
        }
    }
}

#[test]
fn test_compaction_drops_tombstones_at_bottom() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), small_budget()).unwrap();

    for key in 0..64u64 {
        engine.put(key, value_for(key)).unwrap();
    }
    engine.flush().unwrap();
    for key in 0..64u64 {
        engine.del(key).unwrap();
    }
    engine.flush().unwrap();

    // Force enough flushes to trigger a level-0 compaction.
    for round in 0..4u64 {
        engine.put(1000 + round, value_for(1000 + round)).unwrap();
        engine.flush().unwrap();
    }

    for key in 0..64u64 {
        assert!(engine.get(key).is_none());
    }
    let entries = engine.scan(0, 63);
    assert!(entries.is_empty());
}

#[test]
fn test_reopen_recovers_state() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
        for key in 0..100u64 {
            engine.put(key, value_for(key)).unwrap();
        }
        engine.del(17).unwrap();
        engine.flush().unwrap();
    }

    let engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
    for key in 0..100u64 {
        if key == 17 {
            assert!(engine.get(key).is_none());
        } else {
            assert_eq!(engine.get(key).unwrap(), value_for(key));
        }
    }
}

#[test]
fn test_reopen_recovers_clock() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
        engine.put(1, Bytes::from("a")).unwrap();
        engine.flush().unwrap();
        engine.put(1, Bytes::from("b")).unwrap();
        engine.flush().unwrap();
    }

    // A new run written after reopen must get a newer timestamp, so the
    // latest value keeps winning.
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
    engine.put(1, Bytes::from("c")).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.get(1).unwrap(), Bytes::from("c"));
}

#[test]
fn test_empty_flush_is_noop() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
    engine.flush().unwrap();
    assert!(!dir.path().join("level-0").is_dir());
}

#[test]
fn test_reset_clears_everything() {
    let dir = TempDir::new().unwrap();
    let mut engine = LsmEngine::open(dir.path(), StorageConfig::default()).unwrap();
    for key in 0..10u64 {
        engine.put(key, value_for(key)).unwrap();
    }
    engine.flush().unwrap();
    engine.put(99, Bytes::from("late")).unwrap();

    engine.reset().unwrap();
    assert!(engine.get(5).is_none());
    assert!(engine.get(99).is_none());
    assert!(!dir.path().join("level-0").is_dir());
}
