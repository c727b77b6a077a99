//! # Hybrid Store Integration Tests
//!
//! End-to-end coverage: point operations, vector search on both the
//! exact and approximate paths, flush and reopen recovery, snapshot
//! round-trips, and deletion filtering.

use std::path::Path;

use tempfile::TempDir;

use kyanite_core::config::{Config, HnswConfig, StorageConfig};
use kyanite_engine::{Embedder, HashEmbedder, HybridStore};

const DIM: usize = 16;

fn config() -> Config {
    Config {
        storage: StorageConfig::default(),
        index: HnswConfig { dimension: DIM, ..Default::default() },
    }
}

fn small_flush_config() -> Config {
    Config {
        storage: StorageConfig {
            run_budget: 32 + 10240 + 2048,
            ..Default::default()
        },
        index: HnswConfig { dimension: DIM, ..Default::default() },
    }
}

fn open(dir: &Path, cfg: Config, snapshot: Option<&Path>) -> HybridStore {
    HybridStore::open(dir, cfg, Box::new(HashEmbedder::new(DIM)), snapshot).unwrap()
}

fn value_for(key: u64) -> String {
    format!("record number {} with some distinguishing text", key)
}

#[test]
fn test_put_get_128_records() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), config(), None);

    for key in 0..128u64 {
        store.put(key, &value_for(key)).unwrap();
    }
    for key in 0..128u64 {
        assert_eq!(store.get(key), value_for(key));
    }
}

#[test]
fn test_delete_first_half() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), config(), None);

    for key in 0..128u64 {
        store.put(key, &value_for(key)).unwrap();
    }
    for key in 0..64u64 {
        assert!(store.del(key).unwrap());
    }
    for key in 0..64u64 {
        assert_eq!(store.get(key), "");
    }
    for key in 64..128u64 {
        assert_eq!(store.get(key), value_for(key));
    }

    // Deleting a missing key reports false.
    assert!(!store.del(5000).unwrap());
}

#[test]
fn test_upsert_vector_wins() {
    let dir = TempDir::new().unwrap();
    let mut store = HybridStore::open(
        dir.path(),
        Config {
            index: HnswConfig { dimension: 4, ..Default::default() },
            ..Default::default()
        },
        Box::new(HashEmbedder::new(4)),
        None,
    )
    .unwrap();

    store
        .put_precomputed(7, "first version", vec![1.0, 0.0, 0.0, 0.0])
        .unwrap();
    store
        .put_precomputed(7, "second version", vec![0.0, 1.0, 0.0, 0.0])
        .unwrap();

    let hits = store.knn_hnsw_vec(&[0.0, 1.0, 0.0, 0.0], 1);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0], (7, "second version".to_string()));
}

#[test]
fn test_dimension_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), config(), None);

    store.put_precomputed(1, "fixes dimension", vec![0.5; DIM]).unwrap();
    let err = store
        .put_precomputed(2, "wrong dimension", vec![0.5; DIM + 1])
        .unwrap_err();
    assert_eq!(err.error_code(), "DIMENSION_MISMATCH");
}

#[test]
fn test_flush_and_random_sampling() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), small_flush_config(), None);

    for key in 0..200u64 {
        store.put(key, &value_for(key)).unwrap();
    }
    assert!(
        dir.path().join("level-0").is_dir(),
        "the small budget must have forced a flush"
    );

    // Deterministic pseudo-random sampling across the key space.
    let mut state = 0xdeadbeefu64;
    for _ in 0..50 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let key = state % 200;
        assert_eq!(store.get(key), value_for(key), "key {}", key);
    }
}

#[test]
fn test_reopen_round_trip_with_knn() {
    let dir = TempDir::new().unwrap();
    let embedder = HashEmbedder::new(DIM);
    {
        let mut store = open(dir.path(), config(), None);
        for key in 0..64u64 {
            store.put(key, &value_for(key)).unwrap();
        }
        // Dropping the store flushes the memtable and the embeddings.
    }

    let store = open(dir.path(), config(), None);
    for key in 0..64u64 {
        assert_eq!(store.get(key), value_for(key));
    }

    // Each record's own vector finds it as the top hit.
    for key in (0..64u64).step_by(9) {
        let query = embedder.embed(&value_for(key));
        let hits = store.knn_vec(&query, 1);
        assert_eq!(hits[0].0, key, "self lookup for key {}", key);
    }
}

#[test]
fn test_knn_exact_ranks_by_similarity() {
    let dir = TempDir::new().unwrap();
    let mut store = HybridStore::open(
        dir.path(),
        Config {
            index: HnswConfig { dimension: 4, ..Default::default() },
            ..Default::default()
        },
        Box::new(HashEmbedder::new(4)),
        None,
    )
    .unwrap();

    store.put_precomputed(1, "east", vec![1.0, 0.0, 0.0, 0.0]).unwrap();
    store.put_precomputed(2, "north", vec![0.0, 1.0, 0.0, 0.0]).unwrap();
    store.put_precomputed(3, "north-east", vec![0.7, 0.7, 0.0, 0.0]).unwrap();

    let hits = store.knn_vec(&[1.0, 0.1, 0.0, 0.0], 2);
    assert_eq!(hits[0].0, 1);
    assert_eq!(hits[1].0, 3);
}

#[test]
fn test_knn_k_zero_is_empty() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), config(), None);
    store.put(1, "anything").unwrap();
    assert!(store.knn_vec(&[0.5; DIM], 0).is_empty());
    assert!(store.knn_hnsw_vec(&[0.5; DIM], 0).is_empty());
}

#[test]
fn test_empty_store_searches() {
    let dir = TempDir::new().unwrap();
    let store = open(dir.path(), config(), None);
    assert!(store.knn_hnsw_vec(&[0.5; DIM], 3).is_empty());
    assert!(store.scan(10, 5).is_empty());
}

#[test]
fn test_string_query_pads_to_k() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), config(), None);
    store.put(1, "only record").unwrap();

    let hits = store.knn_hnsw("an unrelated query", 5);
    assert_eq!(hits.len(), 5, "string queries always return k items");
    assert!(hits.iter().any(|&(key, _)| key == u64::MAX));
}

#[test]
fn test_snapshot_serial_and_parallel_agree() {
    let data_dir = TempDir::new().unwrap();
    let serial_root = TempDir::new().unwrap();
    let parallel_root = TempDir::new().unwrap();
    let embedder = HashEmbedder::new(DIM);
    let query = embedder.embed("a probe query for snapshot agreement");

    let expected: Vec<u64> = {
        let mut store = open(data_dir.path(), config(), None);
        for key in 0..100u64 {
            store.put(key, &value_for(key)).unwrap();
        }
        store.save_snapshot(serial_root.path(), true).unwrap();
        store.save_snapshot(parallel_root.path(), false).unwrap();
        store.knn_hnsw_vec(&query, 5).into_iter().map(|(k, _)| k).collect()
    };

    for root in [serial_root.path(), parallel_root.path()] {
        let store = open(data_dir.path(), config(), Some(root));
        let mut got: Vec<u64> = store
            .knn_hnsw_vec(&query, 5)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let mut want = expected.clone();
        got.sort_unstable();
        want.sort_unstable();
        assert_eq!(got, want, "root {:?}", root);
    }
}

#[test]
fn test_deleted_keys_never_resurface_after_snapshot() {
    let data_dir = TempDir::new().unwrap();
    let snapshot_root = TempDir::new().unwrap();

    {
        let mut store = open(data_dir.path(), config(), None);
        for key in 0..100u64 {
            store.put(key, &value_for(key)).unwrap();
        }
        for key in 0..50u64 {
            assert!(store.del(key).unwrap());
        }
        store.save_snapshot(snapshot_root.path(), false).unwrap();
    }

    let store = open(data_dir.path(), config(), Some(snapshot_root.path()));
    for probe in 0..20u64 {
        let hits = store.knn_hnsw(&format!("probe query number {}", probe), 10);
        for (key, _) in hits {
            assert!(
                key >= 50,
                "deleted key {} resurfaced for probe {}",
                key,
                probe
            );
        }
    }
}

#[test]
fn test_reset_clears_all_state() {
    let data_dir = TempDir::new().unwrap();
    let snapshot_root = TempDir::new().unwrap();

    let mut store = open(data_dir.path(), config(), None);
    for key in 0..32u64 {
        store.put(key, &value_for(key)).unwrap();
    }
    store.flush().unwrap();
    store.save_snapshot(snapshot_root.path(), false).unwrap();

    store.reset().unwrap();
    assert_eq!(store.get(5), "");
    assert!(store.knn_hnsw_vec(&[0.5; DIM], 3).is_empty());
    assert!(!data_dir.path().join("embeddings.bin").is_file());
    assert!(!snapshot_root.path().join("global_header.bin").is_file());
    assert!(!snapshot_root.path().join("nodes").is_dir());

    // The store keeps working after a reset.
    store.put(7, "fresh start").unwrap();
    assert_eq!(store.get(7), "fresh start");
}

#[test]
fn test_tombstone_value_put_behaves_like_delete() {
    let dir = TempDir::new().unwrap();
    let mut store = open(dir.path(), config(), None);
    store.put(11, &value_for(11)).unwrap();
    store.put(11, "~DELETED~").unwrap();
    assert_eq!(store.get(11), "");

    let hits = store.knn_hnsw_vec(&HashEmbedder::new(DIM).embed(&value_for(11)), 3);
    assert!(hits.iter().all(|&(key, _)| key != 11));
}
