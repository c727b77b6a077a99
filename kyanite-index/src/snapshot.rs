//! # HNSW Snapshot
//!
//! On-disk persistence for the proximity graph, node-per-directory:
//!
//! ```text
//! root/
//! ├── global_header.bin      M, M_max, ef_construction, max_level,
//! │                          entry point, active count, dimension
//! ├── nodes/<label>/
//! │   ├── header.bin         u32 max_level, u64 key
//! │   └── edges/<level>.bin  u32 n, u32 neighbor labels
//! └── deleted_nodes.bin      packed f32[D] vectors, no count prefix
//! ```
//!
//! Save writes the global header first, fans one task per non-deleted
//! node across a worker pool, then writes `deleted_nodes.bin` last.
//! Node vectors are not part of the snapshot; load re-resolves them by
//! key from the embedding map. Loaded nodes are installed non-deleted:
//! the deleted-vector sidecar filters them at search time instead.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{info, warn};

use kyanite_core::error::{Error, Result};
use kyanite_core::types::Key;

use crate::hnsw::{HnswIndex, HnswNode};
use crate::pool::WorkerPool;

pub const GLOBAL_HEADER_FILE: &str = "global_header.bin";
pub const DELETED_NODES_FILE: &str = "deleted_nodes.bin";
pub const NODES_DIR: &str = "nodes";
const NODE_HEADER_FILE: &str = "header.bin";
const EDGES_DIR: &str = "edges";

/// Level marker stored for an empty graph.
const NO_LEVEL: u32 = u32::MAX;

/// Self-contained copy of one node, handed to a snapshot task so
/// workers never touch shared graph state.
struct NodeTask {
    label: u32,
    key: Key,
    max_level: u32,
    connections: Vec<Vec<u32>>,
}

/// Persist the graph under `root`. `force_serial` runs the node writes
/// on a single worker, for benchmarking against the parallel path.
pub fn save(index: &HnswIndex, root: impl AsRef<Path>, force_serial: bool) -> Result<()> {
    let root = root.as_ref();
    let nodes_dir = root.join(NODES_DIR);
    std::fs::create_dir_all(&nodes_dir)?;

    write_global_header(index, root)?;

    let mut tasks = Vec::new();
    for (label, node) in index.nodes.iter().enumerate() {
        if node.deleted {
            continue;
        }
        tasks.push(node_task(label, node)?);
    }
    let task_count = tasks.len();

    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let pool = if force_serial {
            WorkerPool::new(1)
        } else {
            WorkerPool::with_default_size()
        };
        info!(
            nodes = task_count,
            workers = pool.size(),
            serial = force_serial,
            "saving HNSW snapshot"
        );
        for task in tasks {
            let dir = nodes_dir.join(task.label.to_string());
            let errors = Arc::clone(&errors);
            pool.execute(move || {
                if let Err(e) = write_node(&dir, &task) {
                    errors.lock().push(format!("node {}: {}", task.label, e));
                }
            })?;
        }
        // Dropping the pool drains the queue and joins the workers.
    }

    let errors = Arc::try_unwrap(errors)
        .map(|m| m.into_inner())
        .unwrap_or_default();
    if !errors.is_empty() {
        for message in &errors {
            warn!(error = %message, "snapshot node write failed");
        }
        return Err(Error::Io {
            message: format!("{} snapshot node writes failed", errors.len()),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                errors.into_iter().next().unwrap_or_default(),
            ),
        });
    }

    write_deleted_vectors(index, root)?;
    info!(nodes = task_count, root = %root.display(), "HNSW snapshot complete");
    Ok(())
}

/// Rebuild the graph from a snapshot under `root`. `resolve` maps a
/// key back to its current vector (normally the embedding map).
/// A missing snapshot is not an error; the graph is left untouched.
/// Any malformed content clears the partially populated graph.
pub fn load(
    index: &mut HnswIndex,
    root: impl AsRef<Path>,
    resolve: impl Fn(Key) -> Option<Vec<f32>>,
) -> Result<()> {
    let root = root.as_ref();
    let header_path = root.join(GLOBAL_HEADER_FILE);
    if !header_path.is_file() {
        info!(root = %root.display(), "no HNSW snapshot found, starting empty");
        return Ok(());
    }

    match load_inner(index, root, &resolve) {
        Ok(loaded) => {
            info!(
                nodes = loaded,
                deleted_vectors = index.persisted_deleted.len(),
                "loaded HNSW snapshot"
            );
            Ok(())
        }
        Err(e) => {
            index.clear();
            Err(e)
        }
    }
}

fn write_global_header(index: &HnswIndex, root: &Path) -> Result<()> {
    let entry_point = u64::try_from(index.entry_point).unwrap_or(0);
    let max_level = index
        .current_max_level
        .map(|l| l as u32)
        .unwrap_or(NO_LEVEL);
    let dimension = index.dimension.unwrap_or(0) as u32;

    let mut writer = BufWriter::new(File::create(root.join(GLOBAL_HEADER_FILE))?);
    writer.write_u32::<LittleEndian>(index.config.m as u32)?;
    writer.write_u32::<LittleEndian>(index.config.m_max as u32)?;
    writer.write_u32::<LittleEndian>(index.config.ef_construction as u32)?;
    writer.write_u32::<LittleEndian>(max_level)?;
    writer.write_u64::<LittleEndian>(entry_point)?;
    writer.write_u64::<LittleEndian>(index.active_len() as u64)?;
    writer.write_u32::<LittleEndian>(dimension)?;
    writer.flush()?;
    Ok(())
}

/// Copy a node into an owned task, checking every label against the
/// u32 on-disk width.
fn node_task(label: usize, node: &HnswNode) -> Result<NodeTask> {
    let narrow = |l: usize| u32::try_from(l).map_err(|_| Error::LabelOverflow { label: l });
    let mut connections = Vec::with_capacity(node.connections.len());
    for level_list in &node.connections {
        let mut narrowed = Vec::with_capacity(level_list.len());
        for &neighbor in level_list {
            narrowed.push(narrow(neighbor)?);
        }
        connections.push(narrowed);
    }
    Ok(NodeTask {
        label: narrow(label)?,
        key: node.key,
        max_level: node.max_level as u32,
        connections,
    })
}

fn write_node(dir: &Path, task: &NodeTask) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut writer = BufWriter::new(File::create(dir.join(NODE_HEADER_FILE))?);
    writer.write_u32::<LittleEndian>(task.max_level)?;
    writer.write_u64::<LittleEndian>(task.key)?;
    writer.flush()?;

    let edges_dir = dir.join(EDGES_DIR);
    std::fs::create_dir_all(&edges_dir)?;
    for (level, neighbors) in task.connections.iter().enumerate() {
        if neighbors.is_empty() {
            continue;
        }
        let mut writer =
            BufWriter::new(File::create(edges_dir.join(format!("{}.bin", level)))?);
        writer.write_u32::<LittleEndian>(neighbors.len() as u32)?;
        for &neighbor in neighbors {
            writer.write_u32::<LittleEndian>(neighbor)?;
        }
        writer.flush()?;
    }
    Ok(())
}

/// Truncate and rewrite the deleted-vector sidecar from the pending
/// list. Written after every node file.
fn write_deleted_vectors(index: &HnswIndex, root: &Path) -> Result<()> {
    let dim = index.dimension.unwrap_or(0);
    let mut writer = BufWriter::new(File::create(root.join(DELETED_NODES_FILE))?);
    let mut written = 0usize;
    for vector in &index.pending_deleted {
        if dim > 0 && vector.len() != dim {
            warn!(len = vector.len(), dim, "skipping deleted vector with stale dimension");
            continue;
        }
        for &component in vector {
            writer.write_f32::<LittleEndian>(component)?;
        }
        written += 1;
    }
    writer.flush()?;
    info!(vectors = written, "wrote deleted-vector sidecar");
    Ok(())
}

fn load_inner(
    index: &mut HnswIndex,
    root: &Path,
    resolve: &impl Fn(Key) -> Option<Vec<f32>>,
) -> Result<usize> {
    let mut file = File::open(root.join(GLOBAL_HEADER_FILE))?;
    let m = file.read_u32::<LittleEndian>()? as usize;
    let m_max = file.read_u32::<LittleEndian>()? as usize;
    let ef_construction = file.read_u32::<LittleEndian>()? as usize;
    let max_level = file.read_u32::<LittleEndian>()?;
    let entry_point = file.read_u64::<LittleEndian>()? as usize;
    let saved_count = file.read_u64::<LittleEndian>()?;
    let dimension = file.read_u32::<LittleEndian>()? as usize;

    if m != index.config.m
        || m_max != index.config.m_max
        || ef_construction != index.config.ef_construction
    {
        warn!(
            saved_m = m,
            saved_m_max = m_max,
            saved_ef = ef_construction,
            "snapshot HNSW parameters differ from live configuration"
        );
    }
    if let Some(live_dim) = index.dimension {
        if dimension != 0 && dimension != live_dim {
            warn!(saved = dimension, live = live_dim, "snapshot dimension differs");
        }
    }

    index.clear();
    if dimension > 0 {
        index.dimension = Some(dimension);
    }

    let nodes_dir = root.join(NODES_DIR);
    let mut loaded = 0usize;
    if nodes_dir.is_dir() {
        for entry in std::fs::read_dir(&nodes_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(label) = name.to_str().and_then(|s| s.parse::<usize>().ok()) else {
                warn!(name = ?name, "skipping node directory with unparsable label");
                continue;
            };
            load_node(index, &entry.path(), label, resolve)?;
            loaded += 1;
        }
    }
    if loaded as u64 != saved_count {
        warn!(loaded, saved = saved_count, "loaded node count differs from header");
    }

    index.entry_point = entry_point;
    index.current_max_level = if max_level == NO_LEVEL {
        None
    } else {
        Some(max_level as usize)
    };

    load_deleted_vectors(index, root)?;
    Ok(loaded)
}

fn load_node(
    index: &mut HnswIndex,
    dir: &Path,
    label: usize,
    resolve: &impl Fn(Key) -> Option<Vec<f32>>,
) -> Result<()> {
    let mut file = File::open(dir.join(NODE_HEADER_FILE))?;
    let max_level = file.read_u32::<LittleEndian>()? as usize;
    let key = file.read_u64::<LittleEndian>()?;

    let mut connections = vec![Vec::new(); max_level + 1];
    let edges_dir = dir.join(EDGES_DIR);
    for (level, slot) in connections.iter_mut().enumerate() {
        let edge_path = edges_dir.join(format!("{}.bin", level));
        if !edge_path.is_file() {
            continue;
        }
        let mut file = File::open(&edge_path)?;
        let count = file.read_u32::<LittleEndian>()? as usize;
        let mut neighbors = Vec::with_capacity(count);
        for _ in 0..count {
            neighbors.push(file.read_u32::<LittleEndian>()? as usize);
        }
        *slot = neighbors;
    }

    // Labels of deleted nodes are absent from the snapshot; fill the
    // gaps with dead placeholders so the arena index stays the label.
    while index.nodes.len() <= label {
        index.nodes.push(HnswNode {
            key: 0,
            max_level: 0,
            vector: Vec::new(),
            connections: Vec::new(),
            deleted: true,
        });
    }
    index.nodes[label] = HnswNode {
        key,
        max_level,
        vector: resolve(key).unwrap_or_default(),
        connections,
        deleted: false,
    };
    index.key_to_label.insert(key, label);
    Ok(())
}

fn load_deleted_vectors(index: &mut HnswIndex, root: &Path) -> Result<()> {
    let path = root.join(DELETED_NODES_FILE);
    if !path.is_file() {
        return Ok(());
    }
    let Some(dim) = index.dimension.filter(|&d| d > 0) else {
        warn!("dimension unknown, cannot read deleted-vector sidecar");
        return Ok(());
    };

    let mut data = Vec::new();
    File::open(&path)?.read_to_end(&mut data)?;
    let stride = dim * 4;
    if data.len() % stride != 0 {
        warn!(
            len = data.len(),
            stride,
            "deleted-vector sidecar has a trailing partial record"
        );
    }
    for chunk in data.chunks_exact(stride) {
        let mut vector = vec![0.0f32; dim];
        LittleEndian::read_f32_into(chunk, &mut vector);
        index.persisted_deleted.push(vector);
    }
    Ok(())
}
