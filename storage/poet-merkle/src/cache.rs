// Copyright © Poet Contributors
// SPDX-License-Identifier: Apache-2.0

//! On-disk/in-memory hybrid layer cache for the proof tree.
//!
//! Layers `[0, disk_layers)` are append-only files of raw 32-byte records,
//! one per layer, at `<datadir>/merkle-tree.<k>.bin` — no header, chosen per
//! `SPEC_FULL.md` section 9 for interop with the existing deployed state.
//! Layers at or above `disk_layers` are held in memory only. `disk_layers`
//! is fixed at creation for a fresh generation (`MinMemoryLayer`) and
//! rediscovered from whichever layer files already exist on disk when
//! reopening for recovery — a layer that was in-memory before a crash never
//! had a file, so it resumes in-memory again.
//!
//! Any node above `disk_layers`, whether or not this session's in-memory
//! buffer still holds it, can always be recomputed by folding up from the
//! highest on-disk layer: that layer is append-only and covers every leaf
//! added so far, across restarts. [`TreeCacheReader::read`] uses exactly
//! that fact, so an in-memory layer lost to a crash is never unrecoverable
//! — only slower to re-derive.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use poet_hash::{node_hash, Statement, HASH_LEN};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeCacheError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("layer {layer} has {actual} records on disk, expected {expected}")]
    LengthMismatch { layer: u32, actual: u64, expected: u64 },
    #[error("node at layer {layer} index {index} is outside the materialized prefix")]
    NotMaterialized { layer: u32, index: u64 },
    #[error("parked-node snapshot does not match num_leaves' bit pattern")]
    ParkedNodesMismatch,
}

impl TreeCacheError {
    fn io(path: PathBuf, source: std::io::Error) -> Self {
        TreeCacheError::Io { path, source }
    }
}

fn layer_file_path(datadir: &Path, layer: u32) -> PathBuf {
    datadir.join(format!("merkle-tree.{layer}.bin"))
}

/// Number of complete nodes at `layer` once `num_leaves` leaves exist.
fn layer_count(num_leaves: u64, layer: u32) -> u64 {
    num_leaves >> layer
}

enum Layer {
    Disk { writer: BufWriter<File>, count: u64 },
    Memory { nodes: Vec<[u8; HASH_LEN]>, base_index: u64 },
}

/// Write side of the layer cache: appends nodes as the proof tree's
/// cascade completes them, and produces a validated [`TreeCacheReader`]
/// at checkpoint time.
pub struct TreeCacheWriter {
    datadir: PathBuf,
    disk_layers: u32,
    buf_size: usize,
    num_leaves_at_open: u64,
    layers: Vec<Layer>,
}

impl TreeCacheWriter {
    /// Starts a fresh generation: truncates and creates layer files for
    /// `[0, min_memory_layer)`.
    pub fn create(datadir: &Path, min_memory_layer: u32, buf_size: usize) -> Result<Self, TreeCacheError> {
        let mut writer = TreeCacheWriter {
            datadir: datadir.to_path_buf(),
            disk_layers: min_memory_layer,
            buf_size,
            num_leaves_at_open: 0,
            layers: Vec::new(),
        };
        for layer in 0..min_memory_layer {
            let path = layer_file_path(&writer.datadir, layer);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map_err(|source| TreeCacheError::io(path, source))?;
            writer.layers.push(Layer::Disk {
                writer: BufWriter::with_capacity(buf_size, file),
                count: 0,
            });
        }
        Ok(writer)
    }

    /// Reopens whichever `merkle-tree.<k>.bin` files already exist in
    /// `datadir` for append, validating each against `num_leaves`. Layers
    /// above the highest existing file resume in memory, starting at the
    /// count `num_leaves` already implies for them.
    pub fn open_for_recovery(datadir: &Path, buf_size: usize, num_leaves: u64) -> Result<Self, TreeCacheError> {
        let mut writer = TreeCacheWriter {
            datadir: datadir.to_path_buf(),
            disk_layers: 0,
            buf_size,
            num_leaves_at_open: num_leaves,
            layers: Vec::new(),
        };
        let mut layer = 0u32;
        while layer_file_path(&writer.datadir, layer).exists() {
            let path = layer_file_path(&writer.datadir, layer);
            let expected = layer_count(num_leaves, layer);
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .open(&path)
                .map_err(|source| TreeCacheError::io(path.clone(), source))?;
            let len = file
                .metadata()
                .map_err(|source| TreeCacheError::io(path.clone(), source))?
                .len();
            let actual = len / HASH_LEN as u64;
            if actual != expected {
                return Err(TreeCacheError::LengthMismatch { layer, actual, expected });
            }
            writer.layers.push(Layer::Disk {
                writer: BufWriter::with_capacity(buf_size, file),
                count: actual,
            });
            layer += 1;
        }
        writer.disk_layers = layer;
        Ok(writer)
    }

    /// Appends a newly-completed node to `layer`, creating the layer's
    /// in-memory backing lazily the first time it is needed (layers below
    /// `disk_layers` already have files opened by `create`/`open_for_recovery`).
    pub fn append(&mut self, layer: u32, node: &[u8; HASH_LEN]) -> Result<(), TreeCacheError> {
        while self.layers.len() <= layer as usize {
            let l = self.layers.len() as u32;
            let base_index = layer_count(self.num_leaves_at_open, l);
            self.layers.push(Layer::Memory { nodes: Vec::new(), base_index });
        }
        match &mut self.layers[layer as usize] {
            Layer::Disk { writer, count } => {
                let path = layer_file_path(&self.datadir, layer);
                writer.write_all(node).map_err(|source| TreeCacheError::io(path, source))?;
                *count += 1;
            }
            Layer::Memory { nodes, .. } => nodes.push(*node),
        }
        Ok(())
    }

    /// Flushes and fsyncs every disk-backed layer, validating its length
    /// against `num_leaves`, then returns a reader over the resulting
    /// state. Mirrors `treeCache.GetReader()`'s flush-and-validate
    /// contract in `original_source/service/round.go::persistExecution`.
    pub fn checkpoint(&mut self, num_leaves: u64) -> Result<TreeCacheReader<'_>, TreeCacheError> {
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            if let Layer::Disk { writer, count } = layer {
                let layer_no = idx as u32;
                let path = layer_file_path(&self.datadir, layer_no);
                writer.flush().map_err(|source| TreeCacheError::io(path.clone(), source))?;
                writer
                    .get_ref()
                    .sync_all()
                    .map_err(|source| TreeCacheError::io(path, source))?;
                let expected = layer_count(num_leaves, layer_no);
                if *count != expected {
                    return Err(TreeCacheError::LengthMismatch {
                        layer: layer_no,
                        actual: *count,
                        expected,
                    });
                }
            }
        }
        Ok(TreeCacheReader {
            datadir: &self.datadir,
            disk_layers: self.disk_layers,
            layers: &self.layers,
        })
    }
}

/// Read side of the layer cache. Validates bounds against the materialized
/// prefix and reads (or recomputes) any node at `(layer, index)`.
pub struct TreeCacheReader<'a> {
    datadir: &'a Path,
    disk_layers: u32,
    layers: &'a [Layer],
}

impl<'a> TreeCacheReader<'a> {
    /// Reads (or deterministically recomputes) the node at `(layer,
    /// index)`. Fails with [`TreeCacheError::NotMaterialized`] if `index`
    /// falls outside the prefix `num_leaves` leaves have so far completed
    /// at that layer.
    pub fn read(&self, statement: &Statement, layer: u32, index: u64) -> Result<[u8; HASH_LEN], TreeCacheError> {
        if layer < self.disk_layers {
            return self.read_disk(layer, index);
        }
        if let Some(Layer::Memory { nodes, base_index }) = self.layers.get(layer as usize) {
            if index >= *base_index {
                if let Some(v) = nodes.get((index - base_index) as usize) {
                    return Ok(*v);
                }
            }
        }
        if layer == 0 {
            return Err(TreeCacheError::NotMaterialized { layer, index });
        }
        let left = self.read(statement, layer - 1, index * 2)?;
        let right = self.read(statement, layer - 1, index * 2 + 1)?;
        Ok(node_hash(statement, &left, &right))
    }

    fn read_disk(&self, layer: u32, index: u64) -> Result<[u8; HASH_LEN], TreeCacheError> {
        let path = layer_file_path(self.datadir, layer);
        let mut file = File::open(&path).map_err(|source| TreeCacheError::io(path.clone(), source))?;
        let offset = index
            .checked_mul(HASH_LEN as u64)
            .ok_or(TreeCacheError::NotMaterialized { layer, index })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| TreeCacheError::io(path.clone(), source))?;
        let mut buf = [0u8; HASH_LEN];
        file.read_exact(&mut buf)
            .map_err(|_| TreeCacheError::NotMaterialized { layer, index })?;
        Ok(buf)
    }
}
