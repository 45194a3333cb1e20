//! Shard discovery, per-epoch ordering and rank assignment.

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{config_error, IoResultExt, JobResult};

/// Substring a file name must contain to count as a training shard.
pub const SHARD_MARKER: &str = "training";

/// Index of the shard `rank` trains at `cursor`.
///
/// Ranks read consecutive shards, so with `world_size <= shard_count` no two
/// ranks share a shard at the same cursor. With more ranks than shards the
/// `world_size % shard_count` term shifts each cursor so that the ranks
/// doubled up on a shard rotate between cursors.
pub fn assign(rank: usize, world_size: usize, shard_count: usize, cursor: usize) -> JobResult<usize> {
    if shard_count == 0 {
        return Err(config_error("no training shards to assign"));
    }
    if rank >= world_size {
        return Err(config_error(format!(
            "rank {} out of range for world size {}",
            rank, world_size
        )));
    }
    let remainder = if world_size > shard_count {
        world_size % shard_count
    } else {
        0
    };
    Ok((cursor * world_size + rank + remainder * cursor) % shard_count)
}

/// The sorted set of shard files under an input directory.
#[derive(Debug, Clone)]
pub struct ShardCatalog {
    files: Vec<PathBuf>,
}

impl ShardCatalog {
    /// List regular files whose name contains [`SHARD_MARKER`], sorted by name.
    pub fn discover(input_dir: &Path) -> JobResult<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(input_dir).with_path(input_dir)? {
            let entry = entry.with_path(input_dir)?;
            let path = entry.path();
            let is_shard = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(SHARD_MARKER));
            if is_shard && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(config_error(format!(
                "no files containing '{}' in {}",
                SHARD_MARKER,
                input_dir.display()
            )));
        }
        Ok(Self { files })
    }

    /// Catalog over an explicit file list (kept in the given order).
    pub fn from_files(files: Vec<PathBuf>) -> JobResult<Self> {
        if files.is_empty() {
            return Err(config_error("shard catalog needs at least one file"));
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Shard order for one epoch.
    ///
    /// Depends only on `(seed, epoch)`, so every rank derives the same order
    /// without communicating.
    pub fn epoch_order(&self, seed: u64, epoch: u64) -> Vec<PathBuf> {
        let mut order = self.files.clone();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch));
        order.shuffle(&mut rng);
        order
    }

    /// Shard indices for every rank at cursors `0..cursors`, one row per cursor.
    pub fn assignment_table(&self, world_size: usize, cursors: usize) -> JobResult<Vec<Vec<usize>>> {
        (0..cursors)
            .map(|cursor| {
                (0..world_size)
                    .map(|rank| assign(rank, world_size, self.len(), cursor))
                    .collect()
            })
            .collect()
    }
}
