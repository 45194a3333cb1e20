//! Decoded shard contents and per-shard batch iteration.

use std::path::{Path, PathBuf};

use candle_core::{Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{data_error, IoResultExt, JobResult};

/// A dataset returns (input_ids, target_ids) pairs.
pub trait Dataset {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn get_item(&self, idx: usize) -> (Vec<u32>, Vec<u32>);
}

/// One shard decoded from a flat little-endian u32 token file.
///
/// Sample `i` covers tokens `[i*seq_len, (i+1)*seq_len]`; targets are the
/// inputs shifted by one.
#[derive(Debug)]
pub struct ShardDataset {
    path: PathBuf,
    tokens: Vec<u32>,
    seq_len: usize,
    n_samples: usize,
}

impl ShardDataset {
    pub fn from_tokens(path: impl Into<PathBuf>, tokens: Vec<u32>, seq_len: usize) -> JobResult<Self> {
        let path = path.into();
        if seq_len == 0 {
            return Err(data_error("sequence length must be > 0", &path));
        }
        let n_samples = tokens.len().saturating_sub(1) / seq_len;
        if n_samples == 0 {
            return Err(data_error(
                format!(
                    "{} tokens is fewer than one sample of {} + 1",
                    tokens.len(),
                    seq_len
                ),
                &path,
            ));
        }
        Ok(Self {
            path,
            tokens,
            seq_len,
            n_samples,
        })
    }

    /// Load from a binary file of little-endian u32 values.
    pub fn from_binary_file(path: &Path, seq_len: usize) -> JobResult<Self> {
        let data = std::fs::read(path).with_path(path)?;
        if data.len() % 4 != 0 {
            return Err(data_error(
                format!("{} bytes (not a multiple of 4)", data.len()),
                path,
            ));
        }
        let tokens: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_tokens(path, tokens, seq_len)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Largest token id present, for vocabulary checks.
    pub fn max_token(&self) -> u32 {
        self.tokens.iter().copied().max().unwrap_or(0)
    }
}

impl Dataset for ShardDataset {
    fn len(&self) -> usize {
        self.n_samples
    }

    fn get_item(&self, idx: usize) -> (Vec<u32>, Vec<u32>) {
        let start = idx * self.seq_len;
        let end = start + self.seq_len;
        let input = self.tokens[start..end].to_vec();
        let target = self.tokens[start + 1..end + 1].to_vec();
        (input, target)
    }
}

/// One micro-batch on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, seq_len) u32
    pub input_ids: Tensor,
    /// (batch, seq_len) u32
    pub target_ids: Tensor,
}

impl Batch {
    pub fn from_rows(inputs: &[Vec<u32>], targets: &[Vec<u32>], device: &Device) -> Result<Self> {
        let batch_size = inputs.len();
        let seq_len = inputs.first().map_or(0, Vec::len);
        let input_flat: Vec<u32> = inputs.iter().flatten().copied().collect();
        let target_flat: Vec<u32> = targets.iter().flatten().copied().collect();
        Ok(Self {
            input_ids: Tensor::from_vec(input_flat, (batch_size, seq_len), device)?,
            target_ids: Tensor::from_vec(target_flat, (batch_size, seq_len), device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn num_tokens(&self) -> usize {
        self.input_ids.elem_count()
    }
}

/// Shuffled micro-batches over one shard.
///
/// The final batch may be short; no sample is dropped.
pub struct ShardBatches<'a> {
    dataset: &'a dyn Dataset,
    batch_size: usize,
    indices: Vec<usize>,
    pos: usize,
    device: Device,
}

impl<'a> ShardBatches<'a> {
    pub fn new(dataset: &'a dyn Dataset, batch_size: usize, seed: u64, device: &Device) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        Self {
            dataset,
            batch_size: batch_size.max(1),
            indices,
            pos: 0,
            device: device.clone(),
        }
    }

    pub fn n_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }
}

impl Iterator for ShardBatches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.indices.len() {
            return None;
        }

        let end = (self.pos + self.batch_size).min(self.indices.len());
        let (inputs, targets): (Vec<_>, Vec<_>) = self.indices[self.pos..end]
            .iter()
            .map(|&idx| self.dataset.get_item(idx))
            .unzip();
        self.pos = end;

        Some(Batch::from_rows(&inputs, &targets, &self.device))
    }
}

/// Seed for the batch order of one shard on one rank.
pub fn batch_seed(seed: u64, epoch: u64, cursor: usize, rank: usize) -> u64 {
    seed.wrapping_mul(1_000_003)
        .wrapping_add(epoch.wrapping_mul(10_007))
        .wrapping_add((cursor as u64).wrapping_mul(101))
        .wrapping_add(rank as u64)
}
