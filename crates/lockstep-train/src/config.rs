//! Job configuration for distributed pretraining runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{config_error, IoResultExt, JobResult};
use crate::optim::OptimizerKind;

/// Dynamic loss scaling starts here.
pub const INITIAL_LOSS_SCALE: f64 = 1_048_576.0; // 2^20

fn default_max_seq_length() -> usize {
    512
}

fn default_train_batch_size() -> usize {
    32
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_max_steps() -> u64 {
    1000
}

fn default_warmup_proportion() -> f64 {
    0.01
}

fn default_seed() -> u64 {
    42
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_log_freq() -> usize {
    1
}

fn default_num_steps_per_checkpoint() -> u64 {
    100
}

fn default_phase1_end_step() -> u64 {
    7038
}

fn default_nproc_per_node() -> usize {
    1
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_benchmark_log_interval() -> usize {
    100
}

fn default_benchmark_start() -> u64 {
    1000
}

fn default_benchmark_stop() -> u64 {
    2000
}

/// Arithmetic width of the working parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
}

impl Precision {
    pub fn is_reduced(self) -> bool {
        matches!(self, Precision::Fp16)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Fp32 => write!(f, "fp32"),
            Precision::Fp16 => write!(f, "fp16"),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fp32" | "f32" | "full" => Ok(Precision::Fp32),
            "fp16" | "f16" | "half" => Ok(Precision::Fp16),
            other => Err(format!("unknown precision '{}'; expected fp32 or fp16", other)),
        }
    }
}

/// How the loss scale evolves during a reduced-precision run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LossScaleMode {
    /// Start at 2^20, halve on overflow, grow after a run of clean steps
    #[default]
    Dynamic,
    /// Fixed scale; overflowing steps are still skipped
    Static { scale: f64 },
}

impl LossScaleMode {
    /// Command-line convention: 0 selects dynamic scaling.
    pub fn from_flag(value: f64) -> Self {
        if value == 0.0 {
            LossScaleMode::Dynamic
        } else {
            LossScaleMode::Static { scale: value }
        }
    }
}

/// Shape of the reference model, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelShape {
    /// Vocabulary size before padding
    pub vocab_size: usize,
    /// Embedding width
    pub hidden_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl ModelShape {
    pub fn from_json_file(path: &Path) -> JobResult<Self> {
        let raw = std::fs::read_to_string(path).with_path(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            config_error(format!("invalid model config {}: {}", path.display(), e))
        })
    }

    /// Vocabulary rounded up to a multiple of 8.
    pub fn padded_vocab_size(&self) -> usize {
        self.vocab_size.div_ceil(8) * 8
    }
}

impl Default for ModelShape {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 128,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

/// Throughput recording window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Directory receiving the summary file
    pub dir: PathBuf,
    /// Micro-batches between records
    #[serde(default = "default_benchmark_log_interval")]
    pub log_interval: usize,
    /// First micro-batch (exclusive) recorded
    #[serde(default = "default_benchmark_start")]
    pub start: u64,
    /// Last micro-batch (inclusive) recorded
    #[serde(default = "default_benchmark_stop")]
    pub stop: u64,
}

/// Complete description of one training job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Directory holding the shard files
    pub input_dir: PathBuf,
    /// Directory receiving checkpoints
    pub output_dir: PathBuf,
    #[serde(default)]
    pub model: ModelShape,

    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Sequences per micro-batch on each rank
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Global step budget
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Fraction of `max_steps` spent in linear warmup
    #[serde(default = "default_warmup_proportion")]
    pub warmup_proportion: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,

    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub loss_scale: LossScaleMode,
    /// Round the reduction buffer through f16
    #[serde(default)]
    pub allreduce_fp16: bool,
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Optimizer steps per logging window
    #[serde(default = "default_log_freq")]
    pub log_freq: usize,
    #[serde(default = "default_num_steps_per_checkpoint")]
    pub num_steps_per_checkpoint: u64,

    #[serde(default)]
    pub resume_from_checkpoint: bool,
    /// Explicit step to resume from; `None` picks the newest checkpoint
    #[serde(default)]
    pub resume_step: Option<u64>,
    /// Second phase of a two-phase schedule
    #[serde(default)]
    pub phase2: bool,
    #[serde(default = "default_phase1_end_step")]
    pub phase1_end_step: u64,

    #[serde(default)]
    pub benchmark: Option<BenchmarkConfig>,
    #[serde(default = "default_nproc_per_node")]
    pub nproc_per_node: usize,
}

impl JobConfig {
    /// Config with defaults for everything but the two directories.
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            model: ModelShape::default(),
            max_seq_length: default_max_seq_length(),
            train_batch_size: default_train_batch_size(),
            learning_rate: default_learning_rate(),
            max_steps: default_max_steps(),
            warmup_proportion: default_warmup_proportion(),
            seed: default_seed(),
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            precision: Precision::default(),
            loss_scale: LossScaleMode::default(),
            allreduce_fp16: false,
            optimizer: OptimizerKind::default(),
            log_freq: default_log_freq(),
            num_steps_per_checkpoint: default_num_steps_per_checkpoint(),
            resume_from_checkpoint: false,
            resume_step: None,
            phase2: false,
            phase1_end_step: default_phase1_end_step(),
            benchmark: None,
            nproc_per_node: default_nproc_per_node(),
        }
    }

    /// Tiny configuration for tests and local smoke runs.
    pub fn tiny(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: ModelShape {
                vocab_size: 30,
                hidden_size: 8,
                layer_norm_eps: 1e-5,
            },
            max_seq_length: 8,
            train_batch_size: 2,
            learning_rate: 1e-3,
            max_steps: 4,
            warmup_proportion: 0.1,
            num_steps_per_checkpoint: 2,
            ..Self::new(input_dir, output_dir)
        }
    }

    /// Micro-batches between checkpoint saves.
    pub fn checkpoint_period(&self) -> u64 {
        self.num_steps_per_checkpoint * self.gradient_accumulation_steps as u64
    }

    /// Validate configuration parameters.
    ///
    /// Returns Ok(()) if valid, or Err with a list of validation errors.
    /// Warnings are logged but do not fail validation.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.gradient_accumulation_steps < 1 {
            errors.push(format!(
                "gradient_accumulation_steps ({}) must be >= 1",
                self.gradient_accumulation_steps
            ));
        }

        if self.train_batch_size == 0 {
            errors.push("train_batch_size must be greater than 0".to_string());
        }

        if self.max_seq_length == 0 {
            errors.push("max_seq_length must be greater than 0".to_string());
        }

        if self.max_steps == 0 {
            errors.push("max_steps must be greater than 0".to_string());
        }

        if self.learning_rate <= 0.0 {
            errors.push(format!("learning rate ({}) must be positive", self.learning_rate));
        }

        if !(0.0..1.0).contains(&self.warmup_proportion) {
            errors.push(format!(
                "warmup_proportion ({}) must be in [0, 1)",
                self.warmup_proportion
            ));
        }

        if self.log_freq == 0 {
            errors.push("log_freq must be greater than 0".to_string());
        }

        if self.num_steps_per_checkpoint == 0 {
            errors.push("num_steps_per_checkpoint must be greater than 0".to_string());
        }

        if self.model.vocab_size == 0 || self.model.hidden_size == 0 {
            errors.push(format!(
                "model shape must be non-empty (vocab_size={}, hidden_size={})",
                self.model.vocab_size, self.model.hidden_size
            ));
        }

        if self.nproc_per_node == 0 {
            errors.push("nproc_per_node must be greater than 0".to_string());
        }

        if let LossScaleMode::Static { scale } = self.loss_scale {
            if !(scale.is_finite() && scale > 0.0) {
                errors.push(format!("static loss scale ({}) must be positive and finite", scale));
            }
        }

        if let Some(bench) = &self.benchmark {
            if bench.log_interval == 0 {
                errors.push("benchmark log_interval must be greater than 0".to_string());
            }
            if bench.stop <= bench.start {
                errors.push(format!(
                    "benchmark stop ({}) must be > start ({})",
                    bench.stop, bench.start
                ));
            }
        }

        if self.resume_step.is_some() && !self.resume_from_checkpoint {
            warnings.push("resume_step is ignored without resume_from_checkpoint".to_string());
        }

        if self.phase2 && !self.resume_from_checkpoint {
            warnings.push(
                "phase2 without resume_from_checkpoint trains from scratch with no step offset"
                    .to_string(),
            );
        }

        if self.allreduce_fp16 && !self.precision.is_reduced() {
            warnings.push("allreduce_fp16 with fp32 parameters rounds gradients to f16".to_string());
        }

        if !self.precision.is_reduced() && matches!(self.loss_scale, LossScaleMode::Static { .. }) {
            warnings.push("static loss scale is ignored for fp32 runs".to_string());
        }

        for warning in &warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// `validate` folded into a single configuration error.
    pub fn check(&self) -> JobResult<()> {
        self.validate()
            .map_err(|errors| config_error(errors.join("; ")))
    }
}
