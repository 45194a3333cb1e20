//! # Lockstep Training Orchestrator
//!
//! Drives a data-parallel training job over a sharded dataset, keeping every
//! rank on the same weights despite reduced-precision arithmetic.
//!
//! ## Architecture Overview
//!
//! - **Data**: shard discovery, per-epoch shuffle and rank assignment
//!   ([`data::assign`]), plus a one-ahead background prefetcher
//! - **Synchronization**: gradient accumulation, one flat all-reduce per
//!   boundary, parallel overflow scan and dynamic loss scaling
//! - **Checkpointing**: atomic JSON records, rotation to the newest three,
//!   resume with an optional phase-2 schedule override
//! - **Collectives**: single process, in-process thread group, TCP rendezvous
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lockstep_train::config::JobConfig;
//! use lockstep_train::data::token_file_loader;
//! use lockstep_train::dist::SingleProcess;
//! use lockstep_train::model::TokenPredictor;
//! use lockstep_train::telemetry::NullSink;
//! use lockstep_train::train::Trainer;
//! use candle_core::{DType, Device};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = JobConfig::new("shards/", "checkpoints/");
//! let model = TokenPredictor::new(&config.model, DType::F32, config.seed, &Device::Cpu)?;
//! let loader = token_file_loader(config.max_seq_length);
//! let mut trainer = Trainer::new(config, model, Box::new(SingleProcess), loader, Box::new(NullSink))?;
//! let summary = trainer.run()?;
//! println!("finished at step {}", summary.global_step);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod dist;
pub mod error;
pub mod logging;
pub mod model;
pub mod optim;
pub mod precision;
pub mod sync;
pub mod telemetry;
pub mod train;

pub use error::{JobError, JobResult};
