//! Training loop coordinator.
//!
//! One coordinator per rank drives an explicit state machine:
//!
//! ```text
//! RunEpoch -> RunShard -> (micro-batches) -> RunShard ... -> RunEpoch ...
//!                                      \-> Done   (global_step >= max_steps)
//! ```
//!
//! While a shard trains, the next shard of the epoch is decoded on the
//! prefetch worker. Every `gradient_accumulation_steps` micro-batches the
//! gradient synchronizer runs one boundary; checkpoints are written by the
//! main rank at the configured cadence and when the step budget is reached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::checkpoint::{self, CheckpointManager, CheckpointRecord};
use crate::config::JobConfig;
use crate::context::JobContext;
use crate::data::{assign, batch_seed, Batch, ShardBatches, ShardCatalog, ShardDataset, ShardLoader, ShardPrefetcher};
use crate::dist::Collective;
use crate::error::{config_error, corrupt_checkpoint, data_error, JobResult};
use crate::logging::{log_final_loss, log_resume, log_shard_start, log_training_window, WindowMetrics};
use crate::model::{assign_flat, flatten_params, TrainableModel};
use crate::optim::{Optimizer, OptimizerSettings};
use crate::precision::{LossScaler, MasterParams};
use crate::sync::GradientSynchronizer;
use crate::telemetry::{BenchmarkRecorder, BenchmarkSummary, RunDescription, TelemetrySink};

/// Counters owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobState {
    /// Applied optimizer steps in this phase
    pub global_step: u64,
    /// Micro-batches processed by this process
    pub training_steps: u64,
    pub epoch: u64,
    /// Loss scale in effect; mirrors the synchronizer's scaler
    pub scale_factor: f64,
    /// Sum of micro-batch losses in the open logging window
    pub average_loss: f64,
}

/// A shard ready to train, with the epoch order it belongs to.
pub struct ShardPlan {
    order: Arc<[PathBuf]>,
    cursor: usize,
    dataset: ShardDataset,
}

impl ShardPlan {
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

pub enum LoopPhase {
    RunEpoch,
    RunShard(ShardPlan),
    Done,
}

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct TrainSummary {
    /// Step as shown to users (phase offset applied)
    pub global_step: u64,
    pub training_steps: u64,
    pub epoch: u64,
    pub skipped_steps: u64,
    /// Cross-rank mean loss of the last window; `None` if no micro-batch ran
    pub final_loss: Option<f64>,
    pub loss_scale: f64,
    pub last_checkpoint: Option<PathBuf>,
    /// Shards this rank trained on, in order
    pub shards_trained: Vec<PathBuf>,
    pub benchmark: Option<BenchmarkSummary>,
}

struct ResumePosition {
    order: Vec<PathBuf>,
    cursor: usize,
}

/// Micro-batches in the final (possibly partial) logging window.
pub fn final_window_micro_batches(training_steps: u64, gas: u64, log_freq: u64) -> u64 {
    let gas = gas.max(1);
    let log_freq = log_freq.max(1);
    let boundaries = (training_steps / gas) % log_freq;
    let boundaries = if boundaries == 0 { log_freq } else { boundaries };
    boundaries * gas
}

pub struct Trainer<M: TrainableModel> {
    config: JobConfig,
    model: M,
    ctx: JobContext,
    catalog: ShardCatalog,
    checkpoints: CheckpointManager,
    state: JobState,
    /// Added to `global_step` for names and logs after a phase-2 resume
    step_offset: u64,
    resume_position: Option<ResumePosition>,
    benchmark: Option<BenchmarkRecorder>,
    epoch_micro_batches: u64,
    skipped_steps: u64,
    last_tick: Option<Instant>,
    final_loss: Option<f64>,
    last_checkpoint: Option<PathBuf>,
    shards_trained: Vec<PathBuf>,
}

impl<M: TrainableModel> Trainer<M> {
    /// Set up one rank: validate, resume, align parameters across ranks and
    /// build the optimizer stack.
    pub fn new(
        config: JobConfig,
        model: M,
        mut collective: Box<dyn Collective>,
        loader: ShardLoader,
        telemetry: Box<dyn TelemetrySink>,
    ) -> JobResult<Self> {
        config.check()?;
        let catalog = ShardCatalog::discover(&config.input_dir)?;

        let resumed = if config.resume_from_checkpoint {
            let found = CheckpointManager::resume(&config.output_dir, config.resume_step)?;
            if found.is_none() {
                return Err(config_error(format!(
                    "resume requested but no checkpoint in {}",
                    config.output_dir.display()
                )));
            }
            found
        } else {
            None
        };
        CheckpointManager::prepare_output_dir(&config.output_dir, config.resume_from_checkpoint)?;

        if let Some((path, record)) = &resumed {
            checkpoint::load_model_state(model.parameters(), &record.model_state)
                .map_err(|e| corrupt_checkpoint(e.to_string(), path))?;
        }

        if collective.world_size() > 1 {
            let mut flat = flatten_params(model.parameters())?;
            collective.broadcast(&mut flat, 0)?;
            assign_flat(model.parameters(), &flat)?;
        }

        let masters = MasterParams::new(model.parameters(), config.precision)?;
        let mut optimizer = Optimizer::new(
            config.optimizer,
            model.parameters(),
            masters.vars(),
            OptimizerSettings {
                lr: config.learning_rate,
                warmup: config.warmup_proportion,
                t_total: config.max_steps,
            },
        )?;
        let mut scaler = LossScaler::new(config.loss_scale, config.precision);

        let mut state = JobState::default();
        let mut step_offset = 0;
        let mut resume_position = None;
        let mut checkpoints = CheckpointManager::new(&config.output_dir);

        if let Some((path, record)) = resumed {
            let mut optimizer_state = record.optimizer_state.clone();
            if config.phase2 {
                step_offset = config.phase1_end_step;
                state.global_step = record.global_step.saturating_sub(config.phase1_end_step);
                optimizer_state.override_phase(
                    state.global_step,
                    config.max_steps,
                    config.warmup_proportion,
                    config.learning_rate,
                );
            } else {
                state.global_step = record.global_step;
                state.epoch = record.epoch;
                resume_position = Some(Self::resume_position(&config, &record)?);
            }
            optimizer
                .import_state(&optimizer_state)
                .map_err(|e| corrupt_checkpoint(e.to_string(), &path))?;
            if let Some(saved) = &record.master_params {
                masters
                    .restore(saved)
                    .map_err(|e| corrupt_checkpoint(e.to_string(), &path))?;
            }
            if scaler.is_dynamic() {
                scaler.restore(record.loss_scale);
            }
            if collective.is_main() {
                checkpoints.adopt_existing()?;
            }
            log_resume(&path, record.global_step, record.epoch, record.shard_cursor);
        }

        let mut synchronizer = GradientSynchronizer::new(masters, optimizer, scaler, config.allreduce_fp16);
        synchronizer.set_global_step(state.global_step);
        state.scale_factor = synchronizer.scale();

        let benchmark = match (&config.benchmark, collective.is_main()) {
            (Some(bench), true) => Some(BenchmarkRecorder::new(bench.clone())),
            _ => None,
        };

        let prefetcher = ShardPrefetcher::new(loader)?;
        let ctx = JobContext::new(collective, prefetcher, synchronizer, telemetry);

        if ctx.is_main() {
            info!(
                shards = catalog.len(),
                world_size = ctx.world_size(),
                batch_size = config.train_batch_size,
                gradient_accumulation_steps = config.gradient_accumulation_steps,
                learning_rate = config.learning_rate,
                max_steps = config.max_steps,
                optimizer = %config.optimizer,
                precision = %config.precision,
                params = model.num_params(),
                "Running training"
            );
        }

        Ok(Self {
            config,
            model,
            ctx,
            catalog,
            checkpoints,
            state,
            step_offset,
            resume_position,
            benchmark,
            epoch_micro_batches: 0,
            skipped_steps: 0,
            last_tick: None,
            final_loss: None,
            last_checkpoint: None,
            shards_trained: Vec::new(),
        })
    }

    fn resume_position(config: &JobConfig, record: &CheckpointRecord) -> JobResult<ResumePosition> {
        let order: Vec<PathBuf> = record.files.iter().map(|f| config.input_dir.join(f)).collect();
        if let Some(missing) = order.iter().find(|p| !p.is_file()) {
            return Err(config_error(format!(
                "checkpoint names shard {} which is not in the input directory",
                missing.display()
            )));
        }
        Ok(ResumePosition {
            order,
            cursor: record.shard_cursor,
        })
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Step as shown in logs and checkpoint names.
    pub fn user_step(&self) -> u64 {
        self.state.global_step + self.step_offset
    }

    /// Drive the state machine until the step budget is spent.
    pub fn run(&mut self) -> JobResult<TrainSummary> {
        let mut phase = LoopPhase::RunEpoch;
        loop {
            phase = match phase {
                LoopPhase::RunEpoch => self.start_epoch()?,
                LoopPhase::RunShard(plan) => self.run_shard(plan)?,
                LoopPhase::Done => break,
            };
        }
        self.finish()
    }

    fn budget_spent(&self) -> bool {
        self.state.global_step >= self.config.max_steps
    }

    fn shard_for(&self, order: &[PathBuf], cursor: usize) -> JobResult<PathBuf> {
        let idx = assign(self.ctx.rank(), self.ctx.world_size(), order.len(), cursor)?;
        Ok(order[idx].clone())
    }

    fn start_epoch(&mut self) -> JobResult<LoopPhase> {
        if self.budget_spent() {
            return Ok(LoopPhase::Done);
        }
        let (order, cursor) = match self.resume_position.take() {
            Some(pos) if pos.cursor < pos.order.len() => (pos.order, pos.cursor),
            Some(_) => {
                // The saved position was the end of its epoch.
                self.state.epoch += 1;
                (self.catalog.epoch_order(self.config.seed, self.state.epoch), 0)
            }
            None => (self.catalog.epoch_order(self.config.seed, self.state.epoch), 0),
        };
        self.epoch_micro_batches = 0;

        let order: Arc<[PathBuf]> = order.into();
        let first = self.shard_for(&order, cursor)?;
        let ticket = self.ctx.prefetcher.submit(&first)?;
        let dataset = self.ctx.prefetcher.wait(ticket)?;
        Ok(LoopPhase::RunShard(ShardPlan { order, cursor, dataset }))
    }

    fn run_shard(&mut self, plan: ShardPlan) -> JobResult<LoopPhase> {
        let next_cursor = plan.cursor + 1;
        let ticket = if next_cursor < plan.order.len() {
            let next = self.shard_for(&plan.order, next_cursor)?;
            Some(self.ctx.prefetcher.submit(&next)?)
        } else {
            None
        };

        let vocab = self.config.model.padded_vocab_size();
        if plan.dataset.max_token() as usize >= vocab {
            return Err(data_error(
                format!(
                    "token id {} outside the vocabulary of {}",
                    plan.dataset.max_token(),
                    vocab
                ),
                plan.dataset.path(),
            ));
        }

        log_shard_start(
            self.ctx.rank(),
            self.state.epoch,
            plan.cursor,
            plan.dataset.path(),
            crate::data::Dataset::len(&plan.dataset),
        );
        self.shards_trained.push(plan.dataset.path().to_path_buf());

        if self.train_on_shard(&plan)? {
            if let Some(ticket) = ticket {
                self.ctx.prefetcher.cancel(ticket);
            }
            return Ok(LoopPhase::Done);
        }

        match ticket {
            Some(ticket) => {
                let dataset = self.ctx.prefetcher.wait(ticket)?;
                Ok(LoopPhase::RunShard(ShardPlan {
                    order: plan.order,
                    cursor: next_cursor,
                    dataset,
                }))
            }
            None => {
                if self.epoch_micro_batches == 0 {
                    return Err(config_error(format!(
                        "epoch {} produced no micro-batches",
                        self.state.epoch
                    )));
                }
                self.state.epoch += 1;
                Ok(LoopPhase::RunEpoch)
            }
        }
    }

    /// Train every micro-batch of one shard. Returns true once the budget is spent.
    fn train_on_shard(&mut self, plan: &ShardPlan) -> JobResult<bool> {
        let seed = batch_seed(self.config.seed, self.state.epoch, plan.cursor, self.ctx.rank());
        let batches = ShardBatches::new(
            &plan.dataset,
            self.config.train_batch_size,
            seed,
            self.model.device(),
        );
        for batch in batches {
            if self.micro_step(&batch?, plan)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn micro_step(&mut self, batch: &Batch, plan: &ShardPlan) -> JobResult<bool> {
        let now = Instant::now();
        let micro_batch_time = self.last_tick.map(|t| now - t);
        self.last_tick = Some(now);

        self.state.training_steps += 1;
        self.epoch_micro_batches += 1;
        let gas = self.config.gradient_accumulation_steps.max(1) as u64;

        let loss = self.model.loss(batch)?;
        let step_loss = loss.to_scalar::<f32>()? as f64;
        // Scaled for reduced precision and divided so the boundary sees the mean gradient.
        let grads = (loss * (self.ctx.synchronizer.scale() / gas as f64))?.backward()?;
        self.ctx
            .synchronizer
            .accumulate(&grads, self.model.parameters())?;
        self.state.average_loss += step_loss;

        if self.state.training_steps % gas == 0 {
            let outcome = self.ctx.synchronize()?;
            if !outcome.applied() {
                self.skipped_steps += 1;
            }
            if let Some(bench) = &mut self.benchmark {
                bench.record_weight_update(outcome.update_time);
            }
            self.state.global_step = outcome.global_step;
            self.state.scale_factor = outcome.loss_scale;
        }

        let done = self.budget_spent();
        let window = self.config.log_freq as u64 * gas;
        if done {
            let n = final_window_micro_batches(self.state.training_steps, gas, self.config.log_freq as u64);
            let local = self.state.average_loss / n as f64;
            let final_loss = self.ctx.collective.all_reduce_mean(local)?;
            self.final_loss = Some(final_loss);
            if self.ctx.is_main() {
                log_final_loss(self.user_step(), final_loss);
            }
        } else if self.state.training_steps % window == 0 {
            if self.ctx.is_main() {
                log_training_window(
                    self.ctx.rank(),
                    &WindowMetrics {
                        step: self.user_step(),
                        average_loss: self.state.average_loss / window as f64,
                        step_loss,
                        learning_rate: self.ctx.synchronizer.optimizer().current_lr(),
                        loss_scale: self.state.scale_factor,
                    },
                );
            }
            self.state.average_loss = 0.0;
        }

        if let (Some(bench), Some(elapsed)) = (&mut self.benchmark, micro_batch_time) {
            bench.observe(
                self.state.training_steps,
                self.config.max_seq_length,
                self.config.train_batch_size * self.ctx.world_size(),
                elapsed,
            );
        }

        if done || self.state.training_steps % self.config.checkpoint_period() == 0 {
            if self.ctx.is_main() {
                let record = self.checkpoint_record(plan)?;
                self.last_checkpoint = Some(self.checkpoints.save(&record)?);
            }
        }

        Ok(done)
    }

    fn checkpoint_record(&self, plan: &ShardPlan) -> JobResult<CheckpointRecord> {
        let sync = &self.ctx.synchronizer;
        Ok(CheckpointRecord {
            global_step: self.user_step(),
            epoch: self.state.epoch,
            // Resume continues with the next shard; the rest of this one is skipped.
            shard_cursor: plan.cursor + 1,
            files: plan
                .order
                .iter()
                .map(|p| {
                    p.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                })
                .collect(),
            model_state: checkpoint::model_state(self.model.parameters())?,
            optimizer_state: sync.optimizer().export_state()?,
            master_params: sync.masters().export()?,
            loss_scale: sync.scale(),
        })
    }

    fn finish(&mut self) -> JobResult<TrainSummary> {
        let benchmark = match &self.benchmark {
            Some(recorder) => {
                let world_size = self.ctx.world_size();
                let summary = recorder.summarize(RunDescription {
                    precision: self.config.precision,
                    gradient_accumulation: self.config.gradient_accumulation_steps,
                    optimizer: self.config.optimizer,
                    world_size,
                    num_nodes: world_size.div_ceil(self.config.nproc_per_node.max(1)),
                });
                self.ctx.telemetry.emit(&summary)?;
                Some(summary)
            }
            None => None,
        };

        Ok(TrainSummary {
            global_step: self.user_step(),
            training_steps: self.state.training_steps,
            epoch: self.state.epoch,
            skipped_steps: self.skipped_steps,
            final_loss: self.final_loss,
            loss_scale: self.state.scale_factor,
            last_checkpoint: self.last_checkpoint.clone(),
            shards_trained: self.shards_trained.clone(),
            benchmark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::token_file_loader;
    use crate::dist::SingleProcess;
    use crate::model::TokenPredictor;
    use crate::telemetry::NullSink;
    use candle_core::{DType, Device};
    use std::path::Path;

    fn write_shard(dir: &Path, name: &str, n_tokens: u32, offset: u32) {
        let bytes: Vec<u8> = (0..n_tokens)
            .flat_map(|i| ((i * 7 + offset) % 30).to_le_bytes())
            .collect();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    fn trainer(config: JobConfig) -> Trainer<TokenPredictor> {
        let model = TokenPredictor::new(&config.model, DType::F32, config.seed, &Device::Cpu).unwrap();
        Trainer::new(
            config.clone(),
            model,
            Box::new(SingleProcess),
            token_file_loader(config.max_seq_length),
            Box::new(NullSink),
        )
        .unwrap()
    }

    #[test]
    fn test_final_window_size() {
        assert_eq!(final_window_micro_batches(12, 4, 1), 4);
        assert_eq!(final_window_micro_batches(12, 4, 2), 4);
        assert_eq!(final_window_micro_batches(16, 4, 2), 8);
        assert_eq!(final_window_micro_batches(5, 1, 10), 5);
    }

    #[test]
    fn test_runs_to_budget_single_rank() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        write_shard(&input, "training_0.bin", 41, 0);
        write_shard(&input, "training_1.bin", 41, 3);

        let mut config = JobConfig::tiny(&input, &output);
        config.max_steps = 3;
        config.num_steps_per_checkpoint = 100;
        let mut t = trainer(config);
        let summary = t.run().unwrap();

        assert_eq!(summary.global_step, 3);
        assert_eq!(summary.training_steps, 3);
        assert!(summary.final_loss.unwrap().is_finite());
        // Saved at the budget even off-cadence.
        assert_eq!(summary.last_checkpoint, Some(output.join("ckpt_3.json")));
    }

    #[test]
    fn test_epochs_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        // One sample per shard: one micro-batch per shard.
        write_shard(&input, "training_a.bin", 9, 0);
        write_shard(&input, "training_b.bin", 9, 1);

        let mut config = JobConfig::tiny(&input, &output);
        config.max_steps = 5;
        let mut t = trainer(config);
        let summary = t.run().unwrap();
        assert_eq!(summary.training_steps, 5);
        assert_eq!(summary.epoch, 2);
        // The abandoned prefetch may or may not have finished.
        assert!(t.context().prefetcher.shards_loaded() >= 5);
    }

    #[test]
    fn test_unrelated_files_ignored_and_empty_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("notes.txt"), b"hello").unwrap();
        let config = JobConfig::tiny(&input, dir.path().join("out"));
        let model = TokenPredictor::new(&config.model, DType::F32, 0, &Device::Cpu).unwrap();
        let err = Trainer::new(
            config,
            model,
            Box::new(SingleProcess),
            token_file_loader(8),
            Box::new(NullSink),
        )
        .err()
        .unwrap();
        assert!(err.is_startup_error());
    }
}
