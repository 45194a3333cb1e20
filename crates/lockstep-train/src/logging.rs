//! Structured logging for the orchestrator with tracing.
//!
//! Every event carries an `event` field so JSON output can be filtered per
//! kind (loss windows, checkpoints, overflow skips, shard transitions).

use std::path::Path;

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG environment variable (defaults to "info").
/// Outputs JSON-formatted logs for cluster log collection.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lockstep_train=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize human-readable console logging.
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lockstep_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// One logging window's worth of training progress.
#[derive(Debug, Clone)]
pub struct WindowMetrics {
    /// User-visible step (phase offset applied).
    pub step: u64,
    /// Mean micro-batch loss over the window.
    pub average_loss: f64,
    /// Loss of the last micro-batch.
    pub step_loss: f64,
    /// Learning rate of the first parameter group.
    pub learning_rate: f64,
    pub loss_scale: f64,
}

/// Log a completed logging window.
pub fn log_training_window(rank: usize, metrics: &WindowMetrics) {
    let span = span!(Level::INFO, "training_window", step = metrics.step, rank = rank);
    let _enter = span.enter();

    if !metrics.average_loss.is_finite() {
        error!(
            average_loss = metrics.average_loss,
            step = metrics.step,
            event = "loss_not_finite",
            "Average loss is not finite"
        );
    }

    info!(
        average_loss = metrics.average_loss,
        step_loss = metrics.step_loss,
        lr = metrics.learning_rate,
        loss_scale = metrics.loss_scale,
        event = "training_window",
        "Training window completed"
    );
}

/// Log the cross-rank averaged loss of the final partial window.
pub fn log_final_loss(step: u64, final_loss: f64) {
    info!(
        step = step,
        final_loss = final_loss,
        event = "final_loss",
        "Training finished"
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: u64, path: &Path, retained: usize) {
    info!(
        step = step,
        path = %path.display(),
        retained = retained,
        event = "checkpoint_saved",
        "Checkpoint saved"
    );
}

/// Log the deletion of a rotated-out checkpoint.
pub fn log_checkpoint_evicted(path: &Path) {
    debug!(
        path = %path.display(),
        event = "checkpoint_evicted",
        "Removed old checkpoint"
    );
}

/// Log a skipped optimizer step after a non-finite reduction.
pub fn log_overflow_skip(rank: usize, new_scale: f64) {
    warn!(
        rank = rank,
        loss_scale = new_scale,
        event = "gradient_overflow",
        "Gradient overflow, skipping step; reducing loss scale to {}",
        new_scale
    );
}

/// Log loss scale growth after a run of clean steps.
pub fn log_scale_growth(new_scale: f64) {
    debug!(
        loss_scale = new_scale,
        event = "loss_scale_growth",
        "Loss scale increased"
    );
}

/// Log the start of a shard.
pub fn log_shard_start(rank: usize, epoch: u64, cursor: usize, path: &Path, samples: usize) {
    debug!(
        rank = rank,
        epoch = epoch,
        cursor = cursor,
        path = %path.display(),
        samples = samples,
        event = "shard_start",
        "Training on shard"
    );
}

/// Log a resumed job.
pub fn log_resume(path: &Path, global_step: u64, epoch: u64, cursor: usize) {
    info!(
        path = %path.display(),
        global_step = global_step,
        epoch = epoch,
        cursor = cursor,
        event = "resumed",
        "Resumed from checkpoint"
    );
}
