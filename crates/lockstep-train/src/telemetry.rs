//! Benchmark records and the sink that receives the end-of-job summary.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{BenchmarkConfig, Precision};
use crate::error::{IoResultExt, JobResult};
use crate::optim::OptimizerKind;

/// One throughput sample, taken every `log_interval` micro-batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    /// Micro-batch counter at the sample
    pub iteration: u64,
    pub seq_length: usize,
    /// Global batch (per-rank batch times world size)
    pub batch_size: usize,
    pub num_tokens: usize,
    /// Seconds per micro-batch times `log_interval`
    pub elapsed_time: f64,
    pub log_interval: usize,
}

/// Static facts about the run attached to the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDescription {
    pub precision: Precision,
    pub gradient_accumulation: usize,
    pub optimizer: OptimizerKind,
    pub world_size: usize,
    pub num_nodes: usize,
}

/// Means over the recorded window plus derived throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    pub samples: usize,
    pub iteration: f64,
    pub seq_length: f64,
    pub batch_size: f64,
    pub num_tokens: f64,
    pub elapsed_time: f64,
    pub log_interval: f64,
    /// Mean weight-update seconds times the mean log interval
    pub weight_update_time: f64,
    /// Tokens per second
    pub token_throughput: f64,
    #[serde(flatten)]
    pub run: RunDescription,
}

/// Receives the summary once, on the main rank, when the job finishes.
pub trait TelemetrySink: Send {
    fn emit(&mut self, summary: &BenchmarkSummary) -> JobResult<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&mut self, _summary: &BenchmarkSummary) -> JobResult<()> {
        Ok(())
    }
}

/// Writes the summary as pretty JSON under a benchmark directory.
#[derive(Debug, Clone)]
pub struct JsonSummarySink {
    dir: PathBuf,
}

impl JsonSummarySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn summary_path(&self, summary: &BenchmarkSummary) -> PathBuf {
        let run = &summary.run;
        self.dir.join(format!("{}_ranks", run.world_size)).join(format!(
            "benchmark_{}_nodes_batch_size_{}_seq_len_{}_{}_grad_acc_{}.json",
            run.num_nodes,
            summary.batch_size as usize / run.world_size.max(1),
            summary.seq_length as usize,
            run.precision,
            run.gradient_accumulation
        ))
    }
}

impl TelemetrySink for JsonSummarySink {
    fn emit(&mut self, summary: &BenchmarkSummary) -> JobResult<()> {
        let path = self.summary_path(summary);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        let json = serde_json::to_string_pretty(summary)?;
        fs::write(&path, json).with_path(&path)?;
        info!(path = %path.display(), event = "benchmark_summary", "Benchmark summary written");
        Ok(())
    }
}

/// Collects records inside the configured window.
#[derive(Debug, Clone)]
pub struct BenchmarkRecorder {
    config: BenchmarkConfig,
    records: Vec<BenchmarkRecord>,
    weight_update_times: Vec<f64>,
}

fn mean(values: impl ExactSizeIterator<Item = f64>) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    values.sum::<f64>() / n as f64
}

impl BenchmarkRecorder {
    pub fn new(config: BenchmarkConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            weight_update_times: Vec::new(),
        }
    }

    /// Whether micro-batch `training_steps` falls on a sample point.
    pub fn should_record(&self, training_steps: u64) -> bool {
        self.config.log_interval > 0
            && training_steps % self.config.log_interval as u64 == 0
            && training_steps > self.config.start
            && training_steps <= self.config.stop
    }

    /// Sample micro-batch `training_steps`; outside the window this does nothing.
    pub fn observe(
        &mut self,
        training_steps: u64,
        seq_length: usize,
        global_batch: usize,
        micro_batch_time: Duration,
    ) {
        if !self.should_record(training_steps) {
            return;
        }
        let log_interval = self.config.log_interval;
        self.records.push(BenchmarkRecord {
            iteration: training_steps,
            seq_length,
            batch_size: global_batch,
            num_tokens: seq_length * global_batch,
            elapsed_time: micro_batch_time.as_secs_f64() * log_interval as f64,
            log_interval,
        });
    }

    pub fn record_weight_update(&mut self, elapsed: Duration) {
        self.weight_update_times.push(elapsed.as_secs_f64());
    }

    pub fn records(&self) -> &[BenchmarkRecord] {
        &self.records
    }

    pub fn summarize(&self, run: RunDescription) -> BenchmarkSummary {
        let r = &self.records;
        let num_tokens = mean(r.iter().map(|x| x.num_tokens as f64));
        let log_interval = mean(r.iter().map(|x| x.log_interval as f64));
        let elapsed_time = mean(r.iter().map(|x| x.elapsed_time));
        let token_throughput = if elapsed_time > 0.0 {
            num_tokens * log_interval / elapsed_time
        } else {
            0.0
        };
        BenchmarkSummary {
            samples: r.len(),
            iteration: mean(r.iter().map(|x| x.iteration as f64)),
            seq_length: mean(r.iter().map(|x| x.seq_length as f64)),
            batch_size: mean(r.iter().map(|x| x.batch_size as f64)),
            num_tokens,
            elapsed_time,
            log_interval,
            weight_update_time: self.config.log_interval as f64
                * mean(self.weight_update_times.iter().copied()),
            token_throughput,
            run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BenchmarkConfig {
        BenchmarkConfig {
            dir: PathBuf::from("unused"),
            log_interval: 2,
            start: 2,
            stop: 6,
        }
    }

    fn run() -> RunDescription {
        RunDescription {
            precision: Precision::Fp16,
            gradient_accumulation: 4,
            optimizer: OptimizerKind::LayerAdaptive,
            world_size: 2,
            num_nodes: 1,
        }
    }

    #[test]
    fn test_window_is_half_open() {
        let recorder = BenchmarkRecorder::new(config());
        let hits: Vec<u64> = (0..10).filter(|s| recorder.should_record(*s)).collect();
        assert_eq!(hits, vec![4, 6]);
    }

    #[test]
    fn test_summary_means_and_throughput() {
        let mut recorder = BenchmarkRecorder::new(config());
        for step in 1..=8 {
            recorder.observe(step, 128, 16, Duration::from_millis(500));
        }
        recorder.record_weight_update(Duration::from_millis(10));
        recorder.record_weight_update(Duration::from_millis(30));

        let summary = recorder.summarize(run());
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.iteration, 5.0);
        assert_eq!(summary.num_tokens, 2048.0);
        assert!((summary.elapsed_time - 1.0).abs() < 1e-9);
        assert!((summary.token_throughput - 4096.0).abs() < 1e-6);
        assert!((summary.weight_update_time - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary_is_zero() {
        let summary = BenchmarkRecorder::new(config()).summarize(run());
        assert_eq!(summary.samples, 0);
        assert_eq!(summary.token_throughput, 0.0);
    }

    #[test]
    fn test_json_sink_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = BenchmarkRecorder::new(config());
        recorder.observe(4, 8, 4, Duration::from_millis(100));
        let summary = recorder.summarize(run());

        let mut sink = JsonSummarySink::new(dir.path());
        sink.emit(&summary).unwrap();
        let path = sink.summary_path(&summary);
        assert!(path.starts_with(dir.path().join("2_ranks")));
        let back: BenchmarkSummary = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, summary);
    }
}
