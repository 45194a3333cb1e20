//! CLI entry point for lockstep-train.

use std::path::PathBuf;

use candle_core::{DType, Device};
use clap::{Args, Parser, Subcommand};
use lockstep_train::config::{BenchmarkConfig, JobConfig, LossScaleMode, ModelShape, Precision};
use lockstep_train::data::{token_file_loader, ShardCatalog};
use lockstep_train::dist::{Collective, RendezvousConfig, SingleProcess, TcpCollective};
use lockstep_train::error::{config_error, JobResult};
use lockstep_train::logging::{init_console_logging, init_logging};
use lockstep_train::model::TokenPredictor;
use lockstep_train::optim::OptimizerKind;
use lockstep_train::telemetry::{JsonSummarySink, NullSink, TelemetrySink};
use lockstep_train::train::Trainer;

fn resolve_device(device: &str, local_rank: usize) -> Result<Device, String> {
    match device {
        "cpu" => Ok(Device::Cpu),
        #[cfg(feature = "cuda")]
        "cuda" => Device::new_cuda(local_rank)
            .map_err(|e| format!("Failed to initialize CUDA device {}: {}", local_rank, e)),
        #[cfg(feature = "cuda")]
        s if s.starts_with("cuda:") => {
            let id: usize = s
                .trim_start_matches("cuda:")
                .parse()
                .map_err(|_| format!("Invalid CUDA device id in '{}'", s))?;
            Device::new_cuda(id).map_err(|e| format!("Failed to initialize CUDA device {}: {}", id, e))
        }
        other => {
            let _ = local_rank;
            Err(format!("Unknown device: {}. Use 'cpu', 'cuda', or 'cuda:N'.", other))
        }
    }
}

#[derive(Parser)]
#[command(
    name = "lockstep-train",
    about = "Data-parallel training with overflow-aware gradient sync and checkpoint rotation",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Directory holding the shard files
    #[arg(long)]
    input_dir: PathBuf,

    /// Directory receiving checkpoints
    #[arg(long)]
    output_dir: PathBuf,

    /// JSON file with the model shape (vocab_size, hidden_size, layer_norm_eps)
    #[arg(long)]
    config_file: Option<PathBuf>,

    #[arg(long, default_value = "512")]
    max_seq_length: usize,

    /// Sequences per micro-batch on each rank
    #[arg(long, default_value = "32")]
    train_batch_size: usize,

    #[arg(long, default_value = "5e-5")]
    learning_rate: f64,

    /// Optimizer step budget
    #[arg(long, default_value = "1000")]
    max_steps: u64,

    /// Fraction of max_steps spent in linear warmup
    #[arg(long, default_value = "0.01")]
    warmup_proportion: f64,

    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(long, default_value = "1")]
    gradient_accumulation_steps: usize,

    /// Train with f16 parameters and f32 master weights
    #[arg(long)]
    fp16: bool,

    /// Static loss scale; 0 selects dynamic scaling
    #[arg(long, default_value = "0")]
    loss_scale: f64,

    /// Round the gradient reduction through f16
    #[arg(long)]
    allreduce_fp16: bool,

    /// adam, fusedadam or lamb
    #[arg(long, default_value = "lamb")]
    optimizer: OptimizerKind,

    /// Optimizer steps per logging window
    #[arg(long, default_value = "1")]
    log_freq: usize,

    #[arg(long, default_value = "100")]
    num_steps_per_checkpoint: u64,

    #[arg(long)]
    resume_from_checkpoint: bool,

    /// Step to resume from (default: newest checkpoint)
    #[arg(long)]
    resume_step: Option<u64>,

    /// Continue a finished first phase with a fresh schedule
    #[arg(long)]
    phase2: bool,

    #[arg(long, default_value = "7038")]
    phase1_end_step: u64,

    /// Record throughput and write a summary at the end
    #[arg(long)]
    benchmark: bool,

    #[arg(long, default_value = "benchmark_output")]
    benchmark_dir: PathBuf,

    /// Micro-batches between benchmark records
    #[arg(long, default_value = "100")]
    log_interval: usize,

    #[arg(long, default_value = "1000")]
    benchmark_start: u64,

    #[arg(long, default_value = "2000")]
    benchmark_stop: u64,

    /// Ranks per node (for the node count in benchmark summaries and device selection)
    #[arg(long, default_value = "1")]
    nproc_per_node: usize,

    /// cpu, cuda or cuda:N
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Emit JSON logs instead of pretty console output
    #[arg(long)]
    json_logs: bool,
}

impl TrainArgs {
    fn to_config(&self) -> JobResult<JobConfig> {
        let model = match &self.config_file {
            Some(path) => ModelShape::from_json_file(path)?,
            None => ModelShape::default(),
        };
        Ok(JobConfig {
            model,
            max_seq_length: self.max_seq_length,
            train_batch_size: self.train_batch_size,
            learning_rate: self.learning_rate,
            max_steps: self.max_steps,
            warmup_proportion: self.warmup_proportion,
            seed: self.seed,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            precision: if self.fp16 { Precision::Fp16 } else { Precision::Fp32 },
            loss_scale: LossScaleMode::from_flag(self.loss_scale),
            allreduce_fp16: self.allreduce_fp16,
            optimizer: self.optimizer,
            log_freq: self.log_freq,
            num_steps_per_checkpoint: self.num_steps_per_checkpoint,
            resume_from_checkpoint: self.resume_from_checkpoint,
            resume_step: self.resume_step,
            phase2: self.phase2,
            phase1_end_step: self.phase1_end_step,
            benchmark: self.benchmark.then(|| BenchmarkConfig {
                dir: self.benchmark_dir.clone(),
                log_interval: self.log_interval,
                start: self.benchmark_start,
                stop: self.benchmark_stop,
            }),
            nproc_per_node: self.nproc_per_node,
            ..JobConfig::new(&self.input_dir, &self.output_dir)
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) a training job on this rank
    Train(TrainArgs),

    /// Print which shard each rank reads at each cursor of an epoch
    Plan {
        #[arg(long)]
        input_dir: PathBuf,

        #[arg(long, default_value = "1")]
        world_size: usize,

        #[arg(long, default_value = "42")]
        seed: u64,

        #[arg(long, default_value = "0")]
        epoch: u64,
    },
}

fn train(args: TrainArgs) -> JobResult<()> {
    let config = args.to_config()?;
    let rendezvous = RendezvousConfig::from_env()?;
    let local_rank = rendezvous.rank % config.nproc_per_node.max(1);
    let device = resolve_device(&args.device, local_rank).map_err(config_error)?;

    let collective: Box<dyn Collective> = if rendezvous.world_size > 1 {
        Box::new(TcpCollective::connect(&rendezvous)?)
    } else {
        Box::new(SingleProcess)
    };

    let dtype = if config.precision.is_reduced() { DType::F16 } else { DType::F32 };
    let model = TokenPredictor::new(&config.model, dtype, config.seed, &device)?;
    let telemetry: Box<dyn TelemetrySink> = match &config.benchmark {
        Some(bench) => Box::new(JsonSummarySink::new(&bench.dir)),
        None => Box::new(NullSink),
    };
    let loader = token_file_loader(config.max_seq_length);

    let mut trainer = Trainer::new(config, model, collective, loader, telemetry)?;
    let summary = trainer.run()?;

    if trainer.context().is_main() {
        tracing::info!(
            global_step = summary.global_step,
            training_steps = summary.training_steps,
            skipped_steps = summary.skipped_steps,
            final_loss = ?summary.final_loss,
            "Done"
        );
    }
    Ok(())
}

fn plan(input_dir: PathBuf, world_size: usize, seed: u64, epoch: u64) -> JobResult<()> {
    if world_size == 0 {
        return Err(config_error("--world-size must be > 0"));
    }
    let catalog = ShardCatalog::discover(&input_dir)?;
    let order = catalog.epoch_order(seed, epoch);
    let table = catalog.assignment_table(world_size, catalog.len())?;

    println!("{} shards, {} ranks, epoch {}", catalog.len(), world_size, epoch);
    for (cursor, row) in table.iter().enumerate() {
        let names: Vec<String> = row
            .iter()
            .map(|&idx| {
                order[idx]
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();
        println!("cursor {:>4}: {}", cursor, names.join("  "));
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train(args) => {
            if args.json_logs {
                init_logging();
            } else {
                init_console_logging();
            }
            train(args)
        }
        Commands::Plan {
            input_dir,
            world_size,
            seed,
            epoch,
        } => plan(input_dir, world_size, seed, epoch),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, startup = e.is_startup_error(), "lockstep-train failed");
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
