//! CLI entry point for seg3d-trainer-rs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seg3d_trainer_rs::checkpoint;
use seg3d_trainer_rs::{FinetuneConfig, Result, TrainError, TrainingOrchestrator};

#[derive(Parser)]
#[command(name = "seg3d-train")]
#[command(about = "Fine-tune 3D segmentation networks on augmented volumes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Start or resume training
    Train {
        /// CSV manifest of image / mask pairs
        data: Option<PathBuf>,
        /// Configuration file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Batch size
        #[arg(long)]
        batch: Option<usize>,
        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Loader worker threads
        #[arg(long)]
        workers: Option<usize>,
        /// Train on synthetic volumes instead of the manifest
        #[arg(long)]
        dummy: bool,
        /// Checkpoint directory to resume from
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Output directory for checkpoints and metrics
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Compute the validation loss of a checkpoint
    Evaluate {
        /// Configuration file; defaults to the one stored in the checkpoint
        #[arg(long)]
        config: Option<PathBuf>,
        /// Checkpoint directory
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Preset (default, smoke-test)
        #[arg(long, default_value = "default")]
        preset: String,
    },
}

struct TrainOverrides {
    data: Option<PathBuf>,
    batch: Option<usize>,
    epochs: Option<usize>,
    workers: Option<usize>,
    dummy: bool,
    output_dir: Option<PathBuf>,
    seed: Option<u64>,
}

impl TrainOverrides {
    fn apply(self, config: &mut FinetuneConfig) {
        if let Some(data) = self.data {
            config.data.manifest = data;
        }
        if let Some(batch) = self.batch {
            config.training.batch_size = batch;
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(workers) = self.workers {
            config.data.workers = workers;
        }
        if self.dummy {
            config.data.synthetic = true;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<FinetuneConfig> {
    match path {
        Some(path) => FinetuneConfig::from_file(path),
        None => Ok(FinetuneConfig::default()),
    }
}

fn install_interrupt_handler() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("Interrupt received; finishing the current batch (press again to abort)");
    })
    .map_err(|e| TrainError::Training(format!("failed to install interrupt handler: {e}")))?;
    Ok(flag)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = FinetuneConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            if config.data.synthetic {
                println!("  Data: synthetic {:?}", config.data.synthetic_data.shape);
            } else {
                println!("  Data: {}", config.data.manifest.display());
            }
            println!("  Output channels: {}", config.model.output_channels());
            println!("  Trainable layers: {:?}", config.trainable_layers);
        }
        Commands::Train {
            data,
            config,
            batch,
            epochs,
            workers,
            dummy,
            resume,
            output_dir,
            seed,
        } => {
            let mut config = load_config(config.as_ref())?;
            TrainOverrides {
                data,
                batch,
                epochs,
                workers,
                dummy,
                output_dir,
                seed,
            }
            .apply(&mut config);
            config.validate()?;

            let interrupt = install_interrupt_handler()?;
            let mut orchestrator = TrainingOrchestrator::new(config)?.with_interrupt(interrupt);
            if let Some(dir) = resume {
                orchestrator.resume_from(&dir)?;
            }
            let summary = orchestrator.fit()?;
            println!("✓ Training finished after {} epochs", summary.epochs_run);
            if let (Some(best), Some(epoch)) = (summary.best_metric, summary.best_epoch) {
                println!("  Best val loss: {best:.4} (epoch {})", epoch + 1);
            }
            println!(
                "  Best checkpoint: {}",
                orchestrator.checkpoints().root().join("best").display()
            );
        }
        Commands::Evaluate { config, checkpoint } => {
            let config = match config {
                Some(path) => FinetuneConfig::from_file(&path)?,
                None => checkpoint::read_config(&checkpoint)?,
            };
            config.validate()?;
            let mut orchestrator = TrainingOrchestrator::new(config)?;
            orchestrator.load_weights(&checkpoint)?;
            let metrics = orchestrator.evaluate()?;
            println!(
                "✓ Validation loss: {:.4} over {} samples",
                metrics.mean_loss, metrics.sample_count
            );
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = FinetuneConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}
