//! Command-line entry point for joint entity-type and relation training.

use std::path::PathBuf;

use biorel_core::{LossPolicy, RepresentationMode};
use biorel_trainer::{TrainingConfig, TrainingMode, run_training};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// CLI arguments
#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train joint entity-type and relation classifiers over several corpora")]
#[command(version)]
struct Cli {
    /// JSON training configuration; defaults apply without one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Epoch plan: flat or continual
    #[arg(long)]
    mode: Option<TrainingMode>,

    /// Pair representation: marker or sum-pool
    #[arg(long)]
    representation: Option<RepresentationMode>,

    /// Loss policy: cross-entropy or binary-cross-entropy
    #[arg(long)]
    loss: Option<LossPolicy>,

    #[arg(long)]
    max_epochs: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Where best checkpoints are written
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Score the test split with this checkpoint instead of training
    #[arg(long, value_name = "CHECKPOINT_DIR")]
    test: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(TrainingConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(representation) = self.representation {
            config.representation = representation;
        }
        if let Some(loss) = self.loss {
            config.loss_policy = loss;
        }
        if let Some(max_epochs) = self.max_epochs {
            config.max_epochs = max_epochs;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.output_dir.is_some() {
            config.output_dir = self.output_dir;
        }
        Ok((config, self.test))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let result = Cli::parse()
        .into_config()
        .and_then(|(config, test)| run_training(&config, test.as_deref()).map(|_| ()));
    if let Err(e) = result {
        eprintln!("Training failed: {:#}", e);
        std::process::exit(1);
    }
}
