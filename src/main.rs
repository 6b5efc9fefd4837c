//make sure libtorch is reachable, e.g.
//export LD_LIBRARY_PATH=/path/to/your/libtorch/lib

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use satclass::config::TrainConfig;
use satclass::dataset::{Dataset, ImageFolder, Split, SplitPlan};
use satclass::{preview, training};

/// satclass: train and evaluate land-cover classifiers on image folders.
#[derive(Parser)]
#[command(name = "satclass", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model and report test accuracy.
    Train {
        /// Path to the run config TOML file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the dataset root.
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        lr: Option<f64>,
        /// `auto`, `cpu`, `cuda`, `cuda:<n>` or `mps`.
        #[arg(long)]
        device: Option<String>,
        /// Pretrained weights file for the backbone.
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Score a saved checkpoint on one split.
    Evaluate {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, default_value = "test")]
        split: String,
    },
    /// Print class names and split sizes of a dataset root.
    Inspect {
        #[arg(long)]
        root: PathBuf,
    },
    /// Write one sample of a split to an image file.
    Preview {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value = "train")]
        split: String,
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// Upscaling factor.
        #[arg(long, default_value_t = 4)]
        scale: u32,
        #[arg(long)]
        output: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>, root: Option<PathBuf>) -> Result<TrainConfig> {
    let mut config = match path {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    if let Some(root) = root {
        config.data.root = root;
    }
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            root,
            epochs,
            batch_size,
            lr,
            device,
            weights,
            json,
        } => {
            let mut config = load_config(config.as_ref(), root)?;
            if let Some(n) = epochs {
                config.train.epochs = n;
            }
            if let Some(n) = batch_size {
                config.data.batch_size = n;
            }
            if let Some(lr) = lr {
                config.optim.lr = lr;
            }
            if let Some(device) = device {
                config.train.device = device;
            }
            if weights.is_some() {
                config.model.weights = weights;
            }

            let summary = training::run(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Accuracy of the network on the {} test images: {:.2}%",
                    summary.test.samples,
                    100.0 * summary.test.accuracy
                );
                if let Some(epoch) = summary.best_epoch {
                    println!("Best validation epoch: {epoch}");
                }
            }
        }
        Command::Evaluate {
            config,
            root,
            checkpoint,
            split,
        } => {
            let config = load_config(config.as_ref(), root)?;
            let split: Split = split.parse()?;
            let stats = training::evaluate_checkpoint(&config, &checkpoint, split)?;
            println!(
                "{split}: loss {:.4}, accuracy {:.2}% over {} images",
                stats.loss,
                100.0 * stats.accuracy,
                stats.samples
            );
        }
        Command::Inspect { root } => {
            for split in [Split::Train, Split::Val, Split::Test] {
                let ds = ImageFolder::new(&root, split, 64)
                    .with_context(|| format!("opening {split} split"))?;
                if split == Split::Train {
                    for (label, name) in ds.class_names().iter().enumerate() {
                        println!("{label:>3}  {name}");
                    }
                }
                println!("{split}: {} images", ds.len());
            }
        }
        Command::Preview {
            root,
            split,
            index,
            scale,
            output,
        } => {
            let split: Split = split.parse()?;
            let ds = ImageFolder::with_plan(&root, split, 64, &SplitPlan::default())?;
            let class = preview::save_preview(&ds, index, scale, &output)?;
            println!("{split}[{index}] ({class}) -> {}", output.display());
        }
    }

    Ok(())
}
