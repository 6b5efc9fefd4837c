use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tch::nn::{self, ModuleT, OptimizerConfig};
use tch::{Device, Kind, Tensor};
use tracing::{info, warn};

use crate::augmentation_pipeline::{self, AugmentationPipeline};
use crate::config::{AugmentConfig, OptimConfig, OptimKind, TrainConfig};
use crate::dataloader::DataLoader;
use crate::dataset::{channel_stats, Concat, Dataset, ImageFolder, Split, Subset};
use crate::metrics::{Accumulator, EpochRecord, EpochStats, History};
use crate::model::build_model;
use crate::transform_pipeline::{self, TransformPipeline};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub history: History,
    /// Epoch whose weights were checkpointed: best validation accuracy, or
    /// best training accuracy when validation is merged into training.
    pub best_epoch: Option<usize>,
    pub test: EpochStats,
}

/// Per-channel statistics the preprocessing was fitted with.
///
/// Written next to every checkpoint as `<checkpoint>.norm.json` so that
/// evaluation reuses them instead of re-measuring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Normalization {
    pub fn identity(channels: usize) -> Self {
        Self {
            mean: vec![0.0; channels],
            std: vec![1.0; channels],
        }
    }

    /// Measures `reference` when `[data] normalize` is set.
    pub fn fit(config: &TrainConfig, reference: &dyn Dataset) -> Result<Self> {
        if !config.data.normalize {
            return Ok(Self::identity(3));
        }
        let (mean, std) = channel_stats(reference).context("computing normalisation statistics")?;
        info!(?mean, ?std, "normalisation statistics");
        Ok(Self { mean, std })
    }

    pub fn sidecar_path(checkpoint: &Path) -> PathBuf {
        let mut name = checkpoint.as_os_str().to_owned();
        name.push(".norm.json");
        PathBuf::from(name)
    }

    pub fn save(&self, checkpoint: &Path) -> Result<()> {
        let path = Self::sidecar_path(checkpoint);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Statistics saved with `checkpoint`, if any.
    pub fn load(checkpoint: &Path) -> Result<Option<Self>> {
        let path = Self::sidecar_path(checkpoint);
        if !path.is_file() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let norm = serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(norm))
    }
}

pub fn build_optimizer(vs: &nn::VarStore, config: &OptimConfig) -> Result<nn::Optimizer> {
    let opt = match config.kind {
        OptimKind::Sgd => nn::Sgd {
            momentum: config.momentum,
            wd: config.weight_decay,
            ..Default::default()
        }
        .build(vs, config.lr)?,
        OptimKind::Adam => nn::Adam {
            wd: config.weight_decay,
            ..Default::default()
        }
        .build(vs, config.lr)?,
    };
    Ok(opt)
}

pub fn build_augmentations(config: &AugmentConfig) -> AugmentationPipeline {
    let mut pipeline = AugmentationPipeline::new();
    if config.horizontal_flip > 0.0 {
        pipeline.add_augmentation(augmentation_pipeline::random_horizontal_flip(config.horizontal_flip));
    }
    if config.vertical_flip > 0.0 {
        pipeline.add_augmentation(augmentation_pipeline::random_vertical_flip(config.vertical_flip));
    }
    if let Some(sigma) = config.blur_sigma {
        pipeline.add_augmentation(augmentation_pipeline::blur(sigma));
    }
    pipeline
}

fn correct_predictions(logits: &Tensor, labels: &Tensor) -> usize {
    logits
        .argmax(-1, false)
        .eq_tensor(labels)
        .sum(Kind::Int64)
        .int64_value(&[]) as usize
}

/// One training pass: forward, loss, gradient reset, backward, update.
pub fn train_epoch<D: Dataset>(
    model: &dyn ModuleT,
    loader: &mut DataLoader<D>,
    opt: &mut nn::Optimizer,
    device: Device,
    progress: &ProgressBar,
) -> Result<EpochStats> {
    let mut acc = Accumulator::new();
    for batch in loader.iter() {
        let batch = batch?;
        let images = batch.images.to_device(device);
        let labels = batch.labels.to_device(device);

        let logits = model.forward_t(&images, true);
        let loss = logits.cross_entropy_for_logits(&labels);
        opt.zero_grad();
        opt.backward_step(&loss);

        let loss = loss.double_value(&[]);
        acc.update(loss, correct_predictions(&logits, &labels), batch.len());
        progress.set_message(format!("loss={loss:.4}"));
        progress.inc(1);
    }
    Ok(acc.finish())
}

/// Forward-only pass tallying loss and accuracy.
pub fn evaluate<D: Dataset>(
    model: &dyn ModuleT,
    loader: &mut DataLoader<D>,
    device: Device,
) -> Result<EpochStats> {
    let mut acc = Accumulator::new();
    for batch in loader.iter() {
        let batch = batch?;
        let images = batch.images.to_device(device);
        let labels = batch.labels.to_device(device);

        let (loss, correct) = tch::no_grad(|| {
            let logits = model.forward_t(&images, false);
            let loss = logits.cross_entropy_for_logits(&labels).double_value(&[]);
            (loss, correct_predictions(&logits, &labels))
        });
        acc.update(loss, correct, batch.len());
    }
    Ok(acc.finish())
}

fn open_split(config: &TrainConfig, split: Split) -> Result<Box<dyn Dataset>> {
    let data = &config.data;
    let dataset = ImageFolder::with_plan(&data.root, split, data.image_size, &data.split)
        .with_context(|| format!("opening {split} split"))?;
    info!(%split, len = dataset.len(), classes = dataset.num_classes(), "loaded split");
    let dataset: Box<dyn Dataset> = match data.max_samples {
        Some(n) if n < dataset.len() => Box::new(Subset::head(dataset, n)),
        _ => Box::new(dataset),
    };
    Ok(dataset)
}

/// The set the model is fitted on, plus the validation set unless it was
/// merged in.
fn fitting_sets(config: &TrainConfig) -> Result<(Box<dyn Dataset>, Option<Box<dyn Dataset>>)> {
    let train_split = open_split(config, Split::Train)?;
    let val_split = open_split(config, Split::Val)?;
    if config.train.merge_val {
        let merged: Box<dyn Dataset> = Box::new(Concat::new(train_split, val_split)?);
        Ok((merged, None))
    } else {
        Ok((train_split, Some(val_split)))
    }
}

/// Preprocessing shared by every split.
fn preprocessing(config: &TrainConfig, norm: &Normalization) -> TransformPipeline {
    transform_pipeline::standard(norm.mean.clone(), norm.std.clone(), config.data.resize_to)
}

fn progress_bar(len: usize, epoch: usize, epochs: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {prefix} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_prefix(format!("epoch {epoch}/{epochs}"));
    pb
}

/// Runs the whole pipeline: splits, loaders, model, epoch loop, test pass.
pub fn run(config: &TrainConfig) -> Result<RunSummary> {
    config.validate()?;
    let start = Instant::now();
    let device = config.device()?;
    tch::manual_seed(config.train.seed as i64);
    info!(?device, "starting run");

    let (train_set, val_set) = fitting_sets(config)?;
    let test_split = open_split(config, Split::Test)?;
    let num_classes = train_set.num_classes() as i64;

    let norm = Normalization::fit(config, &train_set)?;
    let transforms = preprocessing(config, &norm);
    let batch_size = config.data.batch_size;
    let mut train_loader = DataLoader::new(train_set, batch_size, true)
        .with_seed(config.train.seed)
        .with_transforms(transforms.clone())
        .with_augmentations(build_augmentations(&config.augment));
    let mut val_loader = val_set.map(|ds| {
        DataLoader::new(ds, batch_size, false).with_transforms(transforms.clone())
    });
    let mut test_loader = DataLoader::new(test_split, batch_size, false).with_transforms(transforms);

    let mut vs = nn::VarStore::new(device);
    let model = build_model(
        &mut vs,
        config.model.arch,
        num_classes,
        config.model.weights.as_deref(),
        config.model.freeze_backbone,
    )?;
    let mut opt = build_optimizer(&vs, &config.optim)?;

    let epochs = config.train.epochs;
    let mut history = History::default();
    let mut best_accuracy = f64::NEG_INFINITY;
    let mut best_epoch = None;
    for epoch in 1..=epochs {
        let pb = progress_bar(train_loader.len(), epoch, epochs);
        let train = train_epoch(model.as_ref(), &mut train_loader, &mut opt, device, &pb)?;
        pb.finish_and_clear();

        let val = match val_loader.as_mut() {
            Some(loader) => Some(evaluate(model.as_ref(), loader, device)?),
            None => None,
        };
        info!(
            epoch,
            train_loss = train.loss,
            train_accuracy = train.accuracy,
            val_loss = val.map(|v| v.loss),
            val_accuracy = val.map(|v| v.accuracy),
            "epoch finished"
        );

        let score = val.map(|v| v.accuracy).unwrap_or(train.accuracy);
        if score > best_accuracy {
            best_accuracy = score;
            best_epoch = Some(epoch);
            if let Some(path) = &config.train.checkpoint {
                save_checkpoint(&vs, &norm, path)?;
            }
        }
        history.push(EpochRecord { epoch, train, val });
    }

    let test = evaluate(model.as_ref(), &mut test_loader, device)?;
    info!(
        loss = test.loss,
        accuracy = test.accuracy,
        samples = test.samples,
        "test evaluation"
    );
    if test.samples == 0 {
        warn!("test split is empty");
    }

    if let Some(path) = &config.train.metrics {
        history.save_json(path)?;
    }
    info!(elapsed = ?start.elapsed(), "run finished");

    Ok(RunSummary {
        history,
        best_epoch,
        test,
    })
}

fn save_checkpoint(vs: &nn::VarStore, norm: &Normalization, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    vs.save(path)
        .with_context(|| format!("saving checkpoint {}", path.display()))?;
    norm.save(path)?;
    info!(path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Scores saved weights on one split.
///
/// Uses the normalisation statistics saved with the checkpoint. Without
/// them the statistics are re-measured on the same set `run` fitted on, so
/// the data root, split plan and `merge_val` must match the training run.
pub fn evaluate_checkpoint(config: &TrainConfig, checkpoint: &Path, split: Split) -> Result<EpochStats> {
    config.validate()?;
    let device = config.device()?;

    let dataset = open_split(config, split)?;
    let num_classes = dataset.num_classes() as i64;
    let norm = match Normalization::load(checkpoint)? {
        Some(norm) => norm,
        None => {
            warn!(checkpoint = %checkpoint.display(), "no saved normalisation, re-measuring");
            let (reference, _) = fitting_sets(config)?;
            Normalization::fit(config, &reference)?
        }
    };
    let transforms = preprocessing(config, &norm);

    let mut vs = nn::VarStore::new(device);
    let model = build_model(&mut vs, config.model.arch, num_classes, None, false)?;
    vs.load(checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;

    let mut loader = DataLoader::new(dataset, config.data.batch_size, false).with_transforms(transforms);
    let stats = evaluate(model.as_ref(), &mut loader, device)?;
    info!(%split, loss = stats.loss, accuracy = stats.accuracy, "checkpoint evaluation");
    Ok(stats)
}
