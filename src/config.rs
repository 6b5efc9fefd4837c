//! TOML run configuration.
//!
//! Every field has a default, so an empty file describes the reference run:
//! a resnet18 fine-tuned with SGD on 64×64 chips, batches of 10, 10 epochs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::dataset::SplitPlan;
use crate::model::Arch;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub data: DataConfig,
    pub augment: AugmentConfig,
    pub model: ModelConfig,
    pub optim: OptimConfig,
    pub train: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// One sub-directory per class. Images must decode to RGB, RGBA or
    /// grayscale; multispectral GeoTIFF chips need an RGB export first.
    pub root: PathBuf,
    /// Side length images are decoded to.
    pub image_size: u32,
    /// Optional bilinear resize applied after decoding, e.g. 224 for
    /// backbones pretrained at that resolution.
    pub resize_to: Option<i64>,
    pub batch_size: usize,
    /// Used only when the root has no `splits/` listings.
    pub split: SplitPlan,
    pub normalize: bool,
    /// Truncate every split to at most this many samples.
    pub max_samples: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/eurosat100"),
            image_size: 64,
            resize_to: None,
            batch_size: 10,
            split: SplitPlan::default(),
            normalize: true,
            max_samples: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub horizontal_flip: f64,
    pub vertical_flip: f64,
    pub blur_sigma: Option<f32>,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            horizontal_flip: 0.5,
            vertical_flip: 0.5,
            blur_sigma: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub arch: Arch,
    /// Pretrained weights file (`.ot` or `.safetensors`).
    pub weights: Option<PathBuf>,
    pub freeze_backbone: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Resnet18,
            weights: None,
            freeze_backbone: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimKind {
    Sgd,
    Adam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub kind: OptimKind,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            kind: OptimKind::Sgd,
            lr: 1e-2,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub epochs: usize,
    /// `auto`, `cpu`, `cuda`, `cuda:<n>` or `mps`.
    pub device: String,
    pub seed: u64,
    /// Fit on train ∪ val and skip per-epoch validation.
    pub merge_val: bool,
    /// Where the best-on-validation weights are written.
    pub checkpoint: Option<PathBuf>,
    pub metrics: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            device: "auto".to_string(),
            seed: 0,
            merge_val: false,
            checkpoint: None,
            metrics: None,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TrainConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded train config");
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data.batch_size == 0 {
            bail!("data.batch_size must be positive");
        }
        if self.data.image_size == 0 {
            bail!("data.image_size must be positive");
        }
        if self.train.epochs == 0 {
            bail!("train.epochs must be positive");
        }
        if !(self.optim.lr > 0.0) {
            bail!("optim.lr must be positive, got {}", self.optim.lr);
        }
        for (name, p) in [
            ("augment.horizontal_flip", self.augment.horizontal_flip),
            ("augment.vertical_flip", self.augment.vertical_flip),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{name} must be a probability, got {p}");
            }
        }
        self.data.split.validate()?;
        parse_device(&self.train.device)?;
        Ok(())
    }

    pub fn device(&self) -> anyhow::Result<Device> {
        parse_device(&self.train.device)
    }
}

pub fn parse_device(name: &str) -> anyhow::Result<Device> {
    match name {
        "auto" => Ok(Device::cuda_if_available()),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::Cuda(0)),
        "mps" => Ok(Device::Mps),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(n)) => Ok(Device::Cuda(n)),
            _ => bail!("unknown device `{other}`"),
        },
    }
}
