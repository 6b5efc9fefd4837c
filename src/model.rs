use std::path::Path;

use serde::{Deserialize, Serialize};
use tch::nn::{self, ModuleT};
use tch::vision::resnet;
use tch::Tensor;
use tracing::info;

use crate::error::Result;

/// Output width of the resnet18 backbone once its final layer is removed.
const RESNET18_FEATURES: i64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Resnet18,
    SimpleCnn,
}

/// Small three-block CNN for training from scratch.
///
/// Global average pooling before the classifier makes it independent of the
/// input resolution.
#[derive(Debug)]
pub struct Net {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Net {
    pub fn new(vs: &nn::Path, in_channels: i64, num_classes: i64) -> Net {
        let cfg = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = nn::conv2d(vs / "conv1", in_channels, 16, 3, cfg);
        let conv2 = nn::conv2d(vs / "conv2", 16, 32, 3, cfg);
        let conv3 = nn::conv2d(vs / "conv3", 32, 64, 3, cfg);
        let fc1 = nn::linear(vs / "fc1", 64, 128, Default::default());
        let fc2 = nn::linear(vs / "fc2", 128, num_classes, Default::default());

        Net {
            conv1,
            conv2,
            conv3,
            fc1,
            fc2,
        }
    }
}

impl nn::ModuleT for Net {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv1)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv2)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv3)
            .relu()
            .adaptive_avg_pool2d([1, 1])
            .flat_view()
            .apply(&self.fc1)
            .relu()
            .dropout(0.3, train)
            .apply(&self.fc2)
    }
}

/// Builds `arch` in `vs` with a classifier sized to `num_classes`.
///
/// For resnet18 the pretrained weights cover the backbone only; the head is
/// always freshly initialised so it can match any class count. With
/// `freeze_backbone` only the head receives gradient updates.
pub fn build_model(
    vs: &mut nn::VarStore,
    arch: Arch,
    num_classes: i64,
    weights: Option<&Path>,
    freeze_backbone: bool,
) -> Result<Box<dyn ModuleT>> {
    match arch {
        Arch::Resnet18 => {
            let backbone = resnet::resnet18_no_final_layer(&vs.root());
            if let Some(path) = weights {
                vs.load(path)?;
                info!(weights = %path.display(), "loaded pretrained backbone");
            }
            if freeze_backbone {
                vs.freeze();
            }
            let head = nn::linear(
                vs.root() / "head",
                RESNET18_FEATURES,
                num_classes,
                Default::default(),
            );
            Ok(Box::new(nn::func_t(move |xs, train| {
                xs.apply_t(&backbone, train).apply(&head)
            })))
        }
        Arch::SimpleCnn => {
            let net = Net::new(&vs.root(), 3, num_classes);
            if let Some(path) = weights {
                vs.load(path)?;
                info!(weights = %path.display(), "loaded weights");
            }
            Ok(Box::new(net))
        }
    }
}
