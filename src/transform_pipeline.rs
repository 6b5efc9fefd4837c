use std::sync::Arc;

use tch::{Kind, Tensor};

/// A deterministic per-image tensor transform, `[C, H, W]` in and out.
pub type Transform = Arc<dyn Fn(Tensor) -> Tensor + Send + Sync>;

#[derive(Clone, Default)]
pub struct TransformPipeline {
    transforms: Vec<Transform>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transform(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }

    pub fn with(mut self, transform: Transform) -> Self {
        self.add_transform(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn transform(&self, img: Tensor) -> Tensor {
        self.transforms
            .iter()
            .fold(img, |output, transform| (transform.as_ref())(output))
    }
}

/// Bilinear resize of a `[C, H, W]` image.
pub fn resize(img: Tensor, h: i64, w: i64) -> Tensor {
    img.unsqueeze(0)
        .upsample_bilinear2d([h, w], false, None::<f64>, None::<f64>)
        .squeeze_dim(0)
}

pub fn to_float(img: Tensor) -> Tensor {
    img.to_kind(Kind::Float)
}

/// Per-channel `(img - mean) / std`.
pub fn normalize(img: Tensor, mean: &[f32], std: &[f32]) -> Tensor {
    let c = mean.len() as i64;
    let mean = Tensor::from_slice(mean).view([c, 1, 1]).to_device(img.device());
    let std = Tensor::from_slice(std).view([c, 1, 1]).to_device(img.device());
    (img - mean) / std
}

/// The preprocessing applied to every split: optional resize, float
/// conversion, then normalisation with statistics from the training split.
pub fn standard(mean: Vec<f32>, std: Vec<f32>, resize_to: Option<i64>) -> TransformPipeline {
    let mut pipeline = TransformPipeline::new();
    if let Some(side) = resize_to {
        pipeline.add_transform(Arc::new(move |img| resize(img, side, side)));
    }
    pipeline
        .with(Arc::new(to_float))
        .with(Arc::new(move |img| normalize(img, &mean, &std)))
}
