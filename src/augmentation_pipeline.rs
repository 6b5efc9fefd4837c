use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use tch::Tensor;

use crate::error::Result;
use crate::utils::{rgb_image_to_tensor, tensor_to_rgb_image};

/// A random per-image transform applied to `[C, H, W]` tensors in `[0, 1]`
/// before normalisation. Only the training split is augmented.
pub type Augmentation = Arc<dyn Fn(Tensor, &mut StdRng) -> Result<Tensor> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AugmentationPipeline {
    augmentations: Vec<Augmentation>,
}

impl AugmentationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_augmentation(&mut self, augmentation: Augmentation) {
        self.augmentations.push(augmentation);
    }

    pub fn len(&self) -> usize {
        self.augmentations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.augmentations.is_empty()
    }

    pub fn augment(&self, img: Tensor, rng: &mut StdRng) -> Result<Tensor> {
        self.augmentations
            .iter()
            .try_fold(img, |output, augmentation| augmentation(output, &mut *rng))
    }
}

/// Clamps `p` into `[0, 1]`; NaN never fires.
fn probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

pub fn random_horizontal_flip(p: f64) -> Augmentation {
    let p = probability(p);
    Arc::new(move |t: Tensor, rng: &mut StdRng| Ok(if rng.gen_bool(p) { t.flip([-1]) } else { t }))
}

pub fn random_vertical_flip(p: f64) -> Augmentation {
    let p = probability(p);
    Arc::new(move |t: Tensor, rng: &mut StdRng| Ok(if rng.gen_bool(p) { t.flip([-2]) } else { t }))
}

/// Gaussian blur with a fixed `sigma`, round-tripped through an 8-bit image.
pub fn blur(sigma: f32) -> Augmentation {
    Arc::new(move |t: Tensor, _: &mut StdRng| {
        let image = tensor_to_rgb_image(&t)?;
        let image = image::imageops::blur(&image, sigma);
        Ok(rgb_image_to_tensor(&image))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tch::{Device, Kind};

    fn ramp() -> Tensor {
        Tensor::arange(12, (Kind::Float, Device::Cpu)).view([3, 2, 2]) / 12.0
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let img = ramp();
        let out = AugmentationPipeline::new().augment(img.shallow_clone(), &mut rng).unwrap();
        assert!(out.equal(&img));
    }

    #[test]
    fn certain_flips_reverse_axes() {
        let mut rng = StdRng::seed_from_u64(0);
        let img = ramp();

        let h = random_horizontal_flip(1.0)(img.shallow_clone(), &mut rng).unwrap();
        assert_eq!(h.double_value(&[0, 0, 0]), img.double_value(&[0, 0, 1]));

        let v = random_vertical_flip(1.0)(img.shallow_clone(), &mut rng).unwrap();
        assert_eq!(v.double_value(&[0, 0, 0]), img.double_value(&[0, 1, 0]));

        let none = random_vertical_flip(0.0)(img.shallow_clone(), &mut rng).unwrap();
        assert!(none.equal(&img));
    }

    #[test]
    fn out_of_range_flip_probabilities_are_clamped() {
        let mut rng = StdRng::seed_from_u64(0);
        let img = ramp();

        let always = random_horizontal_flip(1.5)(img.shallow_clone(), &mut rng).unwrap();
        assert!(always.equal(&img.flip([-1])));

        for p in [-1.0, f64::NAN] {
            let never = random_vertical_flip(p)(img.shallow_clone(), &mut rng).unwrap();
            assert!(never.equal(&img));
        }
    }

    #[test]
    fn pipeline_is_reproducible_for_a_seed() {
        let mut pipeline = AugmentationPipeline::new();
        pipeline.add_augmentation(random_horizontal_flip(0.5));
        pipeline.add_augmentation(random_vertical_flip(0.5));

        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..8)
                .map(|_| pipeline.augment(ramp(), &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        let (a, b) = (run(42), run(42));
        assert!(a.iter().zip(&b).all(|(x, y)| x.equal(y)));
    }

    #[test]
    fn blur_keeps_shape_and_range() {
        let mut rng = StdRng::seed_from_u64(0);
        let img = Tensor::rand([3, 8, 8], (Kind::Float, Device::Cpu));
        let out = blur(1.5)(img, &mut rng).unwrap();
        assert_eq!(out.size(), vec![3, 8, 8]);
        assert!(out.max().double_value(&[]) <= 1.0);
        assert!(out.min().double_value(&[]) >= 0.0);
    }
}
