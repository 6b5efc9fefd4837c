use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tch::Tensor;

use crate::augmentation_pipeline::AugmentationPipeline;
use crate::dataset::{Dataset, Example};
use crate::error::Result;
use crate::transform_pipeline::TransformPipeline;
use crate::utils::example_to_tensor;

#[derive(Debug)]
pub struct Batch {
    pub index: usize,
    /// `[B, C, H, W]` float images.
    pub images: Tensor,
    /// `[B]` int64 class labels.
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.size().first().copied().unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Groups a dataset into mini-batches.
///
/// Each call to [`DataLoader::iter`] is one epoch: every sample is yielded
/// exactly once, reshuffled per epoch when `shuffle` is set. Images within
/// a batch are decoded in parallel on the rayon pool.
pub struct DataLoader<D> {
    dataset: D,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: u64,
    transform_pipeline: TransformPipeline,
    augmentation_pipeline: Option<AugmentationPipeline>,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: D, batch_size: usize, shuffle: bool) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last: false,
            seed: 0,
            epoch: 0,
            transform_pipeline: TransformPipeline::new(),
            augmentation_pipeline: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_transforms(mut self, transform_pipeline: TransformPipeline) -> Self {
        self.transform_pipeline = transform_pipeline;
        self
    }

    pub fn with_augmentations(mut self, augmentation_pipeline: AugmentationPipeline) -> Self {
        self.augmentation_pipeline = Some(augmentation_pipeline);
        self
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the next epoch.
    pub fn iter(&mut self) -> Batches<'_, D> {
        let epoch_seed = self.seed.wrapping_add(self.epoch);
        self.epoch += 1;

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(epoch_seed));
        }

        Batches {
            loader: self,
            order,
            next: 0,
            rng: StdRng::seed_from_u64(epoch_seed ^ 0x9e37_79b9_7f4a_7c15),
        }
    }

    fn load_batch(&self, index: usize, indices: &[usize], rng: &mut StdRng) -> Result<Batch> {
        let examples = indices
            .par_iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<Example>>>()?;

        let mut images = Vec::with_capacity(examples.len());
        let mut labels = Vec::with_capacity(examples.len());
        for ex in &examples {
            let mut img = example_to_tensor(ex);
            if let Some(pipeline) = &self.augmentation_pipeline {
                img = pipeline.augment(img, rng)?;
            }
            images.push(self.transform_pipeline.transform(img));
            labels.push(ex.label);
        }

        Ok(Batch {
            index,
            images: Tensor::stack(&images, 0),
            labels: Tensor::from_slice(&labels),
        })
    }
}

pub struct Batches<'a, D> {
    loader: &'a DataLoader<D>,
    order: Vec<usize>,
    next: usize,
    rng: StdRng,
}

impl<D: Dataset> Iterator for Batches<'_, D> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_size = self.loader.batch_size;
        let start = self.next * batch_size;
        if start >= self.order.len() {
            return None;
        }
        let end = (start + batch_size).min(self.order.len());
        if self.loader.drop_last && end - start < batch_size {
            return None;
        }

        let index = self.next;
        self.next += 1;
        Some(self.loader.load_batch(index, &self.order[start..end], &mut self.rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augmentation_pipeline::random_horizontal_flip;
    use crate::error::DatasetError;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Each image is filled with its own index so batches can be traced back.
    struct Synthetic {
        n: usize,
        classes: Vec<String>,
    }

    impl Synthetic {
        fn new(n: usize) -> Self {
            Self {
                n,
                classes: vec!["a".into(), "b".into()],
            }
        }
    }

    impl Dataset for Synthetic {
        fn len(&self) -> usize {
            self.n
        }

        fn get(&self, index: usize) -> Result<Example> {
            if index >= self.n {
                return Err(DatasetError::IndexOutOfRange { index, len: self.n });
            }
            Ok(Example {
                image: vec![index as f32; 3 * 2 * 2],
                channels: 3,
                height: 2,
                width: 2,
                label: (index % 2) as i64,
            })
        }

        fn class_names(&self) -> &[String] {
            &self.classes
        }
    }

    fn ids(batch: &Batch) -> Vec<usize> {
        (0..batch.len())
            .map(|i| batch.images.double_value(&[i as i64, 0, 0, 0]) as usize)
            .collect()
    }

    #[test]
    fn sequential_batches_keep_order_and_emit_short_tail() {
        let mut loader = DataLoader::new(Synthetic::new(7), 3, false);
        assert_eq!(loader.len(), 3);

        let batches: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(ids(&batches[0]), vec![0, 1, 2]);
        assert_eq!(ids(&batches[2]), vec![6]);
        assert_eq!(batches[1].images.size(), vec![3, 3, 2, 2]);
        assert_eq!(batches[1].labels.size(), vec![3]);
        assert_eq!(batches[1].labels.int64_value(&[0]), 1);
        assert_eq!(batches[2].index, 2);
    }

    #[test]
    fn drop_last_discards_short_tail() {
        let mut loader = DataLoader::new(Synthetic::new(7), 3, false).drop_last(true);
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.iter().count(), 2);
    }

    #[test]
    fn shuffled_epochs_cover_everything_in_new_orders() {
        let mut loader = DataLoader::new(Synthetic::new(20), 6, true).with_seed(3);

        let epoch = |loader: &mut DataLoader<Synthetic>| -> Vec<usize> {
            loader
                .iter()
                .flat_map(|b| ids(&b.unwrap()))
                .collect()
        };
        let first = epoch(&mut loader);
        let second = epoch(&mut loader);

        assert_eq!(first.iter().copied().collect::<HashSet<_>>().len(), 20);
        assert_eq!(second.iter().copied().collect::<HashSet<_>>().len(), 20);
        assert_ne!(first, second);
        assert_ne!(first, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn batch_larger_than_dataset_is_single_batch() {
        let mut loader = DataLoader::new(Synthetic::new(4), 10, true);
        let batches: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 4);
    }

    #[test]
    fn empty_dataset_yields_nothing() {
        let mut loader = DataLoader::new(Synthetic::new(0), 4, true);
        assert!(loader.is_empty());
        assert!(loader.iter().next().is_none());
    }

    #[test]
    fn pipelines_are_applied() {
        let mut augs = AugmentationPipeline::new();
        augs.add_augmentation(random_horizontal_flip(1.0));
        let transforms = TransformPipeline::new().with(Arc::new(|t: Tensor| t + 100.0));

        let mut loader = DataLoader::new(Synthetic::new(2), 2, false)
            .with_augmentations(augs)
            .with_transforms(transforms);
        let batch = loader.iter().next().unwrap().unwrap();
        assert_eq!(ids(&batch), vec![100, 101]);
    }
}
