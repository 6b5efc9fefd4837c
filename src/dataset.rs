//! On-disk image datasets.
//!
//! An [`ImageFolder`] root holds one sub-directory per class. Class labels
//! are assigned in sorted directory-name order. Splits come either from
//! `splits/<split>.txt` listings under the root or, when no `splits/`
//! directory exists, from a seeded partition of the full listing.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DatasetError, Result};
use crate::utils::load_image;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Split::Train),
            "val" | "validation" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(DatasetError::InvalidSplit(format!("unknown split `{other}`"))),
        }
    }
}

/// A file on disk and its class label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: i64,
}

/// A decoded image in CHW layout with values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct Example {
    pub image: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub label: i64,
}

pub trait Dataset: Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Example>;

    fn class_names(&self) -> &[String];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }

    /// File backing entry `index`, for datasets read from disk.
    fn sample_path(&self, _index: usize) -> Option<&Path> {
        None
    }
}

impl<D: Dataset + ?Sized> Dataset for Box<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        (**self).get(index)
    }

    fn class_names(&self) -> &[String] {
        (**self).class_names()
    }

    fn sample_path(&self, index: usize) -> Option<&Path> {
        (**self).sample_path(index)
    }
}

impl<D: Dataset + ?Sized> Dataset for &D {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        (**self).get(index)
    }

    fn class_names(&self) -> &[String] {
        (**self).class_names()
    }

    fn sample_path(&self, index: usize) -> Option<&Path> {
        (**self).sample_path(index)
    }
}

/// Ratios used to partition a root without split listings.
///
/// The test split receives whatever the train and val fractions leave over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitPlan {
    pub train: f64,
    pub val: f64,
    pub seed: u64,
}

impl Default for SplitPlan {
    fn default() -> Self {
        Self {
            train: 0.6,
            val: 0.2,
            seed: 0,
        }
    }
}

impl SplitPlan {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |r: f64| r > 0.0 && r < 1.0;
        if !in_unit(self.train) || !in_unit(self.val) {
            return Err(DatasetError::InvalidSplit(format!(
                "ratios must lie in (0, 1), got train={} val={}",
                self.train, self.val
            )));
        }
        if self.train + self.val >= 1.0 {
            return Err(DatasetError::InvalidSplit(format!(
                "train + val must leave room for test, got {}",
                self.train + self.val
            )));
        }
        Ok(())
    }

    /// Indices of `0..n` belonging to `split`, in ascending order.
    pub fn indices(&self, n: usize, split: Split) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.seed));

        let n_train = ((n as f64) * self.train).round() as usize;
        let n_train = n_train.min(n);
        let n_val = ((n as f64) * self.val).round() as usize;
        let n_val = n_val.min(n - n_train);

        let mut picked = match split {
            Split::Train => order[..n_train].to_vec(),
            Split::Val => order[n_train..n_train + n_val].to_vec(),
            Split::Test => order[n_train + n_val..].to_vec(),
        };
        picked.sort_unstable();
        picked
    }
}

pub struct ImageFolder {
    root: PathBuf,
    split: Split,
    image_size: u32,
    classes: Vec<String>,
    samples: Vec<Sample>,
}

impl ImageFolder {
    pub fn new(root: impl AsRef<Path>, split: Split, image_size: u32) -> Result<Self> {
        Self::with_plan(root, split, image_size, &SplitPlan::default())
    }

    pub fn with_plan(
        root: impl AsRef<Path>,
        split: Split,
        image_size: u32,
        plan: &SplitPlan,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let classes = discover_classes(&root)?;

        let split_dir = root.join("splits");
        let samples = if split_dir.is_dir() {
            read_split_file(&root, &split_dir.join(format!("{split}.txt")), &classes)?
        } else {
            plan.validate()?;
            let all = list_samples(&root, &classes)?;
            plan.indices(all.len(), split)
                .into_iter()
                .map(|i| all[i].clone())
                .collect()
        };

        debug!(root = %root.display(), %split, len = samples.len(), "indexed image folder");

        Ok(Self {
            root,
            split,
            image_size,
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        let sample = self.samples.get(index).ok_or(DatasetError::IndexOutOfRange {
            index,
            len: self.samples.len(),
        })?;
        load_image(&sample.path, self.image_size, sample.label)
    }

    fn class_names(&self) -> &[String] {
        &self.classes
    }

    fn sample_path(&self, index: usize) -> Option<&Path> {
        self.samples.get(index).map(|s| s.path.as_path())
    }
}

/// A view of another dataset restricted to `indices`.
pub struct Subset<D> {
    dataset: D,
    indices: Vec<usize>,
}

impl<D: Dataset> Subset<D> {
    pub fn new(dataset: D, indices: Vec<usize>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(DatasetError::IndexOutOfRange {
                index: bad,
                len: dataset.len(),
            });
        }
        Ok(Self { dataset, indices })
    }

    /// The first `n` entries of `dataset`.
    pub fn head(dataset: D, n: usize) -> Self {
        let indices = (0..n.min(dataset.len())).collect();
        Self { dataset, indices }
    }
}

impl<D: Dataset> Dataset for Subset<D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        let inner = self
            .indices
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                len: self.indices.len(),
            })?;
        self.dataset.get(*inner)
    }

    fn class_names(&self) -> &[String] {
        self.dataset.class_names()
    }

    fn sample_path(&self, index: usize) -> Option<&Path> {
        self.dataset.sample_path(*self.indices.get(index)?)
    }
}

/// Union of two datasets over the same classes; `first` comes before `second`.
pub struct Concat<A, B> {
    first: A,
    second: B,
}

impl<A: Dataset, B: Dataset> Concat<A, B> {
    pub fn new(first: A, second: B) -> Result<Self> {
        if first.class_names() != second.class_names() {
            return Err(DatasetError::InvalidSplit(
                "cannot concatenate datasets with different classes".to_string(),
            ));
        }
        Ok(Self { first, second })
    }
}

impl<A: Dataset, B: Dataset> Dataset for Concat<A, B> {
    fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        let head = self.first.len();
        if index < head {
            self.first.get(index)
        } else if index < self.len() {
            self.second.get(index - head)
        } else {
            Err(DatasetError::IndexOutOfRange {
                index,
                len: self.len(),
            })
        }
    }

    fn class_names(&self) -> &[String] {
        self.first.class_names()
    }

    fn sample_path(&self, index: usize) -> Option<&Path> {
        let head = self.first.len();
        if index < head {
            self.first.sample_path(index)
        } else {
            self.second.sample_path(index - head)
        }
    }
}

/// Entries of `first` whose file also appears in `second`, in `first`'s order.
pub struct Intersection<A> {
    inner: Subset<A>,
}

impl<A: Dataset> Intersection<A> {
    pub fn new<B: Dataset>(first: A, second: &B) -> Result<Self> {
        if first.class_names() != second.class_names() {
            return Err(DatasetError::InvalidSplit(
                "cannot intersect datasets with different classes".to_string(),
            ));
        }
        let keep = (0..second.len())
            .map(|i| second.sample_path(i).ok_or_else(unkeyed))
            .collect::<Result<HashSet<&Path>>>()?;
        let mut indices = Vec::new();
        for i in 0..first.len() {
            if keep.contains(first.sample_path(i).ok_or_else(unkeyed)?) {
                indices.push(i);
            }
        }
        debug!(kept = indices.len(), of = first.len(), "intersected datasets");
        Ok(Self {
            inner: Subset::new(first, indices)?,
        })
    }
}

fn unkeyed() -> DatasetError {
    DatasetError::InvalidSplit("cannot intersect datasets without sample paths".to_string())
}

impl<A: Dataset> Dataset for Intersection<A> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<Example> {
        self.inner.get(index)
    }

    fn class_names(&self) -> &[String] {
        self.inner.class_names()
    }

    fn sample_path(&self, index: usize) -> Option<&Path> {
        self.inner.sample_path(index)
    }
}

/// Per-channel mean and population standard deviation over every pixel.
pub fn channel_stats<D: Dataset + ?Sized>(dataset: &D) -> Result<(Vec<f32>, Vec<f32>)> {
    if dataset.is_empty() {
        return Err(DatasetError::InvalidSplit(
            "cannot compute statistics of an empty dataset".to_string(),
        ));
    }

    let partials = (0..dataset.len())
        .into_par_iter()
        .map(|i| {
            let ex = dataset.get(i)?;
            let plane = ex.height * ex.width;
            let mut sums = vec![(0f64, 0f64, 0usize); ex.channels];
            for (c, acc) in sums.iter_mut().enumerate() {
                for &v in &ex.image[c * plane..(c + 1) * plane] {
                    acc.0 += v as f64;
                    acc.1 += (v as f64) * (v as f64);
                }
                acc.2 += plane;
            }
            Ok(sums)
        })
        .collect::<Result<Vec<_>>>()?;

    let channels = partials[0].len();
    let mut totals = vec![(0f64, 0f64, 0usize); channels];
    for part in &partials {
        for (t, p) in totals.iter_mut().zip(part) {
            t.0 += p.0;
            t.1 += p.1;
            t.2 += p.2;
        }
    }

    let mean: Vec<f32> = totals.iter().map(|t| (t.0 / t.2 as f64) as f32).collect();
    let std = totals
        .iter()
        .map(|t| {
            let m = t.0 / t.2 as f64;
            let var = (t.1 / t.2 as f64 - m * m).max(0.0);
            (var.sqrt() as f32).max(1e-6)
        })
        .collect();
    Ok((mean, std))
}

fn discover_classes(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Err(DatasetError::NotFound {
            root: root.to_path_buf(),
        });
    }

    let mut classes: Vec<String> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(str::to_string))
        .filter(|name| name != "splits" && !name.starts_with('.'))
        .collect();
    classes.sort();

    if classes.is_empty() {
        return Err(DatasetError::NotFound {
            root: root.to_path_buf(),
        });
    }
    Ok(classes)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_samples(root: &Path, classes: &[String]) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    for (label, class) in classes.iter().enumerate() {
        let mut paths: Vec<PathBuf> = fs::read_dir(root.join(class))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        paths.sort();
        samples.extend(paths.into_iter().map(|path| Sample {
            path,
            label: label as i64,
        }));
    }
    Ok(samples)
}

/// Lines are either `<Class>/<file>` or a bare `<Class>_<n>.<ext>` file name.
fn read_split_file(root: &Path, path: &Path, classes: &[String]) -> Result<Vec<Sample>> {
    if !path.is_file() {
        return Err(DatasetError::MissingSplitFile {
            path: path.to_path_buf(),
        });
    }

    let contents = fs::read_to_string(path)?;
    let mut samples = Vec::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (class, relative) = match line.split_once('/') {
            Some((class, _)) => (class, PathBuf::from(line)),
            None => {
                let stem = Path::new(line)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(line);
                let class = stem.rsplit_once('_').map(|(c, _)| c).unwrap_or(stem);
                (class, Path::new(class).join(line))
            }
        };

        let label = classes
            .iter()
            .position(|c| c == class)
            .ok_or_else(|| DatasetError::UnknownClass {
                name: class.to_string(),
                path: path.to_path_buf(),
            })?;
        samples.push(Sample {
            path: root.join(relative),
            label: label as i64,
        });
    }

    if samples.is_empty() {
        return Err(DatasetError::MissingSplitFile {
            path: path.to_path_buf(),
        });
    }
    Ok(samples)
}
