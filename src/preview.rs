use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;

use crate::dataset::Dataset;
use crate::error::{DatasetError, Result};
use crate::utils::{example_to_tensor, tensor_to_rgb_image};

/// Writes sample `index` of `dataset` as an RGB image, upscaled with
/// nearest-neighbour sampling so small chips stay legible.
pub fn save_preview<D: Dataset + ?Sized>(
    dataset: &D,
    index: usize,
    scale: u32,
    path: &Path,
) -> Result<String> {
    let example = dataset.get(index)?;
    let class = dataset
        .class_names()
        .get(example.label as usize)
        .cloned()
        .unwrap_or_else(|| example.label.to_string());

    let image = tensor_to_rgb_image(&example_to_tensor(&example))?;
    let scale = scale.max(1);
    let (w, h) = image.dimensions();
    let image = DynamicImage::ImageRgb8(image).resize_exact(w * scale, h * scale, FilterType::Nearest);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ImageFolder, Split, SplitPlan};
    use crate::utils::write_fixture_dataset;
    use tempfile::TempDir;

    #[test]
    fn writes_scaled_png_and_returns_class() {
        let dir = TempDir::new().unwrap();
        write_fixture_dataset(dir.path(), &["Forest", "River"], 2, 8).unwrap();
        let plan = SplitPlan { train: 0.5, val: 0.25, seed: 0 };
        let ds = ImageFolder::with_plan(dir.path(), Split::Train, 8, &plan).unwrap();

        let out = dir.path().join("out/preview.png");
        let class = save_preview(&ds, 0, 4, &out).unwrap();
        assert!(ds.class_names().contains(&class));

        let written = image::open(&out).unwrap();
        assert_eq!((written.width(), written.height()), (32, 32));
    }

    #[test]
    fn out_of_range_index_fails() {
        let dir = TempDir::new().unwrap();
        write_fixture_dataset(dir.path(), &["Forest"], 3, 8).unwrap();
        let ds = ImageFolder::new(dir.path(), Split::Train, 8).unwrap();
        let err = save_preview(&ds, 10, 1, &dir.path().join("x.png")).err().unwrap();
        assert!(matches!(err, DatasetError::IndexOutOfRange { .. }));
    }
}
