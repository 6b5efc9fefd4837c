use std::fs;
use std::path::Path;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use tch::{Kind, Tensor};

use crate::dataset::Example;
use crate::error::{DatasetError, Result};

/// Decodes `path` into a square RGB example of side `size`.
pub fn load_image(path: &Path, size: u32, label: i64) -> Result<Example> {
    let img = image::open(path).map_err(|source| {
        let path = path.to_path_buf();
        if is_tiff(&path) {
            DatasetError::UnsupportedTiff { path, source }
        } else {
            DatasetError::Image { path, source }
        }
    })?;
    let img = img.resize_exact(size, size, FilterType::Triangle).to_rgb32f();

    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut chw = vec![0f32; 3 * plane];
    for (i, px) in img.into_raw().chunks_exact(3).enumerate() {
        for c in 0..3 {
            chw[c * plane + i] = px[c];
        }
    }

    Ok(Example {
        image: chw,
        channels: 3,
        height: height as usize,
        width: width as usize,
        label,
    })
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
}

pub fn example_to_tensor(ex: &Example) -> Tensor {
    Tensor::from_slice(&ex.image).view([ex.channels as i64, ex.height as i64, ex.width as i64])
}

/// Converts a `[3, H, W]` float tensor in `[0, 1]` to an 8-bit image.
pub fn tensor_to_rgb_image(t: &Tensor) -> Result<RgbImage> {
    let (_, h, w) = t.size3()?;
    let bytes = (t.clamp(0.0, 1.0) * 255.0)
        .round()
        .to_kind(Kind::Uint8)
        .permute([1, 2, 0])
        .contiguous()
        .view([-1]);
    let raw = Vec::<u8>::try_from(&bytes)?;
    RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| DatasetError::Shape(format!("{:?} is not an RGB image", t.size())))
}

/// Inverse of [`tensor_to_rgb_image`].
pub fn rgb_image_to_tensor(i: &RgbImage) -> Tensor {
    let (w, h) = i.dimensions();
    Tensor::from_slice(i.as_raw())
        .view([h as i64, w as i64, 3])
        .permute([2, 0, 1])
        .to_kind(Kind::Float)
        / 255.0
}

/// Writes `per_class` PNGs of side `size` for every class under `root`.
///
/// Each class gets a dominant colour channel over a class-specific floor,
/// plus a horizontal ramp so per-channel variance is non-zero.
pub fn write_fixture_dataset(
    root: &Path,
    classes: &[&str],
    per_class: usize,
    size: u32,
) -> Result<()> {
    for (k, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        fs::create_dir_all(&dir)?;
        for n in 0..per_class {
            let img = RgbImage::from_fn(size, size, |x, _| {
                let ramp = (x * 200 / size.max(1)) as u8;
                let floor = ramp / 4 + 40 * (k / 3 % 4) as u8;
                let mut px = [floor; 3];
                px[k % 3] = 55 + ramp;
                Rgb(px)
            });
            let path = dir.join(format!("{class}_{n}.png"));
            img.save(&path).map_err(|source| DatasetError::Image { path, source })?;
        }
    }
    Ok(())
}
