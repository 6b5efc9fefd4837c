use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset not found in `{}`, expected one sub-directory per class", root.display())]
    NotFound { root: PathBuf },

    #[error("split file `{}` lists no images", path.display())]
    MissingSplitFile { path: PathBuf },

    #[error("class `{name}` referenced by `{}` has no directory", path.display())]
    UnknownClass { name: String, path: PathBuf },

    #[error("index: {index} not found in dataset with length: {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("failed to decode `{}`", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// TIFF decoding fails for multispectral rasters (e.g. the 13-band
    /// Sentinel-2 GeoTIFFs of the full EuroSAT release).
    #[error(
        "failed to decode `{}`: only RGB, RGBA or grayscale TIFFs are supported, \
         export multispectral GeoTIFF bands to an RGB composite first",
        path.display()
    )]
    UnsupportedTiff {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("unexpected tensor shape: {0}")]
    Shape(String),

    #[error("invalid split: {0}")]
    InvalidSplit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, DatasetError>;
