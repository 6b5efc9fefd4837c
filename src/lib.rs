//! Supervised image classification on small satellite-imagery datasets.
//!
//! The pipeline is the usual one: an [`ImageFolder`](dataset::ImageFolder)
//! split is wrapped in a [`DataLoader`](dataloader::DataLoader), batches are
//! augmented and normalised, and a tch model is trained with cross-entropy
//! for a fixed number of epochs before being scored on the test split.

pub mod augmentation_pipeline;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod model;
pub mod preview;
pub mod training;
pub mod transform_pipeline;
pub mod utils;

pub use config::TrainConfig;
pub use dataloader::{Batch, DataLoader};
pub use dataset::{Dataset, ImageFolder, Split};
pub use error::{DatasetError, Result};
