//! End-to-end runs over a generated on-disk dataset.
//!
//! Every test writes a handful of tiny PNG chips into a temp dir and trains
//! the small CNN on CPU, so no downloads or pretrained weights are needed.

use std::path::Path;

use tempfile::TempDir;

use satclass::config::{OptimKind, TrainConfig};
use satclass::dataset::Split;
use satclass::metrics::{EpochStats, History};
use satclass::model::Arch;
use satclass::training::{self, Normalization};
use satclass::utils::write_fixture_dataset;

const CLASSES: &[&str] = &["AnnualCrop", "Forest", "River", "SeaLake"];

fn small_config(root: &Path, out: &Path, epochs: usize) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.data.root = root.to_path_buf();
    config.data.image_size = 16;
    config.data.batch_size = 4;
    config.model.arch = Arch::SimpleCnn;
    config.optim.kind = OptimKind::Adam;
    config.optim.lr = 1e-2;
    config.train.device = "cpu".to_string();
    config.train.epochs = epochs;
    config.train.checkpoint = Some(out.join("best.ot"));
    config.train.metrics = Some(out.join("metrics.json"));
    config
}

#[test]
fn full_run_trains_and_reports_test_accuracy() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("data");
    write_fixture_dataset(&root, CLASSES, 10, 16).unwrap();
    let out = dir.path().join("out");

    let config = small_config(&root, &out, 10);
    let summary = training::run(&config).unwrap();

    assert_eq!(summary.history.epochs.len(), 10);
    assert_eq!(summary.test.samples, 8);
    assert!(summary.test.loss.is_finite());
    assert!(summary.best_epoch.is_some());
    for record in &summary.history.epochs {
        assert_eq!(record.train.samples, 24);
        assert_eq!(record.val.unwrap().samples, 8);
    }
    // classes differ by dominant colour, so the model separates them quickly
    assert!(summary.test.accuracy > 0.5, "test accuracy {}", summary.test.accuracy);

    assert!(out.join("best.ot").is_file());
    let history: History =
        serde_json::from_str(&std::fs::read_to_string(out.join("metrics.json")).unwrap()).unwrap();
    assert_eq!(history, summary.history);
}

#[test]
fn checkpoint_evaluation_matches_final_test_pass() {
    for merge_val in [false, true] {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        write_fixture_dataset(&root, CLASSES, 5, 16).unwrap();
        let out = dir.path().join("out");
        let checkpoint = out.join("best.ot");

        // one epoch, so the checkpoint holds the final weights
        let mut config = small_config(&root, &out, 1);
        config.train.merge_val = merge_val;
        let summary = training::run(&config).unwrap();
        assert_eq!(summary.best_epoch, Some(1));
        assert!(Normalization::sidecar_path(&checkpoint).is_file());

        let check = |stats: EpochStats| {
            assert_eq!(stats.samples, summary.test.samples, "merge_val={merge_val}");
            assert!((stats.accuracy - summary.test.accuracy).abs() < 1e-9, "merge_val={merge_val}");
            assert!((stats.loss - summary.test.loss).abs() < 1e-4, "merge_val={merge_val}");
        };
        check(training::evaluate_checkpoint(&config, &checkpoint, Split::Test).unwrap());

        // without the saved statistics they are re-measured on the fitted set
        std::fs::remove_file(Normalization::sidecar_path(&checkpoint)).unwrap();
        check(training::evaluate_checkpoint(&config, &checkpoint, Split::Test).unwrap());
    }
}

#[test]
fn merged_validation_and_truncation() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("data");
    write_fixture_dataset(&root, CLASSES, 5, 16).unwrap();

    let mut config = small_config(&root, &dir.path().join("out"), 2);
    config.train.merge_val = true;
    config.train.checkpoint = None;
    config.train.metrics = None;
    config.data.max_samples = Some(6);

    let summary = training::run(&config).unwrap();
    for record in &summary.history.epochs {
        assert!(record.val.is_none());
        // six train samples plus four (all) val samples
        assert_eq!(record.train.samples, 10);
    }
    assert_eq!(summary.test.samples, 4);
    // training accuracy picks the epoch when validation is merged in
    assert!(summary.history.best_epoch().is_none());
    let best = summary.best_epoch.unwrap();
    assert!((1..=2).contains(&best));
    let best_train = summary.history.epochs[best - 1].train.accuracy;
    assert!(summary.history.epochs.iter().all(|r| r.train.accuracy <= best_train));
}

#[test]
fn missing_dataset_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = small_config(&dir.path().join("absent"), dir.path(), 1);
    let err = training::run(&config).err().unwrap();
    assert!(format!("{err:#}").contains("Dataset not found"));
}
