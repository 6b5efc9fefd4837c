//! Loss and accuracy bookkeeping for the epoch loop.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Mean loss and accuracy over one pass of a loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// Running totals; losses are weighted by batch size.
#[derive(Debug, Default)]
pub struct Accumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `batch_loss` is the mean loss over the `n` samples of one batch.
    pub fn update(&mut self, batch_loss: f64, correct: usize, n: usize) {
        self.loss_sum += batch_loss * n as f64;
        self.correct += correct;
        self.total += n;
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn finish(&self) -> EpochStats {
        EpochStats {
            loss: if self.total == 0 {
                0.0
            } else {
                self.loss_sum / self.total as f64
            },
            accuracy: self.accuracy(),
            samples: self.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochStats,
    pub val: Option<EpochStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    /// Epoch with the highest validation accuracy; the earliest wins ties.
    pub fn best_epoch(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .filter(|r| r.val.is_some())
            .fold(None, |best: Option<&EpochRecord>, r| match best {
                Some(b) if val_accuracy(b) >= val_accuracy(r) => Some(b),
                _ => Some(r),
            })
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn val_accuracy(r: &EpochRecord) -> f64 {
    r.val.map(|v| v.accuracy).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(epoch: usize, val_acc: Option<f64>) -> EpochRecord {
        EpochRecord {
            epoch,
            train: EpochStats::default(),
            val: val_acc.map(|accuracy| EpochStats {
                loss: 1.0,
                accuracy,
                samples: 10,
            }),
        }
    }

    #[test]
    fn accumulator_weights_by_batch_size() {
        let mut acc = Accumulator::new();
        acc.update(1.0, 3, 4);
        acc.update(4.0, 0, 1);
        let stats = acc.finish();
        assert!((stats.loss - 1.6).abs() < 1e-12);
        assert!((stats.accuracy - 0.6).abs() < 1e-12);
        assert_eq!(stats.samples, 5);
    }

    #[test]
    fn empty_accumulator_is_zero() {
        assert_eq!(Accumulator::new().finish(), EpochStats::default());
    }

    #[test]
    fn best_epoch_prefers_earliest_on_ties() {
        let mut history = History::default();
        history.push(record(1, Some(0.5)));
        history.push(record(2, Some(0.8)));
        history.push(record(3, Some(0.8)));
        history.push(record(4, None));
        assert_eq!(history.best_epoch().unwrap().epoch, 2);

        assert!(History::default().best_epoch().is_none());
    }

    #[test]
    fn history_serialises_to_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs/metrics.json");
        let mut history = History::default();
        history.push(record(1, Some(0.25)));
        history.save_json(&path).unwrap();

        let back: History = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, history);
    }
}
