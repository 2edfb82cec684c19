//! Per-epoch metric history for a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Loss history and best validation epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub custom_metrics: BTreeMap<String, Vec<f64>>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
}

impl TrainingMetrics {
    /// Record one epoch. `best_epoch` is zero-based.
    pub fn record_epoch(&mut self, loss: f64, val_loss: Option<f64>) {
        self.loss_history.push(loss);
        if let Some(vl) = val_loss {
            self.val_loss_history.push(vl);
        }
        let epoch = self.epochs_completed;
        self.epochs_completed += 1;

        let check_loss = val_loss.unwrap_or(loss);
        if check_loss.is_finite() && self.best_loss.is_none_or(|best| check_loss < best) {
            self.best_loss = Some(check_loss);
            self.best_epoch = Some(epoch);
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_metrics() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.5, Some(0.6));
        metrics.record_epoch(0.3, Some(0.4));
        metrics.record_epoch(0.2, Some(0.45));
        assert_eq!(metrics.epochs_completed, 3);
        assert_eq!(metrics.best_epoch, Some(1));
        assert_eq!(metrics.best_loss, Some(0.4));
    }

    #[test]
    fn test_nan_never_best() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(f64::NAN, Some(f64::NAN));
        assert_eq!(metrics.best_loss, None);
        metrics.add_custom_metric("val_acc", 0.75);
        assert_eq!(metrics.custom_metrics["val_acc"], vec![0.75]);
    }
}
