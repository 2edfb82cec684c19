//! The trainable unit: model, loss, optimizer, and per-step metrics bound
//! together for one run.

use super::fusion::{BatchTotals, FusionClassifier, FusionStrategy, Gradients, StateDict};
use super::optim::{Adam, OptimizerConfig};
use crate::data::Batch;
use crate::error::{Result, RunError};
use crate::reproducibility::{MODEL_COMPONENT, SeedCapability};
use serde::{Deserialize, Serialize};

/// Name of the validation metric every lifecycle monitor keys on.
pub const METRIC_VAL_LOSS: &str = "val_loss";

/// Loss and accuracy for one step, plus the learning rate in effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub learning_rate: f64,
}

/// Model, loss, and optimizer for one run. Owned by the training loop.
#[derive(Debug, Clone)]
pub struct TrainableUnit {
    model: FusionClassifier,
    optimizer: Adam,
    fusion: FusionStrategy,
    learning_rate: f64,
}

/// Bind a fusion strategy to a freshly initialised model and optimizer.
///
/// Input dimensions are fixed by the feature extraction contract; the class
/// count comes from the resolved label type. Weight initialisation draws from
/// the `model` stream of `seed`.
pub fn assemble(
    fusion_type: &str,
    learning_rate: f64,
    class_count: usize,
    seed: &SeedCapability,
) -> Result<TrainableUnit> {
    let fusion = FusionStrategy::parse(fusion_type)?;
    if class_count < 2 {
        return Err(RunError::assembly(format!(
            "class count must be at least 2, got {class_count}"
        )));
    }
    let mut rng = seed.rng_for(MODEL_COMPONENT);
    let model = FusionClassifier::new(fusion, class_count, &mut rng);
    tracing::info!(
        fusion = fusion.as_str(),
        input_dim = model.input_dim(),
        classes = class_count,
        learning_rate,
        "Assembled trainable unit"
    );
    Ok(TrainableUnit {
        model,
        optimizer: Adam::new(OptimizerConfig::adam(learning_rate)),
        fusion,
        learning_rate,
    })
}

impl TrainableUnit {
    pub fn fusion(&self) -> FusionStrategy {
        self.fusion
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn class_count(&self) -> usize {
        self.model.classes()
    }

    /// Metric name the lifecycle policy monitors.
    pub fn monitor_metric(&self) -> &'static str {
        METRIC_VAL_LOSS
    }

    pub fn optimizer_config(&self) -> &OptimizerConfig {
        self.optimizer.config()
    }

    /// Learning rate the optimizer will apply on its next step.
    pub fn current_learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.steps()
    }

    /// Fails with an execution error when `batch` does not fit this unit's head.
    pub fn check_batch(&self, batch: &Batch) -> Result<()> {
        self.model.check_batch(batch)
    }

    pub fn forward(&self, batch: &Batch) -> Result<Vec<Vec<f32>>> {
        self.model.forward(batch)
    }

    /// Summed loss, accuracy count, and gradients, without touching the weights.
    pub fn compute_totals(&self, batch: &Batch) -> Result<BatchTotals> {
        self.model.totals(batch)
    }

    /// Mean cross-entropy of the batch.
    pub fn loss(&self, batch: &Batch) -> Result<f64> {
        if batch.is_empty() {
            return Ok(0.0);
        }
        Ok(self.model.totals(batch)?.loss_sum / batch.len() as f64)
    }

    /// Apply gradients summed over `count` examples as one optimizer step.
    pub fn apply_gradients(&mut self, mut grads: Gradients, count: usize) {
        if count == 0 {
            return;
        }
        grads.scale(1.0 / count as f32);
        let mut params = self.model.parameters_mut();
        self.optimizer
            .step(&mut params, &[grads.weight.as_slice(), grads.bias.as_slice()]);
    }

    /// Forward, loss, backward, and one optimizer step on a single batch.
    pub fn training_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let learning_rate = self.current_learning_rate();
        let totals = self.model.totals(batch)?;
        let metrics = step_metrics(&totals, learning_rate);
        self.apply_gradients(totals.grads, totals.count);
        Ok(metrics)
    }

    pub fn validation_step(&self, batch: &Batch) -> Result<StepMetrics> {
        Ok(step_metrics(&self.model.totals(batch)?, self.current_learning_rate()))
    }

    /// Weights only, for the checkpoint artifact.
    pub fn state_dict(&self) -> StateDict {
        self.model.state_dict()
    }
}

pub(crate) fn step_metrics(totals: &BatchTotals, learning_rate: f64) -> StepMetrics {
    let n = totals.count.max(1) as f64;
    StepMetrics {
        loss: totals.loss_sum / n,
        accuracy: totals.correct as f64 / n,
        learning_rate,
    }
}
