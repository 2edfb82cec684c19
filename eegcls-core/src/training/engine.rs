//! Training execution engines.
//!
//! An engine runs the optimization steps of one epoch under an
//! [`ExecutionPlan`] and reports the validation loss. Termination decisions
//! stay with the run coordinator.

use crate::data::{Batch, DataPipeline};
use crate::error::{Result, RunError};
use crate::model::{BatchTotals, Gradients, TrainableUnit};
use crate::training::callbacks::LifecyclePolicy;
use crate::training::strategy::ExecutionPlan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of one training epoch plus its validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochOutcome {
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub steps: u64,
}

/// Drives optimization for one epoch at a time.
#[async_trait]
pub trait TrainingEngine: Send {
    /// Run every training step of `epoch`, calling `policy.on_train_step` after
    /// each optimizer step, then evaluate on the validation split.
    async fn fit_epoch(
        &mut self,
        epoch: usize,
        unit: &mut TrainableUnit,
        plan: &ExecutionPlan,
        pipeline: &mut dyn DataPipeline,
        policy: &mut LifecyclePolicy,
    ) -> Result<EpochOutcome>;
}

/// In-process engine. Data-parallel replicas run on scoped threads and their
/// gradients are summed before the single optimizer step.
#[derive(Debug, Default)]
pub struct LocalEngine {
    global_step: u64,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }
}

#[async_trait]
impl TrainingEngine for LocalEngine {
    async fn fit_epoch(
        &mut self,
        epoch: usize,
        unit: &mut TrainableUnit,
        plan: &ExecutionPlan,
        pipeline: &mut dyn DataPipeline,
        policy: &mut LifecyclePolicy,
    ) -> Result<EpochOutcome> {
        if plan.node_count > 1 {
            return Err(RunError::execution(format!(
                "local engine runs on one node, plan requests {}",
                plan.node_count
            )));
        }
        if epoch == 0 {
            tracing::info!(
                strategy = plan.strategy.as_str(),
                replicas = plan.replicas,
                sync_batchnorm = plan.sync_batchnorm,
                train = pipeline.train_len(),
                valid = pipeline.val_len(),
                "Starting local training"
            );
        }

        let mut train_loss = 0.0;
        let mut train_count = 0usize;
        let mut steps = 0u64;
        for batch in pipeline.train_batches() {
            let learning_rate = unit.current_learning_rate();
            let totals = replicated_totals(unit, &batch, plan.replicas)?;
            train_loss += totals.loss_sum;
            train_count += totals.count;
            unit.apply_gradients(totals.grads, totals.count);

            self.global_step += 1;
            steps += 1;
            policy.on_train_step(self.global_step, learning_rate);
        }

        let mut val_loss = 0.0;
        let mut val_correct = 0usize;
        let mut val_count = 0usize;
        for batch in pipeline.val_batches() {
            let totals = unit.compute_totals(&batch)?;
            val_loss += totals.loss_sum;
            val_correct += totals.correct;
            val_count += totals.count;
        }
        if val_count == 0 {
            return Err(RunError::execution("validation split produced no batches"));
        }

        let outcome = EpochOutcome {
            train_loss: train_loss / train_count.max(1) as f64,
            val_loss: val_loss / val_count as f64,
            val_accuracy: val_correct as f64 / val_count as f64,
            steps,
        };
        tracing::info!(
            epoch,
            train_loss = outcome.train_loss,
            val_loss = outcome.val_loss,
            val_acc = outcome.val_accuracy,
            "Epoch finished"
        );
        tokio::task::yield_now().await;
        Ok(outcome)
    }
}

/// Forward/backward of one batch split over `replicas`, gradients summed.
fn replicated_totals(unit: &TrainableUnit, batch: &Batch, replicas: usize) -> Result<BatchTotals> {
    if replicas <= 1 {
        return unit.compute_totals(batch);
    }
    unit.check_batch(batch)?;
    let shards = batch.shard(replicas);
    let partials: Vec<Result<BatchTotals>> = std::thread::scope(|scope| {
        let handles: Vec<_> = shards
            .iter()
            .map(|shard| scope.spawn(move || unit.compute_totals(shard)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(RunError::execution("replica thread panicked")))
            })
            .collect()
    });

    let mut merged = BatchTotals {
        loss_sum: 0.0,
        correct: 0,
        count: 0,
        grads: Gradients::zeros(unit.class_count(), unit.fusion().input_dim()),
    };
    for partial in partials {
        let partial = partial?;
        merged.loss_sum += partial.loss_sum;
        merged.correct += partial.correct;
        merged.count += partial.count;
        merged.grads.accumulate(&partial.grads);
    }
    Ok(merged)
}
