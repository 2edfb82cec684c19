//! Run coordinator: configuration -> seeding -> assembly -> fit loop.

use crate::config::{self, ConfigSources, RunConfig};
use crate::data::PipelineProvider;
use crate::error::Result;
use crate::model;
use crate::reproducibility;
use crate::training::callbacks::{Evaluation, LifecyclePolicy, LifecycleSignal, MonitorAction};
use crate::training::engine::TrainingEngine;
use crate::training::metrics::TrainingMetrics;
use crate::training::strategy::{self, ExecutionPlan};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Phase of a run. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Configuring,
    Seeding,
    Assembling,
    Running,
    Terminated,
}

/// Why the fit loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Termination {
    /// The early-stop monitor terminated after evaluating `epoch` (zero-based).
    EarlyStopped { epoch: usize },
    /// Every configured epoch ran.
    MaxEpochsReached,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub config: RunConfig,
    pub plan: ExecutionPlan,
    pub snapshot_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub checkpoint_writes: usize,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_completed: usize,
    pub optimizer_steps: u64,
    pub termination: Termination,
    pub metrics: TrainingMetrics,
}

/// Sequences one experiment run. The only component that knows about all others.
pub struct RunCoordinator<P, E> {
    provider: P,
    engine: E,
    phase: RunPhase,
}

impl<P: PipelineProvider, E: TrainingEngine> RunCoordinator<P, E> {
    pub fn new(provider: P, engine: E) -> Self {
        Self {
            provider,
            engine,
            phase: RunPhase::Configuring,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    fn enter(&mut self, next: RunPhase) {
        tracing::debug!(from = ?self.phase, to = ?next, "Run phase transition");
        self.phase = next;
    }

    /// Execute the run end to end. Any error aborts immediately; artifacts
    /// already written stay on disk.
    pub async fn run(&mut self, sources: &ConfigSources) -> Result<RunSummary> {
        self.phase = RunPhase::Configuring;
        let (config, snapshot_path) = config::resolve_and_persist(sources)?;

        self.enter(RunPhase::Seeding);
        let seed = reproducibility::apply(config.reproducible);

        self.enter(RunPhase::Assembling);
        let mut pipeline = self.provider.build(&config, &seed)?;
        let mut unit = model::assemble(
            &config.fusion_type,
            config.learning_rate,
            config.class_count(),
            &seed,
        )?;
        let plan = strategy::select(&config.devices, config.node_count, &config.strategy)?
            .with_local_rank(config.local_rank)?;
        let location = config.output_location();
        let mut policy = LifecyclePolicy::new(&location, plan.is_local_zero());

        self.enter(RunPhase::Running);
        let mut metrics = TrainingMetrics::default();
        let mut termination = Termination::MaxEpochsReached;
        for epoch in 0..config.max_epochs {
            let outcome = self
                .engine
                .fit_epoch(epoch, &mut unit, &plan, pipeline.as_mut(), &mut policy)
                .await?;
            metrics.record_epoch(outcome.train_loss, Some(outcome.val_loss));
            metrics.add_custom_metric("val_acc", outcome.val_accuracy);

            let eval = Evaluation {
                epoch,
                signal: LifecycleSignal::val_loss(outcome.val_loss),
                unit: &unit,
            };
            if policy.on_evaluation(&eval)? == MonitorAction::Terminate {
                termination = Termination::EarlyStopped { epoch };
                break;
            }
        }

        self.enter(RunPhase::Terminated);
        tracing::info!(
            epochs = metrics.epochs_completed,
            termination = ?termination,
            best_val_loss = ?policy.checkpoint.best_score(),
            "Run finished"
        );

        Ok(RunSummary {
            plan,
            snapshot_path,
            checkpoint_path: location.checkpoint_path(),
            checkpoint_writes: policy.checkpoint.writes(),
            best_val_loss: policy.checkpoint.best_score(),
            best_epoch: policy.checkpoint.best_epoch(),
            epochs_completed: metrics.epochs_completed,
            optimizer_steps: unit.optimizer_steps(),
            termination,
            metrics,
            config,
        })
    }
}
