//! Training orchestration: lifecycle monitors, execution plans, engines, and the run coordinator.

pub mod callbacks;
pub mod engine;
pub mod metrics;
pub mod runner;
pub mod strategy;

pub use callbacks::{
    EarlyStopState, EarlyStopping, Evaluation, LearningRateMonitor, LifecycleMonitor,
    LifecyclePolicy, LifecycleSignal, ModelCheckpoint, MonitorAction,
};
pub use engine::{EpochOutcome, LocalEngine, TrainingEngine};
pub use metrics::TrainingMetrics;
pub use runner::{RunCoordinator, RunPhase, RunSummary, Termination};
pub use strategy::{ExecutionPlan, StrategyKind};
