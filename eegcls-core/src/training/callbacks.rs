//! Lifecycle monitors: checkpoint selection, early stopping, learning-rate logging.
//!
//! Each monitor is an independent state machine fed the same validation-loss
//! signal. None reads another's state, so their order inside
//! [`LifecyclePolicy`] does not matter.

use crate::config::OutputLocation;
use crate::error::{Result, RunError};
use crate::model::{METRIC_VAL_LOSS, TrainableUnit};
use crate::persistence;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Consecutive non-improving evaluations tolerated before stopping.
pub const EARLY_STOP_PATIENCE: usize = 20;

/// Minimum decrease that counts as an improvement.
pub const EARLY_STOP_MIN_DELTA: f64 = 0.0;

/// What a monitor asks of the run loop after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Continue,
    Terminate,
}

impl MonitorAction {
    /// OR-termination: any `Terminate` wins.
    pub fn merge(self, other: MonitorAction) -> MonitorAction {
        if self == Self::Terminate || other == Self::Terminate {
            Self::Terminate
        } else {
            Self::Continue
        }
    }
}

/// The scalar observed once per evaluation interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleSignal {
    pub metric: &'static str,
    pub value: f64,
}

impl LifecycleSignal {
    pub fn val_loss(value: f64) -> Self {
        Self {
            metric: METRIC_VAL_LOSS,
            value,
        }
    }
}

/// One evaluation: the signal plus read access to the model that produced it.
pub struct Evaluation<'a> {
    pub epoch: usize,
    pub signal: LifecycleSignal,
    pub unit: &'a TrainableUnit,
}

/// Uniform contract for lifecycle monitors.
pub trait LifecycleMonitor: Send {
    fn name(&self) -> &'static str;

    /// Called after every optimizer step.
    fn on_train_step(&mut self, _step: u64, _learning_rate: f64) {}

    /// Called once per evaluation interval with the monitored signal.
    fn on_evaluation(&mut self, eval: &Evaluation<'_>) -> Result<MonitorAction>;
}

fn check_metric(monitor: &str, expected: &str, signal: &LifecycleSignal) -> Result<()> {
    if signal.metric == expected {
        Ok(())
    } else {
        Err(RunError::execution(format!(
            "{monitor} monitors `{expected}` but received `{}`",
            signal.metric
        )))
    }
}

/// Early-stop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStopState {
    Waiting,
    /// Absorbing: no further optimization steps may be issued.
    Terminated,
}

/// Early stopping on a metric that should decrease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub monitor: String,
    pub patience: usize,
    pub min_delta: f64,
    wait_count: usize,
    best_score: f64,
    state: EarlyStopState,
    stopped_epoch: Option<usize>,
    observations: usize,
}

impl EarlyStopping {
    pub fn new(monitor: &str, patience: usize, min_delta: f64) -> Self {
        Self {
            monitor: monitor.to_string(),
            patience,
            min_delta,
            wait_count: 0,
            best_score: f64::INFINITY,
            state: EarlyStopState::Waiting,
            stopped_epoch: None,
            observations: 0,
        }
    }

    pub fn state(&self) -> EarlyStopState {
        self.state
    }

    pub fn wait_count(&self) -> usize {
        self.wait_count
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Feed one observation and advance the state machine.
    pub fn observe(&mut self, epoch: usize, value: f64) -> MonitorAction {
        self.observations += 1;
        if self.state == EarlyStopState::Terminated {
            return MonitorAction::Terminate;
        }

        if !value.is_finite() {
            tracing::info!(
                metric = %self.monitor,
                value,
                "Monitored metric is not finite, stopping"
            );
            return self.terminate(epoch);
        }

        if value < self.best_score - self.min_delta {
            tracing::info!(
                metric = %self.monitor,
                improvement = if self.best_score.is_finite() { self.best_score - value } else { f64::INFINITY },
                best = value,
                "Metric improved"
            );
            self.best_score = value;
            self.wait_count = 0;
            return MonitorAction::Continue;
        }

        self.wait_count += 1;
        if self.wait_count >= self.patience {
            tracing::info!(
                metric = %self.monitor,
                patience = self.patience,
                best = self.best_score,
                "Monitored metric did not improve within patience, stopping"
            );
            return self.terminate(epoch);
        }
        MonitorAction::Continue
    }

    fn terminate(&mut self, epoch: usize) -> MonitorAction {
        self.state = EarlyStopState::Terminated;
        self.stopped_epoch = Some(epoch);
        MonitorAction::Terminate
    }
}

impl LifecycleMonitor for EarlyStopping {
    fn name(&self) -> &'static str {
        "early_stopping"
    }

    fn on_evaluation(&mut self, eval: &Evaluation<'_>) -> Result<MonitorAction> {
        check_metric(self.name(), &self.monitor, &eval.signal)?;
        Ok(self.observe(eval.epoch, eval.signal.value))
    }
}

/// Keeps a single weights-only checkpoint of the lowest observed metric.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    pub monitor: String,
    path: PathBuf,
    write_enabled: bool,
    best_score: f64,
    best_epoch: Option<usize>,
    writes: usize,
}

impl ModelCheckpoint {
    /// `write_enabled` is false on non-zero local ranks, which track the best value without writing.
    pub fn new(monitor: &str, path: PathBuf, write_enabled: bool) -> Self {
        Self {
            monitor: monitor.to_string(),
            path,
            write_enabled,
            best_score: f64::INFINITY,
            best_epoch: None,
            writes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_epoch.map(|_| self.best_score)
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Record `value` and report whether it strictly beats the best so far.
    /// Ties and non-finite values never count.
    pub fn observe(&mut self, epoch: usize, value: f64) -> bool {
        if value.is_finite() && value < self.best_score {
            self.best_score = value;
            self.best_epoch = Some(epoch);
            true
        } else {
            false
        }
    }

    fn save(&mut self, epoch: usize, unit: &TrainableUnit) -> Result<()> {
        if !self.write_enabled {
            return Ok(());
        }
        persistence::atomic_write_json(&self.path, &unit.state_dict())?;
        self.writes += 1;
        tracing::info!(
            epoch,
            metric = %self.monitor,
            best = self.best_score,
            path = %self.path.display(),
            "Saved best checkpoint"
        );
        Ok(())
    }
}

impl LifecycleMonitor for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "model_checkpoint"
    }

    fn on_evaluation(&mut self, eval: &Evaluation<'_>) -> Result<MonitorAction> {
        check_metric(self.name(), &self.monitor, &eval.signal)?;
        if self.observe(eval.epoch, eval.signal.value) {
            self.save(eval.epoch, eval.unit)?;
        } else {
            tracing::debug!(
                epoch = eval.epoch,
                value = eval.signal.value,
                best = self.best_score,
                "Metric did not improve, checkpoint kept"
            );
        }
        Ok(MonitorAction::Continue)
    }
}

/// Learning rate observed at one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LearningRateRecord {
    pub step: u64,
    pub learning_rate: f64,
}

/// Records the learning rate once per optimizer step. Never affects control flow.
#[derive(Debug, Clone, Default)]
pub struct LearningRateMonitor {
    history: Vec<LearningRateRecord>,
}

impl LearningRateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[LearningRateRecord] {
        &self.history
    }

    pub fn last(&self) -> Option<LearningRateRecord> {
        self.history.last().copied()
    }
}

impl LifecycleMonitor for LearningRateMonitor {
    fn name(&self) -> &'static str {
        "lr_monitor"
    }

    fn on_train_step(&mut self, step: u64, learning_rate: f64) {
        tracing::debug!(step, learning_rate, "lr-Adam");
        self.history.push(LearningRateRecord {
            step,
            learning_rate,
        });
    }

    fn on_evaluation(&mut self, _eval: &Evaluation<'_>) -> Result<MonitorAction> {
        Ok(MonitorAction::Continue)
    }
}

/// The three monitors of a run, all keyed on `val_loss`.
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    pub early_stopping: EarlyStopping,
    pub checkpoint: ModelCheckpoint,
    pub lr_monitor: LearningRateMonitor,
}

impl LifecyclePolicy {
    /// Patience 20, min delta 0.0, checkpoint at `<location>/best.ckpt`.
    pub fn new(location: &OutputLocation, write_checkpoints: bool) -> Self {
        Self {
            early_stopping: EarlyStopping::new(
                METRIC_VAL_LOSS,
                EARLY_STOP_PATIENCE,
                EARLY_STOP_MIN_DELTA,
            ),
            checkpoint: ModelCheckpoint::new(
                METRIC_VAL_LOSS,
                location.checkpoint_path(),
                write_checkpoints,
            ),
            lr_monitor: LearningRateMonitor::new(),
        }
    }

    pub fn monitors_mut(&mut self) -> [&mut dyn LifecycleMonitor; 3] {
        [
            &mut self.early_stopping,
            &mut self.checkpoint,
            &mut self.lr_monitor,
        ]
    }

    pub fn on_train_step(&mut self, step: u64, learning_rate: f64) {
        for monitor in self.monitors_mut() {
            monitor.on_train_step(step, learning_rate);
        }
    }

    /// Offer the evaluation to every monitor, then OR their actions.
    ///
    /// Every monitor sees every signal even when an earlier one already asked
    /// to terminate.
    pub fn on_evaluation(&mut self, eval: &Evaluation<'_>) -> Result<MonitorAction> {
        let mut action = MonitorAction::Continue;
        for monitor in self.monitors_mut() {
            action = action.merge(monitor.on_evaluation(eval)?);
        }
        Ok(action)
    }

    pub fn is_terminated(&self) -> bool {
        self.early_stopping.state() == EarlyStopState::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::assemble;
    use crate::reproducibility;
    use tempfile::TempDir;

    fn unit() -> TrainableUnit {
        assemble("audio", 1e-3, 2, &reproducibility::apply(true)).unwrap()
    }

    fn feed(policy: &mut LifecyclePolicy, unit: &TrainableUnit, values: &[f64]) -> Vec<MonitorAction> {
        values
            .iter()
            .enumerate()
            .map(|(epoch, &value)| {
                policy
                    .on_evaluation(&Evaluation {
                        epoch,
                        signal: LifecycleSignal::val_loss(value),
                        unit,
                    })
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStopping::new(METRIC_VAL_LOSS, 3, 0.01);
        assert_eq!(cb.observe(1, 0.5), MonitorAction::Continue); // first: sets best=0.5
        assert_eq!(cb.observe(2, 0.4), MonitorAction::Continue); // improves: best=0.4, counter=0
        assert_eq!(cb.observe(3, 0.395), MonitorAction::Continue); // within min_delta: counter=1
        assert_eq!(cb.observe(4, 0.4), MonitorAction::Continue); // no improve: counter=2
        assert_eq!(cb.observe(5, 0.4), MonitorAction::Terminate); // counter=3 >= patience
        assert_eq!(cb.stopped_epoch(), Some(5));
    }

    #[test]
    fn test_strictly_decreasing_never_stops() {
        let mut cb = EarlyStopping::new(METRIC_VAL_LOSS, EARLY_STOP_PATIENCE, EARLY_STOP_MIN_DELTA);
        for i in 0..100 {
            assert_eq!(cb.observe(i, 10.0 - i as f64 * 0.01), MonitorAction::Continue);
        }
        assert_eq!(cb.state(), EarlyStopState::Waiting);
        assert_eq!(cb.wait_count(), 0);
    }

    #[test]
    fn test_stops_on_exactly_twentieth_plateau() {
        let mut cb = EarlyStopping::new(METRIC_VAL_LOSS, EARLY_STOP_PATIENCE, EARLY_STOP_MIN_DELTA);
        assert_eq!(cb.observe(0, 0.7), MonitorAction::Continue);
        for i in 1..20 {
            assert_eq!(cb.observe(i, 0.7), MonitorAction::Continue, "stopped early at {i}");
        }
        assert_eq!(cb.observe(20, 0.7), MonitorAction::Terminate);
        assert_eq!(cb.state(), EarlyStopState::Terminated);
        // Absorbing.
        assert_eq!(cb.observe(21, 0.1), MonitorAction::Terminate);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut cb = EarlyStopping::new(METRIC_VAL_LOSS, EARLY_STOP_PATIENCE, EARLY_STOP_MIN_DELTA);
        cb.observe(0, 1.0);
        for i in 1..=19 {
            cb.observe(i, 1.0);
        }
        assert_eq!(cb.wait_count(), 19);
        assert_eq!(cb.observe(20, 0.99), MonitorAction::Continue);
        assert_eq!(cb.wait_count(), 0);
    }

    #[test]
    fn test_non_finite_stops_immediately() {
        let mut cb = EarlyStopping::new(METRIC_VAL_LOSS, EARLY_STOP_PATIENCE, EARLY_STOP_MIN_DELTA);
        cb.observe(0, 0.5);
        assert_eq!(cb.observe(1, f64::NAN), MonitorAction::Terminate);
    }

    #[test]
    fn test_checkpoint_keeps_lowest() {
        let dir = TempDir::new().unwrap();
        let location = OutputLocation::new(dir.path(), "audio", "psd", "v");
        let mut policy = LifecyclePolicy::new(&location, true);
        let unit = unit();

        let actions = feed(&mut policy, &unit, &[0.5, 0.4, 0.6, 0.3, 0.35]);
        assert!(actions.iter().all(|a| *a == MonitorAction::Continue));
        assert_eq!(policy.checkpoint.writes(), 3);
        assert_eq!(policy.checkpoint.best_score(), Some(0.3));
        assert_eq!(policy.checkpoint.best_epoch(), Some(3));

        let saved: crate::model::StateDict =
            persistence::load_json(policy.checkpoint.path()).unwrap().unwrap();
        assert_eq!(saved, unit.state_dict());
    }

    #[test]
    fn test_checkpoint_ties_do_not_write() {
        let dir = TempDir::new().unwrap();
        let location = OutputLocation::new(dir.path(), "audio", "psd", "v");
        let mut policy = LifecyclePolicy::new(&location, true);
        feed(&mut policy, &unit(), &[0.5, 0.5, 0.5, f64::NAN]);
        assert_eq!(policy.checkpoint.writes(), 1);
    }

    #[test]
    fn test_non_zero_rank_does_not_write() {
        let dir = TempDir::new().unwrap();
        let location = OutputLocation::new(dir.path(), "audio", "psd", "v");
        let mut policy = LifecyclePolicy::new(&location, false);
        feed(&mut policy, &unit(), &[0.5, 0.4]);
        assert_eq!(policy.checkpoint.writes(), 0);
        assert_eq!(policy.checkpoint.best_score(), Some(0.4));
        assert!(!location.checkpoint_path().exists());
    }

    #[test]
    fn test_policy_offers_every_signal_to_every_monitor() {
        let dir = TempDir::new().unwrap();
        let location = OutputLocation::new(dir.path(), "audio", "psd", "v");
        let mut policy = LifecyclePolicy::new(&location, true);
        let unit = unit();
        let mut values = vec![0.9];
        values.extend(std::iter::repeat_n(1.0, 20));

        let actions = feed(&mut policy, &unit, &values);
        assert_eq!(actions.last(), Some(&MonitorAction::Terminate));
        assert!(policy.is_terminated());
        assert_eq!(policy.early_stopping.observations(), 21);
        assert_eq!(policy.checkpoint.writes(), 1);
    }

    #[test]
    fn test_lr_monitor_records_steps_only() {
        let dir = TempDir::new().unwrap();
        let location = OutputLocation::new(dir.path(), "audio", "psd", "v");
        let mut policy = LifecyclePolicy::new(&location, true);
        for step in 1..=3 {
            policy.on_train_step(step, 1e-3);
        }
        feed(&mut policy, &unit(), &[0.5]);
        assert_eq!(policy.lr_monitor.history().len(), 3);
        assert_eq!(
            policy.lr_monitor.last(),
            Some(LearningRateRecord {
                step: 3,
                learning_rate: 1e-3
            })
        );
    }

    #[test]
    fn test_wrong_metric_is_execution_failure() {
        let mut cb = EarlyStopping::new(METRIC_VAL_LOSS, 3, 0.0);
        let unit = unit();
        let err = cb
            .on_evaluation(&Evaluation {
                epoch: 0,
                signal: LifecycleSignal {
                    metric: "train_loss",
                    value: 0.1,
                },
                unit: &unit,
            })
            .unwrap_err();
        assert!(matches!(err, RunError::ExecutionFailure(_)));
    }

    #[test]
    fn test_checkpoint_write_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        let mut cb = ModelCheckpoint::new(METRIC_VAL_LOSS, blocker.join("best.ckpt"), true);
        let unit = unit();
        let err = cb
            .on_evaluation(&Evaluation {
                epoch: 0,
                signal: LifecycleSignal::val_loss(0.3),
                unit: &unit,
            })
            .unwrap_err();
        assert!(matches!(err, RunError::SnapshotWriteFailure { .. }));
    }
}
