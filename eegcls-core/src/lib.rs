//! # eegcls-core: experiment orchestration for EEG/audio fusion classifiers
//!
//! Turns a flat set of configuration values into one supervised training run:
//!
//! 1. **Configuration**: layered resolution, derived class count and output
//!    location, `hparams.yaml` snapshot written before anything else happens.
//! 2. **Reproducibility**: an explicit seed capability handed to every
//!    stochastic component.
//! 3. **Assembly**: fusion strategy, classifier head, loss, and optimizer
//!    bound into a [`TrainableUnit`].
//! 4. **Lifecycle policy**: checkpointing, early stopping, and learning-rate
//!    logging keyed on `val_loss`.
//! 5. **Execution**: strategy selection and the fit loop.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod persistence;
pub mod reproducibility;
pub mod training;

// Re-exports
pub use config::{ConfigOverrides, ConfigSources, OutputLocation, RunConfig};
pub use data::{JsonlPipelineProvider, PipelineProvider, StaticDatasetProvider};
pub use error::{Result, RunError};
pub use model::{METRIC_VAL_LOSS, TrainableUnit};
pub use reproducibility::SeedCapability;
pub use training::{LocalEngine, RunCoordinator, RunSummary, Termination, TrainingEngine};
