//! Model assembly: fusion strategies, the built-in classifier, its optimizer,
//! and the [`TrainableUnit`] the training loop owns.

pub mod fusion;
pub mod optim;
pub mod unit;

pub use fusion::{BatchTotals, FusionClassifier, FusionStrategy, Gradients, StateDict, TensorData};
pub use optim::{Adam, OptimizerConfig};
pub use unit::{METRIC_VAL_LOSS, StepMetrics, TrainableUnit, assemble};

/// Dimensionality of the EEG feature vector (32 channels x 63 band-power features).
pub const EEG_FEATURE_DIM: usize = 2016;

/// Dimensionality of the audio feature vector (13 MFCCs).
pub const AUDIO_FEATURE_DIM: usize = 13;
