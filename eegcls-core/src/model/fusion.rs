//! Fusion strategies and the softmax-linear classifier head.

use super::{AUDIO_FEATURE_DIM, EEG_FEATURE_DIM};
use crate::data::Batch;
use crate::error::{Result, RunError};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the EEG and audio modalities are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Joint head over the concatenated EEG and audio features.
    Intra,
    /// EEG features only.
    Eeg,
    /// Audio features only.
    Audio,
}

impl FusionStrategy {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "intra" => Ok(Self::Intra),
            "eeg" => Ok(Self::Eeg),
            "audio" => Ok(Self::Audio),
            other => Err(RunError::assembly(format!(
                "unsupported fusion type `{other}` (expected intra, eeg, or audio)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intra => "intra",
            Self::Eeg => "eeg",
            Self::Audio => "audio",
        }
    }

    pub fn input_dim(&self) -> usize {
        match self {
            Self::Intra => EEG_FEATURE_DIM + AUDIO_FEATURE_DIM,
            Self::Eeg => EEG_FEATURE_DIM,
            Self::Audio => AUDIO_FEATURE_DIM,
        }
    }

    fn features<'a>(&self, eeg: &'a [f32], audio: &'a [f32]) -> impl Iterator<Item = f32> + 'a {
        let (head, tail): (&[f32], &[f32]) = match self {
            Self::Intra => (eeg, audio),
            Self::Eeg => (eeg, &[]),
            Self::Audio => (audio, &[]),
        };
        head.iter().chain(tail.iter()).copied()
    }
}

/// Gradients for every classifier parameter, summed over the examples seen.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Gradients {
    pub fn zeros(classes: usize, input_dim: usize) -> Self {
        Self {
            weight: vec![0.0; classes * input_dim],
            bias: vec![0.0; classes],
        }
    }

    pub fn accumulate(&mut self, other: &Gradients) {
        for (a, b) in self.weight.iter_mut().zip(&other.weight) {
            *a += b;
        }
        for (a, b) in self.bias.iter_mut().zip(&other.bias) {
            *a += b;
        }
    }

    pub fn scale(&mut self, factor: f32) {
        self.weight.iter_mut().for_each(|g| *g *= factor);
        self.bias.iter_mut().for_each(|g| *g *= factor);
    }
}

/// Sums over a batch: loss, correct predictions, gradients.
#[derive(Debug, Clone)]
pub struct BatchTotals {
    pub loss_sum: f64,
    pub correct: usize,
    pub count: usize,
    pub grads: Gradients,
}

/// One named parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Model weights only; no optimizer or trainer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub fusion_type: FusionStrategy,
    pub class_count: usize,
    pub tensors: BTreeMap<String, TensorData>,
}

/// Linear classification head over the fused feature vector.
#[derive(Debug, Clone)]
pub struct FusionClassifier {
    strategy: FusionStrategy,
    classes: usize,
    input_dim: usize,
    /// Row-major `[classes, input_dim]`.
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl FusionClassifier {
    /// Xavier-uniform weights, zero bias.
    pub fn new(strategy: FusionStrategy, classes: usize, rng: &mut StdRng) -> Self {
        let input_dim = strategy.input_dim();
        let limit = (6.0 / (input_dim + classes) as f32).sqrt();
        let weight = (0..classes * input_dim)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        Self {
            strategy,
            classes,
            input_dim,
            weight,
            bias: vec![0.0; classes],
        }
    }

    pub fn strategy(&self) -> FusionStrategy {
        self.strategy
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Mutable views of every parameter, in the same order as [`Gradients`] fields.
    pub fn parameters_mut(&mut self) -> [&mut [f32]; 2] {
        [self.weight.as_mut_slice(), self.bias.as_mut_slice()]
    }

    fn logits_for(&self, eeg: &[f32], audio: &[f32]) -> Vec<f32> {
        let x: Vec<f32> = self.strategy.features(eeg, audio).collect();
        (0..self.classes)
            .map(|c| {
                let row = &self.weight[c * self.input_dim..(c + 1) * self.input_dim];
                row.iter().zip(&x).map(|(w, v)| w * v).sum::<f32>() + self.bias[c]
            })
            .collect()
    }

    /// Reject batches this head cannot score: ragged columns, rows of the
    /// wrong width, or labels outside `0..classes`.
    pub fn check_batch(&self, batch: &Batch) -> Result<()> {
        let rows = batch.eeg.len();
        if batch.audio.len() != rows || batch.labels.len() != rows {
            return Err(RunError::execution(format!(
                "ragged batch: {rows} eeg rows, {} audio rows, {} labels",
                batch.audio.len(),
                batch.labels.len()
            )));
        }
        let rows_iter = batch.eeg.iter().zip(&batch.audio).zip(&batch.labels);
        for (i, ((eeg, audio), &label)) in rows_iter.enumerate() {
            if eeg.len() != EEG_FEATURE_DIM || audio.len() != AUDIO_FEATURE_DIM {
                return Err(RunError::execution(format!(
                    "batch row {i} has dims eeg={} audio={}, expected eeg={EEG_FEATURE_DIM} audio={AUDIO_FEATURE_DIM}",
                    eeg.len(),
                    audio.len()
                )));
            }
            if label >= self.classes {
                return Err(RunError::execution(format!(
                    "batch row {i} has label {label}, head has {} classes",
                    self.classes
                )));
            }
        }
        Ok(())
    }

    /// Raw class scores, one row per example.
    pub fn forward(&self, batch: &Batch) -> Result<Vec<Vec<f32>>> {
        self.check_batch(batch)?;
        Ok(batch
            .eeg
            .iter()
            .zip(&batch.audio)
            .map(|(e, a)| self.logits_for(e, a))
            .collect())
    }

    /// Cross-entropy totals and gradients for a batch.
    pub fn totals(&self, batch: &Batch) -> Result<BatchTotals> {
        self.check_batch(batch)?;
        let mut grads = Gradients::zeros(self.classes, self.input_dim);
        let mut loss_sum = 0.0f64;
        let mut correct = 0;

        for ((eeg, audio), &label) in batch.eeg.iter().zip(&batch.audio).zip(&batch.labels) {
            let logits = self.logits_for(eeg, audio);
            let probs = softmax(&logits);
            loss_sum += -f64::from(probs[label].max(f32::MIN_POSITIVE)).ln();
            if argmax(&logits) == label {
                correct += 1;
            }

            let x: Vec<f32> = self.strategy.features(eeg, audio).collect();
            for (c, p) in probs.iter().enumerate() {
                let delta = p - if c == label { 1.0 } else { 0.0 };
                grads.bias[c] += delta;
                let row = &mut grads.weight[c * self.input_dim..(c + 1) * self.input_dim];
                for (g, v) in row.iter_mut().zip(&x) {
                    *g += delta * v;
                }
            }
        }

        Ok(BatchTotals {
            loss_sum,
            correct,
            count: batch.len(),
            grads,
        })
    }

    pub fn state_dict(&self) -> StateDict {
        let mut tensors = BTreeMap::new();
        tensors.insert(
            "head.weight".to_string(),
            TensorData {
                shape: vec![self.classes, self.input_dim],
                values: self.weight.clone(),
            },
        );
        tensors.insert(
            "head.bias".to_string(),
            TensorData {
                shape: vec![self.classes],
                values: self.bias.clone(),
            },
        );
        StateDict {
            fusion_type: self.strategy,
            class_count: self.classes,
            tensors,
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reproducibility::{self, MODEL_COMPONENT};

    fn one_example(label: usize) -> Batch {
        Batch {
            eeg: vec![vec![0.1; EEG_FEATURE_DIM]],
            audio: vec![vec![1.0; AUDIO_FEATURE_DIM]],
            labels: vec![label],
        }
    }

    #[test]
    fn test_parse_fusion() {
        assert_eq!(FusionStrategy::parse("intra").unwrap(), FusionStrategy::Intra);
        assert_eq!(FusionStrategy::parse("audio").unwrap().input_dim(), 13);
        assert!(matches!(
            FusionStrategy::parse("cross"),
            Err(RunError::AssemblyFailure(_))
        ));
    }

    #[test]
    fn test_input_dims() {
        assert_eq!(FusionStrategy::Intra.input_dim(), 2029);
        assert_eq!(FusionStrategy::Eeg.input_dim(), 2016);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(argmax(&p), 3);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut rng = reproducibility::apply(true).rng_for(MODEL_COMPONENT);
        let mut model = FusionClassifier::new(FusionStrategy::Audio, 2, &mut rng);
        let batch = one_example(1);
        let analytic = model.totals(&batch).unwrap().grads.bias[1];

        let eps = 1e-3;
        model.bias[1] += eps;
        let up = model.totals(&batch).unwrap().loss_sum;
        model.bias[1] -= 2.0 * eps;
        let down = model.totals(&batch).unwrap().loss_sum;
        let numeric = (up - down) / (2.0 * f64::from(eps));

        assert!((f64::from(analytic) - numeric).abs() < 1e-2, "{analytic} vs {numeric}");
    }

    #[test]
    fn test_label_outside_head_is_execution_failure() {
        let mut rng = reproducibility::apply(true).rng_for(MODEL_COMPONENT);
        let model = FusionClassifier::new(FusionStrategy::Intra, 2, &mut rng);
        let err = model.totals(&one_example(3)).unwrap_err();
        assert!(matches!(err, RunError::ExecutionFailure(_)));
        assert!(model.totals(&one_example(1)).is_ok());
    }

    #[test]
    fn test_wrong_row_width_is_execution_failure() {
        let mut rng = reproducibility::apply(true).rng_for(MODEL_COMPONENT);
        let model = FusionClassifier::new(FusionStrategy::Eeg, 2, &mut rng);
        let mut batch = one_example(0);
        batch.eeg[0].truncate(100);
        assert!(matches!(model.forward(&batch), Err(RunError::ExecutionFailure(_))));

        let mut ragged = one_example(0);
        ragged.labels.push(1);
        assert!(matches!(model.totals(&ragged), Err(RunError::ExecutionFailure(_))));
    }

    #[test]
    fn test_state_dict_shapes() {
        let mut rng = reproducibility::apply(true).rng_for(MODEL_COMPONENT);
        let model = FusionClassifier::new(FusionStrategy::Intra, 4, &mut rng);
        let state = model.state_dict();
        assert_eq!(state.class_count, 4);
        assert_eq!(state.tensors["head.weight"].shape, vec![4, 2029]);
        assert_eq!(state.tensors["head.bias"].values, vec![0.0; 4]);
    }
}
