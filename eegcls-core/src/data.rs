//! Data pipeline: feature samples, label projection, batching, and shuffling.
//!
//! The built-in provider reads pre-extracted features from
//! `<data_root>/<data_type>/<feature_type>/{train,valid}.jsonl`, one JSON
//! object per line:
//!
//! ```json
//! {"eeg": [/* 2016 floats */], "audio": [/* 13 floats */], "valence": 1, "arousal": 0}
//! ```

use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::model::{AUDIO_FEATURE_DIM, EEG_FEATURE_DIM};
use crate::reproducibility::{DATA_COMPONENT, SeedCapability};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One pre-extracted example: EEG features, audio features, binary affect labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub eeg: Vec<f32>,
    pub audio: Vec<f32>,
    pub valence: u8,
    pub arousal: u8,
}

/// Which label a run trains against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Valence,
    Arousal,
    /// `2 * valence + arousal`, four classes.
    Combined,
}

impl LabelKind {
    pub fn parse(label_type: &str) -> Result<Self> {
        match label_type {
            "v" => Ok(Self::Valence),
            "a" => Ok(Self::Arousal),
            "av" => Ok(Self::Combined),
            other => Err(RunError::assembly(format!(
                "unsupported label type `{other}` (expected v, a, or av)"
            ))),
        }
    }

    pub fn class_count(&self) -> usize {
        match self {
            Self::Valence | Self::Arousal => 2,
            Self::Combined => 4,
        }
    }

    pub fn project(&self, sample: &Sample) -> usize {
        let v = usize::from(sample.valence > 0);
        let a = usize::from(sample.arousal > 0);
        match self {
            Self::Valence => v,
            Self::Arousal => a,
            Self::Combined => 2 * v + a,
        }
    }
}

/// Training and validation splits.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub train: Vec<Sample>,
    pub valid: Vec<Sample>,
}

/// A collated mini-batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub eeg: Vec<Vec<f32>>,
    pub audio: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Split into at most `parts` contiguous shards, dropping empty ones.
    pub fn shard(&self, parts: usize) -> Vec<Batch> {
        let parts = parts.max(1);
        let chunk = self.len().div_ceil(parts).max(1);
        (0..self.len())
            .step_by(chunk)
            .map(|start| {
                let end = (start + chunk).min(self.len());
                Batch {
                    eeg: self.eeg[start..end].to_vec(),
                    audio: self.audio[start..end].to_vec(),
                    labels: self.labels[start..end].to_vec(),
                }
            })
            .collect()
    }
}

/// Batches for one run. Training batches are reshuffled on every call.
pub trait DataPipeline: Send {
    fn train_batches(&mut self) -> Vec<Batch>;
    fn val_batches(&self) -> Vec<Batch>;
    fn train_len(&self) -> usize;
    fn val_len(&self) -> usize;
}

/// Builds the data pipeline for a run. Takes the seed capability so shuffling
/// can only start after seeding.
pub trait PipelineProvider: Send + Sync {
    fn build(&self, config: &RunConfig, seed: &SeedCapability) -> Result<Box<dyn DataPipeline>>;
}

/// In-memory pipeline over a [`Dataset`].
pub struct FeaturePipeline {
    dataset: Dataset,
    label: LabelKind,
    batch_size: usize,
    rng: StdRng,
}

impl FeaturePipeline {
    pub fn new(
        dataset: Dataset,
        label: LabelKind,
        batch_size: usize,
        seed: &SeedCapability,
    ) -> Result<Self> {
        if dataset.train.is_empty() {
            return Err(RunError::assembly("training split is empty"));
        }
        if dataset.valid.is_empty() {
            return Err(RunError::assembly("validation split is empty"));
        }
        for (split, samples) in [("train", &dataset.train), ("valid", &dataset.valid)] {
            if let Some((idx, s)) = samples
                .iter()
                .enumerate()
                .find(|(_, s)| s.eeg.len() != EEG_FEATURE_DIM || s.audio.len() != AUDIO_FEATURE_DIM)
            {
                return Err(RunError::assembly(format!(
                    "{split} sample {idx} has dims eeg={} audio={}, expected eeg={EEG_FEATURE_DIM} audio={AUDIO_FEATURE_DIM}",
                    s.eeg.len(),
                    s.audio.len()
                )));
            }
        }
        Ok(Self {
            dataset,
            label,
            batch_size: batch_size.max(1),
            rng: seed.rng_for(DATA_COMPONENT),
        })
    }

    fn collate<'a>(&self, samples: impl Iterator<Item = &'a Sample>) -> Batch {
        let mut batch = Batch::default();
        for s in samples {
            batch.eeg.push(s.eeg.clone());
            batch.audio.push(s.audio.clone());
            batch.labels.push(self.label.project(s));
        }
        batch
    }
}

impl DataPipeline for FeaturePipeline {
    fn train_batches(&mut self) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.dataset.train.len()).collect();
        order.shuffle(&mut self.rng);
        order
            .chunks(self.batch_size)
            .map(|idx| self.collate(idx.iter().map(|&i| &self.dataset.train[i])))
            .collect()
    }

    fn val_batches(&self) -> Vec<Batch> {
        self.dataset
            .valid
            .chunks(self.batch_size)
            .map(|chunk| self.collate(chunk.iter()))
            .collect()
    }

    fn train_len(&self) -> usize {
        self.dataset.train.len()
    }

    fn val_len(&self) -> usize {
        self.dataset.valid.len()
    }
}

/// Provider over a dataset already in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticDatasetProvider {
    pub dataset: Dataset,
}

impl StaticDatasetProvider {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }
}

impl PipelineProvider for StaticDatasetProvider {
    fn build(&self, config: &RunConfig, seed: &SeedCapability) -> Result<Box<dyn DataPipeline>> {
        let label = LabelKind::parse(&config.label_type)?;
        let pipeline = FeaturePipeline::new(self.dataset.clone(), label, config.batch_size, seed)?;
        Ok(Box::new(pipeline))
    }
}

/// Provider reading JSON-lines feature files from `data_root`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlPipelineProvider;

impl JsonlPipelineProvider {
    pub fn split_dir(config: &RunConfig) -> PathBuf {
        config
            .data_root
            .join(&config.data_type)
            .join(&config.feature_type)
    }
}

impl PipelineProvider for JsonlPipelineProvider {
    fn build(&self, config: &RunConfig, seed: &SeedCapability) -> Result<Box<dyn DataPipeline>> {
        let label = LabelKind::parse(&config.label_type)?;
        let dir = Self::split_dir(config);
        let dataset = Dataset {
            train: read_jsonl_samples(&dir.join("train.jsonl"), config.num_workers)?,
            valid: read_jsonl_samples(&dir.join("valid.jsonl"), config.num_workers)?,
        };
        tracing::info!(
            dir = %dir.display(),
            train = dataset.train.len(),
            valid = dataset.valid.len(),
            "Loaded feature splits"
        );
        let pipeline = FeaturePipeline::new(dataset, label, config.batch_size, seed)?;
        Ok(Box::new(pipeline))
    }
}

/// Parse a JSONL split, spreading lines over `workers` threads.
pub fn read_jsonl_samples(path: &Path, workers: usize) -> Result<Vec<Sample>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| RunError::assembly(format!("cannot read {}: {e}", path.display())))?;
    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let chunk = lines.len().div_ceil(workers.max(1));
    let parsed: Vec<Result<Vec<Sample>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = lines
            .chunks(chunk)
            .map(|part| scope.spawn(move || parse_lines(path, part)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(RunError::assembly("feature loader thread panicked")))
            })
            .collect()
    });

    let mut samples = Vec::with_capacity(lines.len());
    for part in parsed {
        samples.extend(part?);
    }
    Ok(samples)
}

fn parse_lines(path: &Path, lines: &[(usize, &str)]) -> Result<Vec<Sample>> {
    lines
        .iter()
        .map(|(no, line)| {
            serde_json::from_str(line).map_err(|e| {
                RunError::assembly(format!("{}:{}: {e}", path.display(), no + 1))
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reproducibility;
    use tempfile::TempDir;

    pub(crate) fn sample(valence: u8, arousal: u8, fill: f32) -> Sample {
        Sample {
            eeg: vec![fill; EEG_FEATURE_DIM],
            audio: vec![fill; AUDIO_FEATURE_DIM],
            valence,
            arousal,
        }
    }

    pub(crate) fn toy_dataset(n: usize) -> Dataset {
        let make = |offset: usize| {
            (0..n)
                .map(|i| {
                    let v = ((i + offset) % 2) as u8;
                    let a = (((i + offset) / 2) % 2) as u8;
                    let base = if v == 1 { 0.5 } else { -0.5 };
                    sample(v, a, base + i as f32 * 1e-3)
                })
                .collect::<Vec<_>>()
        };
        Dataset {
            train: make(0),
            valid: make(1),
        }
    }

    #[test]
    fn test_label_projection() {
        let s = sample(1, 1, 0.0);
        assert_eq!(LabelKind::Valence.project(&s), 1);
        assert_eq!(LabelKind::Arousal.project(&sample(1, 0, 0.0)), 0);
        assert_eq!(LabelKind::Combined.project(&s), 3);
        assert_eq!(LabelKind::Combined.project(&sample(0, 1, 0.0)), 1);
        assert!(LabelKind::parse("x").is_err());
    }

    #[test]
    fn test_label_classes_match_config() {
        for label in ["v", "a", "av"] {
            assert_eq!(
                LabelKind::parse(label).unwrap().class_count(),
                crate::config::class_count(label)
            );
        }
    }

    #[test]
    fn test_batching_covers_every_sample() {
        let seed = reproducibility::apply(true);
        let mut pipeline =
            FeaturePipeline::new(toy_dataset(10), LabelKind::Valence, 4, &seed).unwrap();
        let batches = pipeline.train_batches();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(pipeline.val_batches().len(), 3);
    }

    #[test]
    fn test_seeded_shuffle_repeats() {
        let seed = reproducibility::apply(true);
        let mut a = FeaturePipeline::new(toy_dataset(32), LabelKind::Combined, 8, &seed).unwrap();
        let mut b = FeaturePipeline::new(toy_dataset(32), LabelKind::Combined, 8, &seed).unwrap();
        assert_eq!(a.train_batches(), b.train_batches());
    }

    #[test]
    fn test_dimension_mismatch_is_assembly_failure() {
        let mut dataset = toy_dataset(4);
        dataset.train[2].audio.pop();
        let err = FeaturePipeline::new(dataset, LabelKind::Valence, 2, &SeedCapability::Entropy)
            .err()
            .unwrap();
        assert!(matches!(err, RunError::AssemblyFailure(_)));
    }

    #[test]
    fn test_shard_splits_evenly() {
        let seed = reproducibility::apply(true);
        let pipeline = FeaturePipeline::new(toy_dataset(5), LabelKind::Valence, 5, &seed).unwrap();
        let batch = &pipeline.val_batches()[0];
        let shards = batch.shard(2);
        assert_eq!(shards.iter().map(Batch::len).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(batch.shard(8).len(), 5);
    }

    #[test]
    fn test_read_jsonl_across_workers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.jsonl");
        let lines: Vec<String> = (0..7)
            .map(|i| serde_json::to_string(&sample((i % 2) as u8, 0, i as f32)).unwrap())
            .collect();
        std::fs::write(&path, lines.join("\n")).unwrap();

        let samples = read_jsonl_samples(&path, 3).unwrap();
        assert_eq!(samples.len(), 7);
        assert_eq!(samples[6].eeg[0], 6.0);
    }

    #[test]
    fn test_read_jsonl_reports_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("valid.jsonl");
        std::fs::write(&path, "{\"eeg\": []}\n").unwrap();
        let err = read_jsonl_samples(&path, 1).unwrap_err();
        assert!(err.to_string().contains("valid.jsonl:1"));
    }
}
