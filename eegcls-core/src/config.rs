//! Run configuration: defaults, layered resolution, derived fields, and the
//! persisted `hparams.yaml` snapshot.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> command-line overrides. Derived values (`class_count`,
//! `output_location`) are computed on demand and never stored on the struct.

use crate::error::{Result, RunError};
use crate::persistence;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the configuration snapshot inside an output location.
pub const SNAPSHOT_FILE: &str = "hparams.yaml";

/// File name of the retained best checkpoint inside an output location.
pub const CHECKPOINT_FILE: &str = "best.ckpt";

/// Label type that combines valence and arousal into four classes.
pub const COMBINED_LABEL: &str = "av";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "EEGCLS_";

/// Fully resolved settings for one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub fusion_type: String,
    pub data_type: String,
    pub label_type: String,
    pub feature_type: String,
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub devices: Vec<u32>,
    pub strategy: String,
    pub local_rank: usize,
    pub node_count: usize,
    /// Fix every random source to a single seed before anything stochastic is built.
    #[serde(deserialize_with = "bool_token::deserialize")]
    pub reproducible: bool,
    /// Parent directory of every output location.
    pub output_root: PathBuf,
    /// Root of the feature files read by the built-in data pipeline.
    pub data_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            num_workers: 4,
            fusion_type: "intra".to_string(),
            data_type: "deap".to_string(),
            label_type: "v".to_string(),
            feature_type: "psd".to_string(),
            learning_rate: 1e-3,
            max_epochs: 200,
            devices: vec![0],
            strategy: "dp".to_string(),
            local_rank: 0,
            node_count: 1,
            reproducible: false,
            output_root: PathBuf::from("exp"),
            data_root: PathBuf::from("dataset"),
        }
    }
}

impl RunConfig {
    /// Number of output classes implied by the label type.
    pub fn class_count(&self) -> usize {
        class_count(&self.label_type)
    }

    /// Directory shared by the configuration snapshot and the checkpoint.
    pub fn output_location(&self) -> OutputLocation {
        OutputLocation::new(
            &self.output_root,
            &self.fusion_type,
            &self.feature_type,
            &self.label_type,
        )
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RunError::invalid_config("batch_size", "must be at least 1"));
        }
        if self.max_epochs == 0 {
            return Err(RunError::invalid_config("max_epochs", "must be at least 1"));
        }
        if self.node_count == 0 {
            return Err(RunError::invalid_config("node_count", "must be at least 1"));
        }
        if self.devices.is_empty() {
            return Err(RunError::invalid_config("devices", "at least one device is required"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(RunError::invalid_config(
                "learning_rate",
                format!("must be a positive finite number, got {}", self.learning_rate),
            ));
        }
        // Each value becomes exactly one path component under output_root.
        for (key, value) in [
            ("fusion_type", &self.fusion_type),
            ("feature_type", &self.feature_type),
            ("label_type", &self.label_type),
        ] {
            if !is_path_component(value) {
                return Err(RunError::invalid_config(
                    key,
                    format!("`{value}` must be non-empty, not `.` or `..`, and contain no path separator"),
                ));
            }
        }
        Ok(())
    }
}

/// Number of classes for a label type: 4 for the combined valence/arousal label, else 2.
pub fn class_count(label_type: &str) -> usize {
    if label_type == COMBINED_LABEL { 4 } else { 2 }
}

fn is_path_component(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\'])
}

/// `<output_root>/<fusion_type>/<feature_type>_<label_type>`.
///
/// Runs with the same triple share a location and overwrite each other's
/// artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputLocation(PathBuf);

impl OutputLocation {
    pub fn new(root: &Path, fusion_type: &str, feature_type: &str, label_type: &str) -> Self {
        Self(
            root.join(fusion_type)
                .join(format!("{feature_type}_{label_type}")),
        )
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.0.join(SNAPSHOT_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.0.join(CHECKPOINT_FILE)
    }
}

/// Explicit overrides, typically from the command line. `None` leaves lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fusion_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reproducible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_root: Option<PathBuf>,
}

/// Where configuration values come from, lowest priority first:
/// built-in defaults, `file`, `EEGCLS_*` environment variables, `overrides`.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    pub use_env: bool,
    pub overrides: ConfigOverrides,
}

impl Default for ConfigSources {
    fn default() -> Self {
        Self {
            file: None,
            use_env: true,
            overrides: ConfigOverrides::default(),
        }
    }
}

impl ConfigSources {
    pub fn from_overrides(overrides: ConfigOverrides) -> Self {
        Self {
            overrides,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }
}

/// Merge all sources into a validated [`RunConfig`]. Performs no I/O besides reading `file`.
pub fn resolve(sources: &ConfigSources) -> Result<RunConfig> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(file) = &sources.file {
        if !file.exists() {
            return Err(RunError::invalid_config(
                "config",
                format!("file not found: {}", file.display()),
            ));
        }
        // Snapshots are YAML, so a previous run's hparams.yaml can seed a new one.
        figment = match file.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
            _ => figment.merge(Toml::file(file)),
        };
    }

    if sources.use_env {
        figment = figment.merge(Env::prefixed(ENV_PREFIX));
    }

    figment = figment.merge(Serialized::defaults(&sources.overrides));

    let config: RunConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Everything persisted in `hparams.yaml`: resolved fields plus derived ones.
#[derive(Debug, Serialize)]
struct ConfigSnapshot<'a> {
    #[serde(flatten)]
    config: &'a RunConfig,
    class_count: usize,
    output_dir: &'a Path,
}

/// Create the output location and write the configuration snapshot into it.
///
/// Must run before any seeding or training side effect.
pub fn write_snapshot(config: &RunConfig) -> Result<PathBuf> {
    let location = config.output_location();
    std::fs::create_dir_all(location.path())
        .map_err(|e| RunError::snapshot_write(location.path(), e))?;

    let path = location.snapshot_path();
    let snapshot = ConfigSnapshot {
        config,
        class_count: config.class_count(),
        output_dir: location.path(),
    };
    persistence::atomic_write_yaml(&path, &snapshot)?;
    tracing::info!(path = %path.display(), "Saved configuration snapshot");
    Ok(path)
}

/// Resolve the configuration and persist its snapshot in one step.
pub fn resolve_and_persist(sources: &ConfigSources) -> Result<(RunConfig, PathBuf)> {
    let config = resolve(sources)?;
    let snapshot = write_snapshot(&config)?;
    Ok((config, snapshot))
}

/// Parse a boolean token: `yes/true/t/y/1` or `no/false/f/n/0`, case-insensitive.
pub fn parse_bool_token(token: &str) -> Result<bool> {
    match token.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "t" | "y" | "1" => Ok(true),
        "no" | "false" | "f" | "n" | "0" => Ok(false),
        other => Err(RunError::invalid_config(
            "reproducible",
            format!("boolean value expected, got `{other}`"),
        )),
    }
}

/// Serde adapter accepting native booleans, 0/1, or the token vocabulary of
/// [`parse_bool_token`], so every configuration layer coerces the same way.
mod bool_token {
    use serde::Deserializer;
    use serde::de::{self, Visitor};
    use std::fmt;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        deserializer.deserialize_any(BoolTokenVisitor)
    }

    struct BoolTokenVisitor;

    impl Visitor<'_> for BoolTokenVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a boolean or one of yes/true/t/y/1/no/false/f/n/0")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::custom(format!("boolean value expected, got `{v}`"))),
            }
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::custom(format!("boolean value expected, got `{v}`"))),
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
            super::parse_bool_token(v).map_err(|_| E::custom(format!("boolean value expected, got `{v}`")))
        }
    }
}
