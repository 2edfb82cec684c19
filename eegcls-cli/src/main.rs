//! eegcls CLI: runs one EEG/audio fusion classification experiment.

use clap::Parser;
use eegcls_core::config::parse_bool_token;
use eegcls_core::{
    ConfigOverrides, ConfigSources, JsonlPipelineProvider, LocalEngine, RunCoordinator,
    RunSummary, Termination,
};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train an emotion classifier on fused EEG and audio features
#[derive(Parser, Debug)]
#[command(name = "eegcls", version, about, long_about = None)]
struct Cli {
    /// Samples per training batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Parallel workers used to load feature files
    #[arg(long)]
    num_workers: Option<usize>,

    /// Fusion strategy: intra, eeg, audio
    #[arg(long)]
    fusion_type: Option<String>,

    /// Dataset name (subdirectory of the data root)
    #[arg(long)]
    data_type: Option<String>,

    /// Label: v (valence), a (arousal), av (both, four classes)
    #[arg(long)]
    label_type: Option<String>,

    /// Feature family, e.g. psd
    #[arg(long)]
    feature_type: Option<String>,

    /// Optimizer learning rate
    #[arg(long = "lr")]
    learning_rate: Option<f64>,

    /// Upper bound on training epochs
    #[arg(long)]
    max_epochs: Option<usize>,

    /// Device ids, comma separated (e.g. 0,1)
    #[arg(long = "gpus", value_delimiter = ',')]
    devices: Option<Vec<u32>>,

    /// Execution strategy: single, dp, ddp, ddp_spawn
    #[arg(long)]
    strategy: Option<String>,

    /// Rank of this process on its node
    #[arg(long)]
    local_rank: Option<usize>,

    /// Number of nodes taking part in the run
    #[arg(long = "num-nodes")]
    node_count: Option<usize>,

    /// Seed every stochastic component (yes/no, true/false, 1/0)
    #[arg(long = "reproduce", value_parser = parse_reproduce)]
    reproducible: Option<bool>,

    /// Root directory for run artifacts
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Root directory of the feature files
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Configuration file (TOML or YAML, e.g. a previous hparams.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,
}

fn parse_reproduce(token: &str) -> Result<bool, String> {
    parse_bool_token(token).map_err(|e| e.to_string())
}

impl Cli {
    fn sources(&self) -> ConfigSources {
        let overrides = ConfigOverrides {
            batch_size: self.batch_size,
            num_workers: self.num_workers,
            fusion_type: self.fusion_type.clone(),
            data_type: self.data_type.clone(),
            label_type: self.label_type.clone(),
            feature_type: self.feature_type.clone(),
            learning_rate: self.learning_rate,
            max_epochs: self.max_epochs,
            devices: self.devices.clone(),
            strategy: self.strategy.clone(),
            local_rank: self.local_rank,
            node_count: self.node_count,
            reproducible: self.reproducible,
            output_root: self.output_root.clone(),
            data_root: self.data_root.clone(),
        };
        let sources = ConfigSources::from_overrides(overrides);
        match &self.config {
            Some(path) => sources.with_file(path),
            None => sources,
        }
    }
}

/// Stderr level implied by `-v`/`-q` when `RUST_LOG` is unset.
fn default_level(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn stderr_filter(verbose: u8, quiet: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose, quiet)))
}

fn print_summary(summary: &RunSummary) {
    let config = &summary.config;
    println!(
        "\n  Run {}/{}_{} finished after {} epoch(s)",
        config.fusion_type, config.feature_type, config.label_type, summary.epochs_completed
    );
    match summary.termination {
        Termination::EarlyStopped { epoch } => println!("  Early stopped at epoch {epoch}"),
        Termination::MaxEpochsReached => println!("  Reached max epochs ({})", config.max_epochs),
    }
    match (summary.best_val_loss, summary.best_epoch) {
        (Some(loss), Some(epoch)) => println!("  Best val_loss {loss:.6} at epoch {epoch}"),
        _ => println!("  No finite val_loss observed"),
    }
    println!("  Hyperparameters: {}", summary.snapshot_path.display());
    if summary.checkpoint_writes > 0 {
        println!(
            "  Checkpoint:      {} ({} write(s))",
            summary.checkpoint_path.display(),
            summary.checkpoint_writes
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr (RUST_LOG wins over -v/-q) + JSON file logging
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter(cli.verbose, cli.quiet));

    let log_dir = directories::ProjectDirs::from("dev", "eegcls", "eegcls")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "eegcls.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let sources = cli.sources();
    let mut coordinator = RunCoordinator::new(JsonlPipelineProvider, LocalEngine::new());
    let summary = coordinator
        .run(&sources)
        .await
        .map_err(|e| anyhow::anyhow!("Run failed in {:?} phase: {}", coordinator.phase(), e))?;

    if !cli.quiet {
        print_summary(&summary);
    }
    Ok(())
}
