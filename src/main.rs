use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use washlens::core::{CommandTrainer, DatasetSyncOrchestrator, DirectoryRunRegistry, SqlRecordStore};
use washlens::detection::{DetectionBackend, SidecarRuntime};
use washlens::{
    ModalityLayout, ModalityOutcome, ModelKind, PipelineConfig, RetrainPipeline, StainStrategy,
    SymbolStrategy, SyncPolicy, logging,
};

#[derive(Parser)]
#[command(name = "washlens")]
#[command(about = "Retrain, calibrate and evaluate the stain and care-symbol detectors")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Base directory for relative paths (overrides the config file)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Record store connection URL (`mysql://...` or `sqlite:...`)
    #[arg(long, value_name = "URL")]
    database_url: Option<String>,

    /// What to do when the record store cannot be reached
    #[arg(long, value_enum)]
    sync_policy: Option<SyncPolicy>,

    /// Train on the existing pools without syncing
    #[arg(long)]
    skip_sync: bool,

    /// Run a single model type
    #[arg(long, value_name = "TYPE")]
    only: Option<ModelKind>,

    /// Never load models on the accelerator
    #[arg(long)]
    cpu_only: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(policy) = self.sync_policy {
            config.sync_policy = policy;
        }
        if self.cpu_only {
            config.prefer_accelerator = false;
        }
    }

    fn runs(&self, kind: ModelKind) -> bool {
        self.only.is_none_or(|only| only == kind)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    logging::init(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    config
        .ensure_dirs()
        .context("Failed to create pipeline directories")?;

    let layouts: Vec<ModalityLayout> = ModelKind::ALL
        .into_iter()
        .map(|kind| ModalityLayout::from_config(&config, kind))
        .collect();
    let orchestrator = DatasetSyncOrchestrator::new(
        config.resolve(&config.source_root),
        layouts.iter().map(ModalityLayout::sync_target).collect(),
    );
    let registry = layouts
        .iter()
        .fold(DirectoryRunRegistry::new(), |registry, layout| {
            registry.with_root(layout.kind, layout.model_root.clone())
        });
    let runtime = SidecarRuntime::from_command_line(&config.detector_command)?;
    let backend = DetectionBackend::new(runtime).with_accelerator(config.prefer_accelerator);
    let trainer = CommandTrainer::from_command_line(&config.trainer_command)?;

    let mut pipeline = RetrainPipeline::new(backend, trainer, registry, orchestrator)
        .with_sync_policy(config.sync_policy);
    if args.runs(ModelKind::Stain) {
        pipeline = pipeline.with_stain(StainStrategy::from_config(&config));
    }
    if args.runs(ModelKind::Symbol) {
        pipeline = pipeline.with_symbol(SymbolStrategy::from_config(&config));
    }

    info!("Retrain cycle started (root {:?})", config.root);
    let report = if args.skip_sync {
        info!("Dataset sync skipped");
        pipeline.train_and_evaluate()?
    } else {
        let store = SqlRecordStore::new(config.database_url.clone());
        pipeline.run_cycle(&store).await?
    };

    for (kind, outcome) in &report.outcomes {
        match outcome {
            ModalityOutcome::Persisted { run, report } => {
                info!("[{}] version {} -> {:?}", kind, run.version(), report)
            }
            ModalityOutcome::SkippedEmptyPool => info!("[{}] skipped, empty training pool", kind),
            ModalityOutcome::Failed { state, reason } => error!("[{}] failed in {}: {}", kind, state, reason),
        }
    }
    if report.failures() > 0 {
        anyhow::bail!("{} model type(s) failed this cycle", report.failures());
    }
    info!("Retrain cycle finished");
    Ok(())
}
