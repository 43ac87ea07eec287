//! One retraining cycle: shared dataset sync, then per model type
//! `TRAIN | SKIP_EMPTY_POOL → CALIBRATE → EVALUATE → PERSIST → DONE`.
//!
//! What differs between the stain and the symbol detector lives in a
//! [`ModalityStrategy`]; everything else is driven by [`RetrainPipeline`].
//! A failure inside one model type never reaches the other one. Only a model
//! load failure that is not memory exhaustion ends the whole cycle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::{PipelineConfig, SyncPolicy};
use crate::core::{
    DatasetSyncOrchestrator, RecordSource, RunRegistry, SyncSummary, SyncTarget,
    TrainHyperparameters, TrainRequest, Trainer, pool_size,
};
use crate::detection::{DetectionBackend, DetectionModel, ImageNormalizer, LoadedModel, ModelRuntime};
use crate::evaluation::{
    CalibrationResult, StainEvaluator, SymbolEvaluator, ThresholdCalibrator, collect_labeled_images,
};
use crate::models::{ClassSet, ModelKind, TrainingRun};
use crate::report::{Metrics, PerformanceReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalityState {
    Sync,
    Train,
    SkipEmptyPool,
    Calibrate,
    Evaluate,
    Persist,
    Done,
}

impl fmt::Display for ModalityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModalityState::Sync => "SYNC",
            ModalityState::Train => "TRAIN",
            ModalityState::SkipEmptyPool => "SKIP_EMPTY_POOL",
            ModalityState::Calibrate => "CALIBRATE",
            ModalityState::Evaluate => "EVALUATE",
            ModalityState::Persist => "PERSIST",
            ModalityState::Done => "DONE",
        })
    }
}

fn transition(kind: ModelKind, state: ModalityState) {
    info!("[{}] -> {}", kind, state);
}

/// How one model type finished the cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ModalityOutcome {
    Persisted { run: TrainingRun, report: PathBuf },
    SkippedEmptyPool,
    /// Stage that failed and the error chain
    Failed { state: ModalityState, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// `None` when sync was skipped, or failed under [`SyncPolicy::Proceed`]
    pub sync: Option<SyncSummary>,
    pub outcomes: BTreeMap<ModelKind, ModalityOutcome>,
}

impl CycleReport {
    pub fn outcome(&self, kind: ModelKind) -> Option<&ModalityOutcome> {
        self.outcomes.get(&kind)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ModalityOutcome::Failed { .. }))
            .count()
    }
}

/// Resolved file locations of one model type
#[derive(Debug, Clone, PartialEq)]
pub struct ModalityLayout {
    pub kind: ModelKind,
    pub annotation_source: PathBuf,
    pub train_images: PathBuf,
    pub train_labels: PathBuf,
    pub data_config: PathBuf,
    pub model_root: PathBuf,
    pub base_weights: PathBuf,
    pub report_path: PathBuf,
}

impl ModalityLayout {
    pub fn from_config(config: &PipelineConfig, kind: ModelKind) -> Self {
        let paths = config.paths(kind);
        Self {
            kind,
            annotation_source: config.resolve(paths.annotation_source),
            train_images: config.resolve(paths.train_images),
            train_labels: config.resolve(paths.train_labels),
            data_config: config.resolve(paths.data_config),
            model_root: config.resolve(paths.model_root),
            base_weights: config.resolve(paths.base_weights),
            report_path: config.report_path(kind),
        }
    }

    pub fn sync_target(&self) -> SyncTarget {
        SyncTarget {
            kind: self.kind,
            annotation_source: self.annotation_source.clone(),
            pool_images: self.train_images.clone(),
            pool_labels: self.train_labels.clone(),
        }
    }
}

/// The parts of a cycle that differ between model types
pub trait ModalityStrategy {
    /// Handed from CALIBRATE to EVALUATE
    type Calibration;

    /// Whether the CALIBRATE stage does any work
    const CALIBRATES: bool;

    fn layout(&self) -> &ModalityLayout;

    fn hyperparameters(&self) -> &TrainHyperparameters;

    fn kind(&self) -> ModelKind {
        self.layout().kind
    }

    fn calibrate<M: DetectionModel>(&self, model: &mut LoadedModel<M>) -> Result<Self::Calibration>;

    fn evaluate<M: DetectionModel>(
        &self,
        model: &mut LoadedModel<M>,
        calibration: Self::Calibration,
    ) -> Result<Metrics>;
}

/// Single-label stain classifier: per-class thresholds, then top-k accuracy
#[derive(Debug, Clone)]
pub struct StainStrategy {
    pub layout: ModalityLayout,
    pub classes: ClassSet,
    pub hyperparameters: TrainHyperparameters,
    pub normalizer: ImageNormalizer,
    pub test_images: PathBuf,
    pub calibration_images: PathBuf,
    /// `None` disables calibration and uses these thresholds as they are
    pub preset_thresholds: Option<HashMap<String, f32>>,
    pub calibrator: ThresholdCalibrator,
}

impl StainStrategy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let stain = &config.stain;
        let preset_thresholds = (!stain.calibrate).then(|| {
            stain
                .thresholds
                .iter()
                .map(|(name, t)| (name.clone(), *t))
                .collect()
        });
        Self {
            layout: ModalityLayout::from_config(config, ModelKind::Stain),
            classes: stain.class_set(),
            hyperparameters: stain.train.clone(),
            normalizer: ImageNormalizer::new(stain.eval_image_size),
            test_images: config.resolve(&stain.test_images),
            calibration_images: config.stain_calibration_dir(),
            preset_thresholds,
            calibrator: ThresholdCalibrator::with_grid_steps(stain.grid_steps),
        }
    }
}

impl ModalityStrategy for StainStrategy {
    type Calibration = CalibrationResult;
    const CALIBRATES: bool = true;

    fn layout(&self) -> &ModalityLayout {
        &self.layout
    }

    fn hyperparameters(&self) -> &TrainHyperparameters {
        &self.hyperparameters
    }

    fn calibrate<M: DetectionModel>(&self, model: &mut LoadedModel<M>) -> Result<CalibrationResult> {
        if let Some(preset) = &self.preset_thresholds {
            info!("[stain] Calibration disabled, using configured thresholds");
            return CalibrationResult::from_named(
                &self.classes,
                preset.iter().map(|(name, t)| (name.as_str(), *t)),
            );
        }
        let samples = collect_labeled_images(&self.calibration_images, &self.classes)?;
        if samples.is_empty() {
            anyhow::bail!("No labeled calibration images in {:?}", self.calibration_images);
        }
        info!("[stain] Calibrating on {} images", samples.len());
        let observations = self.calibrator.observe(model, &self.normalizer, &samples)?;
        self.calibrator.fit(&self.classes, &observations)
    }

    fn evaluate<M: DetectionModel>(
        &self,
        model: &mut LoadedModel<M>,
        calibration: CalibrationResult,
    ) -> Result<Metrics> {
        let samples = collect_labeled_images(&self.test_images, &self.classes)?;
        info!(
            "[stain] Evaluating {} test images at global threshold {:.3}",
            samples.len(),
            calibration.global_threshold()
        );
        let metrics = StainEvaluator::new(self.normalizer).evaluate(model, &self.classes, &samples, &calibration)?;
        Ok(Metrics::Stain(metrics))
    }
}

/// Multi-label symbol detector: two-pass dataset validation
#[derive(Debug, Clone)]
pub struct SymbolStrategy {
    pub layout: ModalityLayout,
    /// Empty means the model's own class names
    pub classes: ClassSet,
    pub hyperparameters: TrainHyperparameters,
    pub evaluator: SymbolEvaluator,
}

impl SymbolStrategy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let symbol = &config.symbol;
        let layout = ModalityLayout::from_config(config, ModelKind::Symbol);
        let evaluator = SymbolEvaluator {
            data_config: layout.data_config.clone(),
            split: symbol.split.clone(),
            image_size: symbol.eval_image_size,
            confidence: symbol.confidence,
            augment: symbol.augment,
        };
        Self {
            layout,
            classes: symbol.class_set(),
            hyperparameters: symbol.train.clone(),
            evaluator,
        }
    }
}

impl ModalityStrategy for SymbolStrategy {
    type Calibration = ();
    const CALIBRATES: bool = false;

    fn layout(&self) -> &ModalityLayout {
        &self.layout
    }

    fn hyperparameters(&self) -> &TrainHyperparameters {
        &self.hyperparameters
    }

    fn calibrate<M: DetectionModel>(&self, _model: &mut LoadedModel<M>) -> Result<()> {
        Ok(())
    }

    fn evaluate<M: DetectionModel>(&self, model: &mut LoadedModel<M>, _calibration: ()) -> Result<Metrics> {
        let metrics = self.evaluator.evaluate(model, &self.classes)?;
        Ok(Metrics::Symbol(metrics))
    }
}

pub struct RetrainPipeline<R: ModelRuntime, T: Trainer, G: RunRegistry> {
    backend: DetectionBackend<R>,
    trainer: T,
    registry: G,
    orchestrator: DatasetSyncOrchestrator,
    sync_policy: SyncPolicy,
    stain: Option<StainStrategy>,
    symbol: Option<SymbolStrategy>,
}

impl<R: ModelRuntime, T: Trainer, G: RunRegistry> RetrainPipeline<R, T, G> {
    pub fn new(backend: DetectionBackend<R>, trainer: T, registry: G, orchestrator: DatasetSyncOrchestrator) -> Self {
        Self {
            backend,
            trainer,
            registry,
            orchestrator,
            sync_policy: SyncPolicy::Proceed,
            stain: None,
            symbol: None,
        }
    }

    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    pub fn with_stain(mut self, strategy: StainStrategy) -> Self {
        self.stain = Some(strategy);
        self
    }

    pub fn with_symbol(mut self, strategy: SymbolStrategy) -> Self {
        self.symbol = Some(strategy);
        self
    }

    pub fn backend(&self) -> &DetectionBackend<R> {
        &self.backend
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// Sync, then every configured model type in turn
    pub async fn run_cycle<S: RecordSource>(&mut self, source: &S) -> Result<CycleReport> {
        let sync = self.sync(source).await?;
        let mut report = self.train_and_evaluate()?;
        report.sync = sync;
        Ok(report)
    }

    /// The shared SYNC stage with the configured [`SyncPolicy`] applied
    pub async fn sync<S: RecordSource>(&self, source: &S) -> Result<Option<SyncSummary>> {
        info!("-> {}", ModalityState::Sync);
        match self.orchestrator.sync(source).await {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => match self.sync_policy {
                SyncPolicy::Proceed => {
                    error!("Dataset sync failed, training on the existing pools: {:#}", e);
                    Ok(None)
                }
                SyncPolicy::Abort => Err(e).context("Dataset sync failed, cycle aborted"),
            },
        }
    }

    /// Everything after SYNC. Errors only on a fatal model load failure.
    pub fn train_and_evaluate(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let Self {
            backend,
            trainer,
            registry,
            stain,
            symbol,
            ..
        } = self;

        if let Some(strategy) = stain.as_ref() {
            let outcome = run_modality(backend, trainer, registry, strategy)?;
            report.outcomes.insert(ModelKind::Stain, outcome);
        }
        if let Some(strategy) = symbol.as_ref() {
            let outcome = run_modality(backend, trainer, registry, strategy)?;
            report.outcomes.insert(ModelKind::Symbol, outcome);
        }
        Ok(report)
    }
}

fn failed(kind: ModelKind, state: ModalityState, err: anyhow::Error) -> ModalityOutcome {
    error!("[{}] {} failed: {:#}", kind, state, err);
    ModalityOutcome::Failed {
        state,
        reason: format!("{:#}", err),
    }
}

fn run_modality<R, T, G, S>(
    backend: &mut DetectionBackend<R>,
    trainer: &mut T,
    registry: &mut G,
    strategy: &S,
) -> Result<ModalityOutcome>
where
    R: ModelRuntime,
    T: Trainer,
    G: RunRegistry,
    S: ModalityStrategy,
{
    let kind = strategy.kind();
    let layout = strategy.layout();

    match pool_size(&layout.train_images) {
        Ok(0) => {
            transition(kind, ModalityState::SkipEmptyPool);
            error!("[{}] Training pool {:?} is empty, skipping", kind, layout.train_images);
            return Ok(ModalityOutcome::SkippedEmptyPool);
        }
        Ok(n) => info!("[{}] Training pool holds {} images", kind, n),
        Err(e) => return Ok(failed(kind, ModalityState::Train, e)),
    }

    transition(kind, ModalityState::Train);
    let run = match train(trainer, registry, strategy) {
        Ok(run) => run,
        Err(e) => return Ok(failed(kind, ModalityState::Train, e)),
    };

    let mut model = backend
        .load(&run.weights_path)
        .with_context(|| format!("[{}] Failed to load trained weights", kind))?;
    let evaluated = calibrate_and_evaluate(&mut model, strategy);
    backend.unload(model);
    let metrics = match evaluated {
        Ok(metrics) => metrics,
        Err((state, e)) => return Ok(failed(kind, state, e)),
    };

    transition(kind, ModalityState::Persist);
    let report = PerformanceReport::new(&run, metrics);
    if let Err(e) = report.persist(&layout.report_path) {
        return Ok(failed(kind, ModalityState::Persist, e));
    }
    info!(
        "[{}] Report for version {} written to {:?}",
        kind, report.model_version, layout.report_path
    );

    transition(kind, ModalityState::Done);
    Ok(ModalityOutcome::Persisted {
        run,
        report: layout.report_path.clone(),
    })
}

fn train<T: Trainer, G: RunRegistry, S: ModalityStrategy>(
    trainer: &mut T,
    registry: &mut G,
    strategy: &S,
) -> Result<TrainingRun> {
    let kind = strategy.kind();
    let layout = strategy.layout();
    let run_id = registry.next_run(kind)?;
    let request = TrainRequest {
        kind,
        base_weights: &layout.base_weights,
        data_config: &layout.data_config,
        project_dir: &layout.model_root,
        run_name: run_id.to_string(),
        hyperparameters: strategy.hyperparameters(),
    };
    let weights_path = trainer.train(&request)?;
    if let Ok(dir) = registry.run_dir(kind, run_id) {
        if !weights_path.starts_with(&dir) {
            warn!("[{}] Trainer wrote weights outside the run directory {:?}", kind, dir);
        }
    }
    info!("[{}] Run {} produced {:?}", kind, run_id, weights_path);
    Ok(TrainingRun {
        kind,
        run_id,
        weights_path,
    })
}

fn calibrate_and_evaluate<M: DetectionModel, S: ModalityStrategy>(
    model: &mut LoadedModel<M>,
    strategy: &S,
) -> Result<Metrics, (ModalityState, anyhow::Error)> {
    let kind = strategy.kind();
    if S::CALIBRATES {
        transition(kind, ModalityState::Calibrate);
    }
    let calibration = strategy
        .calibrate(model)
        .map_err(|e| (ModalityState::Calibrate, e))?;
    transition(kind, ModalityState::Evaluate);
    strategy
        .evaluate(model, calibration)
        .map_err(|e| (ModalityState::Evaluate, e))
}
