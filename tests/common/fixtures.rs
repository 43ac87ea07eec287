use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use image::{DynamicImage, ImageBuffer, Rgb};
use washlens::core::{
    DatasetSyncOrchestrator, DirectoryRunRegistry, TrainRequest, Trainer,
};
use washlens::detection::{
    DetectionBackend, DetectionModel, ExecutionMode, LoadError, ModelRuntime, ValidationOutcome,
    ValidationRequest,
};
use washlens::models::{DatasetRecord, Detection, DetectionRecord, ModelKind};
use washlens::{ModalityLayout, PipelineConfig, RetrainPipeline, StainStrategy, SymbolStrategy};

/// Stain classes used across the tests
pub const STAIN_CLASSES: [&str; 3] = ["blood", "coffee", "ink"];
pub const SYMBOL_CLASSES: [&str; 4] = ["wash_30", "no_bleach", "tumble_dry", "iron_low"];

/// Solid colour encoding a class index in the red channel
pub fn class_color(class_index: usize) -> Rgb<u8> {
    Rgb([20 + 25 * class_index as u8, 128, 128])
}

/// Inverse of [`class_color`], read at the image centre
pub fn class_from_pixel(img: &DynamicImage) -> usize {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let r = rgb.get_pixel(w / 2, h / 2)[0] as f32;
    ((r - 20.0) / 25.0).round().max(0.0) as usize
}

pub fn write_image(path: &Path, width: u32, height: u32, color: Rgb<u8>) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create image directory");
    }
    let img = ImageBuffer::from_pixel(width, height, color);
    img.save(path).expect("Failed to save test image");
}

/// `per_class` non-square images per class, named `<class>_<n>.png`
pub fn write_labeled_set(dir: &Path, classes: &[&str], per_class: usize) {
    for (idx, name) in classes.iter().enumerate() {
        for n in 0..per_class {
            let path = dir.join(format!("{}_{:03}.png", name, n));
            write_image(&path, 40, 60, class_color(idx));
        }
    }
}

pub fn det(class_index: usize, confidence: f32) -> Detection {
    Detection {
        class_index,
        confidence,
        bbox: Default::default(),
    }
}

/// What a fake model answers to `infer`
#[derive(Debug, Clone)]
pub enum Behavior {
    /// 0.9 for the class encoded in the image, 0.05 for every other class
    Perfect { classes: usize },
    /// Never detects anything
    Silent,
    /// Same record for every image
    Fixed(Vec<Detection>),
}

#[derive(Debug, Default)]
pub struct RuntimeLog {
    pub loads: Vec<(PathBuf, ExecutionMode)>,
    pub load_attempts: usize,
    pub releases: usize,
    pub inferences: usize,
    pub validations: Vec<ValidationRequest>,
}

pub struct FakeModel {
    behavior: Behavior,
    validations: VecDeque<ValidationOutcome>,
    log: Rc<RefCell<RuntimeLog>>,
}

impl DetectionModel for FakeModel {
    fn infer(&mut self, image: &DynamicImage, confidence_floor: f32) -> anyhow::Result<DetectionRecord> {
        self.log.borrow_mut().inferences += 1;
        let detections = match &self.behavior {
            Behavior::Perfect { classes } => {
                let truth = class_from_pixel(image);
                (0..*classes)
                    .map(|c| det(c, if c == truth { 0.9 } else { 0.05 }))
                    .collect()
            }
            Behavior::Silent => Vec::new(),
            Behavior::Fixed(detections) => detections.clone(),
        };
        Ok(DetectionRecord::new(
            detections
                .into_iter()
                .filter(|d| d.confidence >= confidence_floor)
                .collect(),
        ))
    }

    fn validate(&mut self, request: &ValidationRequest) -> anyhow::Result<ValidationOutcome> {
        self.log.borrow_mut().validations.push(request.clone());
        self.validations
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("No scripted validation outcome left"))
    }
}

pub struct FakeRuntime {
    pub behavior: Behavior,
    pub validations: Vec<ValidationOutcome>,
    pub accelerator: bool,
    /// Accelerated loads fail with memory exhaustion
    pub oom_on_accelerator: bool,
    /// Every load fails with a non-memory error
    pub corrupt_weights: bool,
    pub log: Rc<RefCell<RuntimeLog>>,
}

impl FakeRuntime {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            validations: Vec::new(),
            accelerator: true,
            oom_on_accelerator: false,
            corrupt_weights: false,
            log: Rc::new(RefCell::new(RuntimeLog::default())),
        }
    }

    pub fn with_validations(mut self, outcomes: Vec<ValidationOutcome>) -> Self {
        self.validations = outcomes;
        self
    }
}

impl ModelRuntime for FakeRuntime {
    type Model = FakeModel;

    fn accelerator_available(&self) -> bool {
        self.accelerator
    }

    fn load(&mut self, weights: &Path, mode: ExecutionMode) -> Result<FakeModel, LoadError> {
        self.log.borrow_mut().load_attempts += 1;
        if self.corrupt_weights {
            return Err(LoadError::Other {
                path: weights.to_path_buf(),
                source: anyhow::anyhow!("unexpected end of file"),
            });
        }
        if self.oom_on_accelerator && mode == ExecutionMode::AcceleratedHalf {
            return Err(LoadError::ResourceExhausted {
                path: weights.to_path_buf(),
                message: "CUDA out of memory".to_string(),
            });
        }
        self.log.borrow_mut().loads.push((weights.to_path_buf(), mode));
        Ok(FakeModel {
            behavior: self.behavior.clone(),
            validations: self.validations.iter().cloned().collect(),
            log: Rc::clone(&self.log),
        })
    }

    fn release_accelerator(&mut self) {
        self.log.borrow_mut().releases += 1;
    }
}

/// Writes an empty `best.pt` where a real trainer would
#[derive(Debug, Default)]
pub struct FakeTrainer {
    pub fail_for: Option<ModelKind>,
    /// (model type, run name) of every call
    pub runs: Vec<(ModelKind, String)>,
}

impl Trainer for FakeTrainer {
    fn train(&mut self, request: &TrainRequest<'_>) -> anyhow::Result<PathBuf> {
        self.runs.push((request.kind, request.run_name.clone()));
        if self.fail_for == Some(request.kind) {
            anyhow::bail!("trainer crashed");
        }
        let best = request.best_weights();
        if let Some(parent) = best.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&best, b"weights")?;
        Ok(best)
    }
}

/// Config rooted in `root`, with every directory created
pub fn test_config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.root = root.to_path_buf();
    config.source_root = PathBuf::from("source");
    config.report_root = PathBuf::from("reports");
    config.stain.annotation_source = PathBuf::from("source/labels/stain");
    config.symbol.annotation_source = PathBuf::from("source/labels/symbol");
    config.stain.classes = STAIN_CLASSES.iter().map(|s| s.to_string()).collect();
    config.stain.thresholds = STAIN_CLASSES.iter().map(|s| (s.to_string(), 0.3)).collect();
    config.symbol.classes = SYMBOL_CLASSES.iter().map(|s| s.to_string()).collect();
    config.ensure_dirs().expect("Failed to create pipeline directories");
    config
}

/// Put an image and its annotation where the sync step looks for them and
/// return the record URL of the image
pub fn write_source_pair(config: &PipelineConfig, kind: ModelKind, stem: &str) -> String {
    let source = config.resolve(&config.source_root);
    write_image(&source.join("uploads").join(format!("{}.png", stem)), 16, 16, class_color(0));
    let labels = config.resolve(config.paths(kind).annotation_source);
    std::fs::create_dir_all(&labels).expect("Failed to create label directory");
    std::fs::write(labels.join(format!("{}.txt", stem)), "0 0.5 0.5 0.2 0.2\n")
        .expect("Failed to write annotation");
    format!("/uploads/{}.png", stem)
}

pub fn accepted(stain_url: Option<String>, label_url: Option<String>) -> DatasetRecord {
    DatasetRecord {
        stain_url,
        label_url,
        accepted: true,
    }
}

pub fn orchestrator(config: &PipelineConfig) -> DatasetSyncOrchestrator {
    let targets = ModelKind::ALL
        .into_iter()
        .map(|kind| ModalityLayout::from_config(config, kind).sync_target())
        .collect();
    DatasetSyncOrchestrator::new(config.resolve(&config.source_root), targets)
}

pub fn registry(config: &PipelineConfig) -> DirectoryRunRegistry {
    ModelKind::ALL
        .into_iter()
        .fold(DirectoryRunRegistry::new(), |registry, kind| {
            registry.with_root(kind, config.resolve(config.paths(kind).model_root))
        })
}

/// Pipeline wired the way the binary wires it, with fakes at the edges
pub fn build_pipeline(
    config: &PipelineConfig,
    runtime: FakeRuntime,
    trainer: FakeTrainer,
) -> RetrainPipeline<FakeRuntime, FakeTrainer, DirectoryRunRegistry> {
    RetrainPipeline::new(
        DetectionBackend::new(runtime),
        trainer,
        registry(config),
        orchestrator(config),
    )
    .with_sync_policy(config.sync_policy)
    .with_stain(StainStrategy::from_config(config))
    .with_symbol(SymbolStrategy::from_config(config))
}

pub fn symbol_outcome(class_ap: &[(usize, f64)], map50: f64) -> ValidationOutcome {
    ValidationOutcome {
        class_ap: class_ap.iter().copied().collect(),
        precision: 0.8,
        recall: 0.7,
        map50,
        map50_95: map50 / 2.0,
        inference_ms: 12.5,
        names: SYMBOL_CLASSES.iter().map(|s| s.to_string()).collect(),
    }
}
