//! Model loading with accelerator fallback, and the capability contract a
//! detection model has to fulfil.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::DetectionRecord;

/// How a loaded model executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Accelerator, fused operators, half precision
    AcceleratedHalf,
    /// General-purpose processor, full precision
    CpuFull,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The accelerator ran out of memory; recoverable by falling back to the CPU
    #[error("accelerator memory exhausted while loading {path}: {message}")]
    ResourceExhausted { path: PathBuf, message: String },
    #[error("failed to load model {path}: {source}")]
    Other {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Dataset-level validation parameters (the symbol evaluator's two passes)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Dataset description handed to the model (class names, split folders)
    pub data_config: PathBuf,
    pub split: String,
    pub image_size: u32,
    pub confidence: f32,
    /// Test-time augmentation
    pub augment: bool,
    /// Restrict validation to these class indices; `None` means all classes
    pub classes: Option<Vec<usize>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Average precision per class index, only for classes the run reported
    pub class_ap: BTreeMap<usize, f64>,
    pub precision: f64,
    pub recall: f64,
    pub map50: f64,
    pub map50_95: f64,
    /// Mean inference latency per image
    pub inference_ms: f64,
    /// Class names known to the model, in class-index order
    #[serde(default)]
    pub names: Vec<String>,
}

/// A loaded detection model
pub trait DetectionModel {
    /// Run inference on one image. Detections below `confidence_floor` may be
    /// dropped by the model. Zero detections is an empty record, not an error.
    fn infer(&mut self, image: &DynamicImage, confidence_floor: f32) -> anyhow::Result<DetectionRecord>;

    fn validate(&mut self, request: &ValidationRequest) -> anyhow::Result<ValidationOutcome>;
}

/// Loads models in a given execution mode and owns the accelerator
pub trait ModelRuntime {
    type Model: DetectionModel;

    fn accelerator_available(&self) -> bool {
        true
    }

    fn load(&mut self, weights: &Path, mode: ExecutionMode) -> Result<Self::Model, LoadError>;

    /// Return cached accelerator memory after a failed load or an unload
    fn release_accelerator(&mut self);
}

pub struct LoadedModel<M> {
    pub model: M,
    pub mode: ExecutionMode,
    pub weights: PathBuf,
}

impl<M: DetectionModel> LoadedModel<M> {
    pub fn infer(&mut self, image: &DynamicImage, confidence_floor: f32) -> anyhow::Result<DetectionRecord> {
        self.model.infer(image, confidence_floor)
    }

    pub fn validate(&mut self, request: &ValidationRequest) -> anyhow::Result<ValidationOutcome> {
        self.model.validate(request)
    }
}

/// Loads models through a [`ModelRuntime`], preferring the accelerator
pub struct DetectionBackend<R: ModelRuntime> {
    runtime: R,
    prefer_accelerator: bool,
}

impl<R: ModelRuntime> DetectionBackend<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            prefer_accelerator: true,
        }
    }

    pub fn with_accelerator(mut self, prefer: bool) -> Self {
        self.prefer_accelerator = prefer;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Load `weights`, trying fused half precision on the accelerator first.
    /// Only memory exhaustion triggers the CPU fallback; every other failure
    /// is returned to the caller.
    pub fn load(&mut self, weights: &Path) -> Result<LoadedModel<R::Model>, LoadError> {
        if self.prefer_accelerator && self.runtime.accelerator_available() {
            match self.runtime.load(weights, ExecutionMode::AcceleratedHalf) {
                Ok(model) => {
                    info!("Loaded {} on accelerator (half precision)", weights.display());
                    return Ok(LoadedModel {
                        model,
                        mode: ExecutionMode::AcceleratedHalf,
                        weights: weights.to_path_buf(),
                    });
                }
                Err(LoadError::ResourceExhausted { message, .. }) => {
                    warn!("Accelerator out of memory ({}), falling back to CPU", message);
                    self.runtime.release_accelerator();
                }
                Err(err) => return Err(err),
            }
        }

        let model = self.runtime.load(weights, ExecutionMode::CpuFull)?;
        info!("Loaded {} on CPU", weights.display());
        Ok(LoadedModel {
            model,
            mode: ExecutionMode::CpuFull,
            weights: weights.to_path_buf(),
        })
    }

    /// Drop a model and hand its accelerator memory back before the next load
    pub fn unload(&mut self, loaded: LoadedModel<R::Model>) {
        let LoadedModel { model, weights, .. } = loaded;
        drop(model);
        self.runtime.release_accelerator();
        tracing::debug!("Unloaded {}", weights.display());
    }
}
