pub mod config;
pub mod core;
pub mod detection;
pub mod evaluation;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod report;

pub use config::{ConfigError, PipelineConfig, SyncPolicy};
pub use models::{ClassSet, ClassSpec, Detection, DetectionRecord, ModelKind, TrainingRun};
pub use pipeline::{
    CycleReport, ModalityLayout, ModalityOutcome, ModalityState, ModalityStrategy, RetrainPipeline,
    StainStrategy, SymbolStrategy,
};
pub use report::{Metrics, PerformanceReport};
