mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from washlens for tests
pub use washlens::core::{DatasetSyncOrchestrator, DirectoryRunRegistry, StaticRecords};
pub use washlens::detection::{DetectionBackend, ExecutionMode, LoadError, ValidationOutcome};
pub use washlens::models::{ClassSet, DatasetRecord, Detection, ModelKind};
pub use washlens::{PipelineConfig, RetrainPipeline};
