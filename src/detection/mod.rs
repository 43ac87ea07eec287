pub mod backend;
pub mod preprocessing;
pub mod sidecar;

pub use backend::{
    DetectionBackend, DetectionModel, ExecutionMode, LoadError, LoadedModel, ModelRuntime,
    ValidationOutcome, ValidationRequest,
};
pub use preprocessing::{ImageNormalizer, Padding, normalize, square_padding};
pub use sidecar::{SidecarModel, SidecarRuntime};
