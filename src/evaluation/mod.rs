pub mod calibration;
pub mod samples;
pub mod stain;
pub mod symbol;

pub use calibration::{CalibrationObservation, CalibrationResult, ThresholdCalibrator};
pub use samples::{LabeledImage, collect_labeled_images, ground_truth_from_file_name};
pub use stain::{
    ClassAccuracy, EvaluationAggregator, ImageOutcome, InferenceTime, OverallAccuracy,
    StainEvaluator, StainMetrics, score_record,
};
pub use symbol::{SymbolEvaluator, SymbolMetrics, present_classes};
