//! Per-class confidence threshold search.
//!
//! Every calibration image contributes exactly one observation: its ground
//! truth and the single highest-confidence detection, if any. For each class
//! the threshold maximizing F1 over a fixed grid on `[0, 1]` is chosen; on
//! equal F1 the smallest threshold wins.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::detection::{DetectionModel, ImageNormalizer, LoadedModel};
use crate::evaluation::samples::LabeledImage;
use crate::models::{ClassSet, ClassSpec, DetectionRecord};

/// Reference grid resolution: 101 points, 0.00 to 1.00
pub const DEFAULT_GRID_STEPS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationObservation {
    pub truth: usize,
    pub predicted: Option<usize>,
    pub confidence: f32,
}

impl CalibrationObservation {
    /// Collapse a raw record to its best box
    pub fn from_record(truth: usize, record: &DetectionRecord) -> Self {
        match record.best() {
            Some(best) => Self {
                truth,
                predicted: Some(best.class_index),
                confidence: best.confidence,
            },
            None => Self {
                truth,
                predicted: None,
                confidence: 0.0,
            },
        }
    }
}

/// Per-class thresholds in class-index order plus the global floor.
///
/// Immutable once built; `global_threshold` is never above any class threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    classes: Vec<ClassSpec>,
    global_threshold: f32,
}

impl CalibrationResult {
    /// Build from thresholds listed in class-index order
    pub fn new(classes: Vec<ClassSpec>) -> Result<Self> {
        if classes.is_empty() {
            anyhow::bail!("Calibration needs at least one class");
        }
        for spec in &classes {
            if !(0.0..=1.0).contains(&spec.threshold) {
                anyhow::bail!(
                    "Threshold for class {} out of range: {}",
                    spec.name,
                    spec.threshold
                );
            }
        }
        let global_threshold = classes
            .iter()
            .map(|c| c.threshold)
            .fold(f32::INFINITY, f32::min);
        Ok(Self {
            classes,
            global_threshold,
        })
    }

    /// Align a name-keyed threshold table with the canonical class order
    pub fn from_named<'a, I>(class_set: &ClassSet, thresholds: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        let named: std::collections::HashMap<&str, f32> = thresholds.into_iter().collect();
        let specs = class_set
            .iter()
            .map(|(_, name)| {
                named
                    .get(name)
                    .map(|&threshold| ClassSpec {
                        name: name.to_string(),
                        threshold,
                    })
                    .with_context(|| format!("No threshold configured for class {}", name))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(specs)
    }

    pub fn global_threshold(&self) -> f32 {
        self.global_threshold
    }

    pub fn thresholds(&self) -> &[ClassSpec] {
        &self.classes
    }

    pub fn threshold_at(&self, class_index: usize) -> Option<f32> {
        self.classes.get(class_index).map(|c| c.threshold)
    }

    pub fn threshold(&self, name: &str) -> Option<f32> {
        self.classes.iter().find(|c| c.name == name).map(|c| c.threshold)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThresholdCalibrator {
    grid_steps: u32,
}

impl Default for ThresholdCalibrator {
    fn default() -> Self {
        Self {
            grid_steps: DEFAULT_GRID_STEPS,
        }
    }
}

impl ThresholdCalibrator {
    pub fn with_grid_steps(grid_steps: u32) -> Self {
        Self {
            grid_steps: grid_steps.max(1),
        }
    }

    /// Run the model over every calibration image with no confidence floor
    pub fn observe<M: DetectionModel>(
        &self,
        model: &mut LoadedModel<M>,
        normalizer: &ImageNormalizer,
        samples: &[LabeledImage],
    ) -> Result<Vec<CalibrationObservation>> {
        let mut observations = Vec::with_capacity(samples.len());
        for sample in samples {
            let img = match image::open(&sample.path) {
                Ok(img) => img,
                Err(e) => {
                    warn!("Skipping unreadable calibration image {:?}: {}", sample.path, e);
                    continue;
                }
            };
            let img = normalizer.normalize(&img);
            let record = model
                .infer(&img, 0.0)
                .with_context(|| format!("Inference failed on {:?}", sample.path))?;
            observations.push(CalibrationObservation::from_record(sample.class_index, &record));
        }
        Ok(observations)
    }

    /// Pick the F1-optimal threshold for every class
    pub fn fit(&self, classes: &ClassSet, observations: &[CalibrationObservation]) -> Result<CalibrationResult> {
        let mut specs = Vec::with_capacity(classes.len());
        for (class_index, name) in classes.iter() {
            let (threshold, f1) = self.best_threshold(class_index, observations);
            debug!("Class {}: best_t={:.3}, F1={:.4}", name, threshold, f1);
            specs.push(ClassSpec {
                name: name.to_string(),
                threshold,
            });
        }
        let result = CalibrationResult::new(specs)?;
        info!(
            "Calibrated {} class thresholds, global threshold {:.3}",
            classes.len(),
            result.global_threshold()
        );
        Ok(result)
    }

    /// Ascending grid scan; only a strictly better F1 replaces the current best
    pub fn best_threshold(&self, class_index: usize, observations: &[CalibrationObservation]) -> (f32, f64) {
        let support = observations.iter().filter(|o| o.truth == class_index).count();
        let mut best = (0.0f32, -1.0f64);

        for step in 0..=self.grid_steps {
            let t = round3(step as f64 / self.grid_steps as f64) as f32;
            let mut tp = 0usize;
            let mut predicted_as_c = 0usize;
            for o in observations {
                if o.predicted == Some(class_index) && o.confidence >= t {
                    predicted_as_c += 1;
                    if o.truth == class_index {
                        tp += 1;
                    }
                }
            }
            let f1 = f1_score(tp, predicted_as_c - tp, support - tp);
            if f1 > best.1 {
                best = (t, f1);
            }
        }
        best
    }
}

fn f1_score(tp: usize, fp: usize, fn_: usize) -> f64 {
    let tp = tp as f64;
    let precision = if tp + fp as f64 > 0.0 { tp / (tp + fp as f64) } else { 0.0 };
    let recall = if tp + fn_ as f64 > 0.0 { tp / (tp + fn_ as f64) } else { 0.0 };
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}
