//! Miss-aware top-1 / top-3 accuracy for the stain detector.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detection::{DetectionModel, ImageNormalizer, LoadedModel};
use crate::evaluation::calibration::CalibrationResult;
use crate::evaluation::samples::LabeledImage;
use crate::models::{ClassSet, DetectionRecord};

const TOP_K: usize = 3;

/// Result of scoring one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Nothing survived the confidence floor or the per-class filter
    Miss,
    Ranked { top1: bool, top3: bool },
}

/// Filter a record by each detection's own class threshold and rank what is
/// left. Boxes are ranked raw, so one class can take several of the top slots.
pub fn score_record(truth: usize, record: &DetectionRecord, calibration: &CalibrationResult) -> ImageOutcome {
    let mut kept: Vec<_> = record
        .detections
        .iter()
        .filter(|d| {
            calibration
                .threshold_at(d.class_index)
                .is_some_and(|t| d.confidence >= t)
        })
        .collect();
    if kept.is_empty() {
        return ImageOutcome::Miss;
    }

    // stable: equal confidences keep detector order
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let top: Vec<usize> = kept.iter().take(TOP_K).map(|d| d.class_index).collect();
    ImageOutcome::Ranked {
        top1: top[0] == truth,
        top3: top.contains(&truth),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ClassTally {
    samples: u32,
    miss: u32,
    top1: u32,
    top3: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub samples: u32,
    pub miss: u32,
    pub top1_acc: f64,
    pub top3_acc: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceTime {
    pub total_s: f64,
    pub avg_per_image_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverallAccuracy {
    pub samples: u32,
    pub miss: u32,
    pub top1_acc: f64,
    pub top3_acc: f64,
    pub precision: f64,
    pub recall: f64,
    pub inference_time: InferenceTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StainMetrics {
    pub per_class: BTreeMap<String, ClassAccuracy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<OverallAccuracy>,
}

/// Running tallies over an evaluation set
#[derive(Debug, Clone)]
pub struct EvaluationAggregator {
    tallies: Vec<ClassTally>,
    inference: Duration,
    images: u32,
}

impl EvaluationAggregator {
    pub fn new(classes: &ClassSet) -> Self {
        Self {
            tallies: vec![ClassTally::default(); classes.len()],
            inference: Duration::ZERO,
            images: 0,
        }
    }

    pub fn record(&mut self, truth: usize, outcome: ImageOutcome, elapsed: Duration) {
        let Some(tally) = self.tallies.get_mut(truth) else {
            return;
        };
        tally.samples += 1;
        match outcome {
            ImageOutcome::Miss => tally.miss += 1,
            ImageOutcome::Ranked { top1, top3 } => {
                tally.top1 += u32::from(top1);
                tally.top3 += u32::from(top3);
            }
        }
        self.inference += elapsed;
        self.images += 1;
    }

    /// Accuracies are normalized by non-miss samples. Classes with no
    /// non-miss sample are left out, as is `overall` when nothing was ranked.
    pub fn finish(&self, classes: &ClassSet) -> StainMetrics {
        let mut per_class = BTreeMap::new();
        let mut total = ClassTally::default();

        for (idx, tally) in self.tallies.iter().enumerate() {
            let non_miss = tally.samples - tally.miss;
            if non_miss == 0 {
                continue;
            }
            let Some(name) = classes.name(idx) else {
                continue;
            };
            per_class.insert(
                name.to_string(),
                ClassAccuracy {
                    samples: tally.samples,
                    miss: tally.miss,
                    top1_acc: round4(ratio(tally.top1, non_miss)),
                    top3_acc: round4(ratio(tally.top3, non_miss)),
                },
            );
            total.samples += tally.samples;
            total.miss += tally.miss;
            total.top1 += tally.top1;
            total.top3 += tally.top3;
        }

        let total_non_miss = total.samples - total.miss;
        let overall = (total_non_miss > 0).then(|| {
            let top1_acc = round4(ratio(total.top1, total_non_miss));
            let total_s = self.inference.as_secs_f64();
            OverallAccuracy {
                samples: total.samples,
                miss: total.miss,
                top1_acc,
                top3_acc: round4(ratio(total.top3, total_non_miss)),
                // single label per image: precision and recall both reduce to top-1
                precision: top1_acc,
                recall: top1_acc,
                inference_time: InferenceTime {
                    total_s: round4(total_s),
                    avg_per_image_s: round4(total_s / f64::from(self.images.max(1))),
                },
            }
        });

        StainMetrics { per_class, overall }
    }
}

fn ratio(num: u32, den: u32) -> f64 {
    f64::from(num) / f64::from(den)
}

pub(crate) fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Normalize, infer at the global floor, then score each image
pub struct StainEvaluator {
    pub normalizer: ImageNormalizer,
}

impl StainEvaluator {
    pub fn new(normalizer: ImageNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn evaluate<M: DetectionModel>(
        &self,
        model: &mut LoadedModel<M>,
        classes: &ClassSet,
        samples: &[LabeledImage],
        calibration: &CalibrationResult,
    ) -> Result<StainMetrics> {
        let mut aggregator = EvaluationAggregator::new(classes);
        let floor = calibration.global_threshold();

        for sample in samples {
            let img = match image::open(&sample.path) {
                Ok(img) => img,
                Err(e) => {
                    warn!("Skipping unreadable test image {:?}: {}", sample.path, e);
                    continue;
                }
            };
            let img = self.normalizer.normalize(&img);

            let started = Instant::now();
            let record = model
                .infer(&img, floor)
                .with_context(|| format!("Inference failed on {:?}", sample.path))?;
            let elapsed = started.elapsed();

            let outcome = score_record(sample.class_index, &record, calibration);
            aggregator.record(sample.class_index, outcome, elapsed);
        }

        let metrics = aggregator.finish(classes);
        match &metrics.overall {
            Some(overall) => info!(
                "Stain overall (miss excluded): top1={:.4} top3={:.4} samples={} miss={}",
                overall.top1_acc, overall.top3_acc, overall.samples, overall.miss
            ),
            None => warn!("Stain evaluation produced no ranked predictions"),
        }
        Ok(metrics)
    }
}
