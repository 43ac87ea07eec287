//! Two-pass validation for the multi-label symbol detector.
//!
//! Classes absent from the test split get an AP of zero and would drag the
//! mean down, so a first plain pass finds the classes that are present and a
//! second pass, with test-time augmentation, is restricted to them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::detection::{DetectionModel, LoadedModel, ValidationOutcome, ValidationRequest};
use crate::models::ClassSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMetrics {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "mAP50")]
    pub map50: f64,
    #[serde(rename = "mAP50-95")]
    pub map50_95: f64,
    pub inference_time_ms: f64,
    pub per_class: BTreeMap<String, f64>,
}

/// Class indices with a strictly positive AP
pub fn present_classes(outcome: &ValidationOutcome) -> Vec<usize> {
    outcome
        .class_ap
        .iter()
        .filter(|(_, ap)| **ap > 0.0)
        .map(|(idx, _)| *idx)
        .collect()
}

/// Map a validation outcome onto class names; classes it did not report get 0.0
pub fn metrics_from_outcome(outcome: &ValidationOutcome, classes: &ClassSet) -> SymbolMetrics {
    let per_class = classes
        .iter()
        .map(|(idx, name)| {
            (
                name.to_string(),
                outcome.class_ap.get(&idx).copied().unwrap_or(0.0),
            )
        })
        .collect();
    SymbolMetrics {
        precision: outcome.precision,
        recall: outcome.recall,
        map50: outcome.map50,
        map50_95: outcome.map50_95,
        inference_time_ms: outcome.inference_ms,
        per_class,
    }
}

#[derive(Debug, Clone)]
pub struct SymbolEvaluator {
    pub data_config: PathBuf,
    pub split: String,
    pub image_size: u32,
    pub confidence: f32,
    /// Test-time augmentation for the second pass
    pub augment: bool,
}

impl SymbolEvaluator {
    fn request(&self, augment: bool, classes: Option<Vec<usize>>) -> ValidationRequest {
        ValidationRequest {
            data_config: self.data_config.clone(),
            split: self.split.clone(),
            image_size: self.image_size,
            confidence: self.confidence,
            augment,
            classes,
        }
    }

    /// Run both passes. An empty `classes` falls back to the class names the
    /// model reports.
    pub fn evaluate<M: DetectionModel>(
        &self,
        model: &mut LoadedModel<M>,
        classes: &ClassSet,
    ) -> Result<SymbolMetrics> {
        let first = model
            .validate(&self.request(false, None))
            .context("First symbol validation pass failed")?;
        let reported;
        let classes = if classes.is_empty() {
            reported = ClassSet::new(first.names.iter().cloned());
            &reported
        } else {
            classes
        };
        let valid = present_classes(&first);

        if valid.is_empty() {
            warn!("No symbol class reached a positive AP; skipping the restricted pass");
            let mut metrics = metrics_from_outcome(&first, classes);
            metrics.per_class.values_mut().for_each(|ap| *ap = 0.0);
            return Ok(metrics);
        }
        info!("{} of {} symbol classes present in the test split", valid.len(), classes.len());

        let last = model
            .validate(&self.request(self.augment, Some(valid)))
            .context("Restricted symbol validation pass failed")?;
        let metrics = metrics_from_outcome(&last, classes);
        info!(
            "Symbol metrics: P={:.4} R={:.4} mAP50={:.4} mAP50-95={:.4}",
            metrics.precision, metrics.recall, metrics.map50, metrics.map50_95
        );
        Ok(metrics)
    }
}
