use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::evaluation::{StainMetrics, SymbolMetrics};
use crate::models::{ModelKind, TrainingRun};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Metrics {
    Stain(StainMetrics),
    Symbol(SymbolMetrics),
}

/// Performance file read by the front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub model_version: f64,
    pub model_type: ModelKind,
    pub weights_path: String,
    pub metrics: Metrics,
}

impl PerformanceReport {
    pub fn new(run: &TrainingRun, metrics: Metrics) -> Self {
        Self {
            model_version: run.version(),
            model_type: run.kind,
            weights_path: run.weights_path.display().to_string(),
            metrics,
        }
    }

    /// Overwrite `path` with the pretty-printed report
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write report {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("Failed to read report {:?}", path))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
