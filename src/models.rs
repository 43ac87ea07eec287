use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The two detector lifecycles driven by the retrain pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Stain,
    Symbol,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Stain, ModelKind::Symbol];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Stain => "stain",
            ModelKind::Symbol => "symbol",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stain" => Ok(ModelKind::Stain),
            "symbol" => Ok(ModelKind::Symbol),
            other => Err(anyhow::anyhow!("Unknown model type: {}", other)),
        }
    }
}

/// A class name with its post-inference decision threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSpec {
    pub name: String,
    pub threshold: f32,
}

/// Canonical class list of a detector.
///
/// The position of a class in the list is its class index, which is how the
/// detector reports predictions, so the order must never change once a model
/// has been trained against it. Lookup by name does not depend on the order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSet {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl ClassSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, index }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}

/// Axis-aligned box in normalized-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_index: usize,
    pub confidence: f32,
    #[serde(default)]
    pub bbox: BoundingBox,
}

/// Output of one inference call over one image, in detector order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionRecord {
    pub detections: Vec<Detection>,
}

impl DetectionRecord {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Highest-confidence detection; the first one wins on equal confidence
    pub fn best(&self) -> Option<&Detection> {
        self.detections.iter().fold(None, |best, d| match best {
            Some(b) if b.confidence >= d.confidence => Some(b),
            _ => Some(d),
        })
    }
}

/// Row of the approved-sample table in the record store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRecord {
    pub stain_url: Option<String>,
    pub label_url: Option<String>,
    pub accepted: bool,
}

impl DatasetRecord {
    pub fn qualifies(&self) -> bool {
        self.accepted && (self.stain_url.is_some() || self.label_url.is_some())
    }

    pub fn url_for(&self, kind: ModelKind) -> Option<&str> {
        match kind {
            ModelKind::Stain => self.stain_url.as_deref(),
            ModelKind::Symbol => self.label_url.as_deref(),
        }
    }
}

/// One training execution of one model type
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRun {
    pub kind: ModelKind,
    pub run_id: u32,
    pub weights_path: PathBuf,
}

impl TrainingRun {
    /// Display version, the run number scaled by 1/10
    pub fn version(&self) -> f64 {
        f64::from(self.run_id) / 10.0
    }

    pub fn run_name(&self) -> String {
        self.run_id.to_string()
    }
}
