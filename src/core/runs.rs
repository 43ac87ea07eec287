use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::ModelKind;

/// Allocates training run numbers, one independent counter per model type
pub trait RunRegistry {
    fn next_run(&mut self, kind: ModelKind) -> Result<u32>;

    /// Directory the run with this number writes into
    fn run_dir(&self, kind: ModelKind, run_id: u32) -> Result<PathBuf>;
}

/// Run numbers derived from the numeric directories under each model root.
///
/// Assumes a single writer: nothing reserves the number between allocation
/// and the trainer creating the directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRunRegistry {
    roots: BTreeMap<ModelKind, PathBuf>,
}

impl DirectoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, kind: ModelKind, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(kind, root.into());
        self
    }

    pub fn root(&self, kind: ModelKind) -> Result<&Path> {
        self.roots
            .get(&kind)
            .map(PathBuf::as_path)
            .ok_or_else(|| anyhow::anyhow!("No model root configured for {}", kind))
    }
}

impl RunRegistry for DirectoryRunRegistry {
    fn next_run(&mut self, kind: ModelKind) -> Result<u32> {
        next_run_id(self.root(kind)?)
    }

    fn run_dir(&self, kind: ModelKind, run_id: u32) -> Result<PathBuf> {
        Ok(self.root(kind)?.join(run_id.to_string()))
    }
}

/// Highest numeric sub-directory plus one, or 1 when there is none. Gaps are
/// not reused.
pub fn next_run_id(root: &Path) -> Result<u32> {
    if !root.exists() {
        return Ok(1);
    }
    let mut max = 0u32;
    for entry in std::fs::read_dir(root).with_context(|| format!("Failed to scan runs in {:?}", root))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = name.parse::<u32>() {
                max = max.max(n);
            }
        }
    }
    max.checked_add(1)
        .ok_or_else(|| anyhow::anyhow!("Run counter exhausted in {:?}", root))
}
