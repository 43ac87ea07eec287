use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::ModelKind;

/// Fixed hyperparameter set handed to the trainer on every run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainHyperparameters {
    pub epochs: u32,
    pub patience: u32,
    pub batch: u32,
    pub image_size: u32,
    pub device: String,
    pub workers: u32,
    pub optimizer: String,
    pub amp: bool,
    /// Augmentation and schedule knobs passed through untouched
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl TrainHyperparameters {
    /// Replace every field the overrides set; `extra` keys are merged
    pub fn merged(mut self, overrides: TrainOverrides) -> Self {
        if let Some(epochs) = overrides.epochs {
            self.epochs = epochs;
        }
        if let Some(patience) = overrides.patience {
            self.patience = patience;
        }
        if let Some(batch) = overrides.batch {
            self.batch = batch;
        }
        if let Some(image_size) = overrides.image_size {
            self.image_size = image_size;
        }
        if let Some(device) = overrides.device {
            self.device = device;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        if let Some(optimizer) = overrides.optimizer {
            self.optimizer = optimizer;
        }
        if let Some(amp) = overrides.amp {
            self.amp = amp;
        }
        self.extra.extend(overrides.extra);
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("epochs={}", self.epochs),
            format!("patience={}", self.patience),
            format!("batch={}", self.batch),
            format!("imgsz={}", self.image_size),
            format!("device={}", self.device),
            format!("workers={}", self.workers),
            format!("optimizer={}", self.optimizer),
            format!("amp={}", if self.amp { "True" } else { "False" }),
        ];
        args.extend(self.extra.iter().map(|(k, v)| format!("{}={}", k, v)));
        args
    }
}

/// A `train` table as written in the config file, where any key may be left out
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TrainOverrides {
    pub epochs: Option<u32>,
    pub patience: Option<u32>,
    pub batch: Option<u32>,
    pub image_size: Option<u32>,
    pub device: Option<String>,
    pub workers: Option<u32>,
    pub optimizer: Option<String>,
    pub amp: Option<bool>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct TrainRequest<'a> {
    pub kind: ModelKind,
    /// Weights the run starts from
    pub base_weights: &'a Path,
    pub data_config: &'a Path,
    /// Parent of all run directories for this model type
    pub project_dir: &'a Path,
    pub run_name: String,
    pub hyperparameters: &'a TrainHyperparameters,
}

impl TrainRequest<'_> {
    /// Where a finished run leaves its best checkpoint
    pub fn best_weights(&self) -> PathBuf {
        self.project_dir
            .join(&self.run_name)
            .join("weights")
            .join("best.pt")
    }
}

/// External training routine: request in, weights artifact out
pub trait Trainer {
    fn train(&mut self, request: &TrainRequest<'_>) -> Result<PathBuf>;
}

/// Runs a training command line such as `yolo detect train`, appending
/// `key=value` arguments
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
}

impl CommandTrainer {
    pub fn from_command_line(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty trainer command"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn arguments(&self, request: &TrainRequest<'_>) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(format!("model={}", request.base_weights.display()));
        args.push(format!("data={}", request.data_config.display()));
        args.push(format!("project={}", request.project_dir.display()));
        args.push(format!("name={}", request.run_name));
        args.push("save=True".to_string());
        args.extend(request.hyperparameters.to_args());
        args
    }
}

impl Trainer for CommandTrainer {
    fn train(&mut self, request: &TrainRequest<'_>) -> Result<PathBuf> {
        let args = self.arguments(request);
        info!("[{}] Training run {}: {} {}", request.kind, request.run_name, self.program, args.join(" "));

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .with_context(|| format!("Failed to start trainer {:?}", self.program))?;
        if !status.success() {
            anyhow::bail!("Trainer exited with {} for run {}", status, request.run_name);
        }

        let best = request.best_weights();
        if !best.is_file() {
            anyhow::bail!("Trainer finished but produced no weights at {:?}", best);
        }
        Ok(best)
    }
}
