//! Detection runtime backed by a helper process.
//!
//! The helper speaks newline-delimited JSON on stdin/stdout. Every request
//! carries an `id` and an `op` (`load`, `infer`, `validate`, `release`); every
//! response echoes the `id` and carries either `result` or
//! `error: {kind, message}`. An error of kind `out_of_memory` on `load` is
//! reported as [`LoadError::ResourceExhausted`].
//!
//! One helper process is spawned per loaded model, so dropping the model
//! returns all of its accelerator memory.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use crate::detection::backend::{
    DetectionModel, ExecutionMode, LoadError, ModelRuntime, ValidationOutcome, ValidationRequest,
};
use crate::models::{Detection, DetectionRecord};

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Load { weights: &'a Path, mode: ExecutionMode },
    Infer { image: &'a Path, conf: f32 },
    Validate(&'a ValidationRequest),
    Release,
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: Uuid,
    #[serde(flatten)]
    request: Request<'a>,
}

#[derive(Deserialize)]
struct Response {
    id: Uuid,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    kind: ErrorKind,
    message: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
enum ErrorKind {
    OutOfMemory,
    #[serde(other)]
    Other,
}

/// Spawns `program args...` for every model load
#[derive(Debug, Clone)]
pub struct SidecarRuntime {
    program: String,
    args: Vec<String>,
}

impl SidecarRuntime {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a full command line such as `python3 detector_sidecar.py`
    pub fn from_command_line(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty detector command"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    fn spawn(&self) -> Result<SidecarModel> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start detector helper {:?}", self.program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Detector helper has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Detector helper has no stdout"))?;
        let scratch = TempDir::new().context("Failed to create scratch directory")?;

        Ok(SidecarModel {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            scratch,
        })
    }
}

impl ModelRuntime for SidecarRuntime {
    type Model = SidecarModel;

    fn load(&mut self, weights: &Path, mode: ExecutionMode) -> Result<SidecarModel, LoadError> {
        let other = |source: anyhow::Error| LoadError::Other {
            path: weights.to_path_buf(),
            source,
        };

        let mut model = self.spawn().map_err(other)?;
        match model.call(Request::Load { weights, mode }).map_err(other)? {
            Ok(_) => Ok(model),
            Err(err) if err.kind == ErrorKind::OutOfMemory => Err(LoadError::ResourceExhausted {
                path: weights.to_path_buf(),
                message: err.message,
            }),
            Err(err) => Err(other(anyhow::anyhow!(err.message))),
        }
    }

    fn release_accelerator(&mut self) {
        // Memory is owned by the helper process and freed when it exits.
        debug!("Detector helper memory is released on process exit");
    }
}

pub struct SidecarModel {
    child: Child,
    /// `None` once the model is being torn down
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    scratch: TempDir,
}

impl SidecarModel {
    /// Send one request and wait for its response. The outer error is a
    /// transport failure, the inner one an error reported by the helper.
    fn call(&mut self, request: Request<'_>) -> Result<std::result::Result<serde_json::Value, ResponseError>> {
        let id = Uuid::new_v4();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Detector helper input is closed"))?;
        send(stdin, id, request).context("Failed to write to detector helper")?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let read = self
                .stdout
                .read_line(&mut buf)
                .context("Failed to read from detector helper")?;
            if read == 0 {
                anyhow::bail!("Detector helper closed its output");
            }
            if buf.trim().is_empty() {
                continue;
            }
            let response: Response = serde_json::from_str(buf.trim())
                .with_context(|| format!("Malformed detector helper response: {}", buf.trim()))?;
            if response.id != id {
                debug!("Ignoring stale detector response {}", response.id);
                continue;
            }
            return Ok(match response.error {
                Some(err) => Err(err),
                None => Ok(response.result),
            });
        }
    }

    fn call_ok(&mut self, request: Request<'_>) -> Result<serde_json::Value> {
        self.call(request)?
            .map_err(|err| anyhow::anyhow!("Detector helper error: {}", err.message))
    }

    fn stage_image(&self, image: &DynamicImage) -> Result<tempfile::TempPath> {
        let file = tempfile::Builder::new()
            .suffix(".png")
            .tempfile_in(self.scratch.path())?;
        let path = file.into_temp_path();
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| anyhow::anyhow!("Failed to stage image for inference: {}", e))?;
        Ok(path)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch.path().to_path_buf()
    }
}

impl DetectionModel for SidecarModel {
    fn infer(&mut self, image: &DynamicImage, confidence_floor: f32) -> Result<DetectionRecord> {
        let staged = self.stage_image(image)?;
        let value = self.call_ok(Request::Infer {
            image: &staged,
            conf: confidence_floor,
        })?;
        if value.is_null() {
            return Ok(DetectionRecord::default());
        }
        let detections: Vec<Detection> =
            serde_json::from_value(value).context("Malformed detections from detector helper")?;
        Ok(DetectionRecord::new(detections))
    }

    fn validate(&mut self, request: &ValidationRequest) -> Result<ValidationOutcome> {
        let value = self.call_ok(Request::Validate(request))?;
        serde_json::from_value(value).context("Malformed validation result from detector helper")
    }
}

fn send(stdin: &mut BufWriter<ChildStdin>, id: Uuid, request: Request<'_>) -> Result<()> {
    let line = serde_json::to_string(&Envelope { id, request })?;
    writeln!(stdin, "{}", line)?;
    stdin.flush()?;
    Ok(())
}

impl Drop for SidecarModel {
    /// Announce the release, then close the helper's input and kill it
    /// without waiting for a reply
    fn drop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = send(&mut stdin, Uuid::new_v4(), Request::Release) {
                debug!("Could not announce release to detector helper: {:#}", e);
            }
        }
        if let Err(e) = self.child.kill() {
            debug!("Detector helper already exited: {}", e);
        }
        if let Err(e) = self.child.wait() {
            debug!("Failed to reap detector helper: {}", e);
        }
    }
}
