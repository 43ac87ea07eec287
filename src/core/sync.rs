//! Stage approved samples into the per-modality training pools.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::db::{RecordSource, SyncError};
use crate::models::{DatasetRecord, ModelKind};

/// Where one modality's pairs come from and where they are copied to
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub kind: ModelKind,
    /// Directory holding the annotation files, matched to images by stem
    pub annotation_source: PathBuf,
    pub pool_images: PathBuf,
    pub pool_labels: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    Copied,
    NoUrl,
    MissingImage(PathBuf),
    MissingAnnotation(PathBuf),
    MissingBoth { image: PathBuf, annotation: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub records: usize,
    pub copied: BTreeMap<ModelKind, usize>,
    pub skipped: BTreeMap<ModelKind, usize>,
    pub failed: usize,
}

impl SyncSummary {
    pub fn copied_for(&self, kind: ModelKind) -> usize {
        self.copied.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct DatasetSyncOrchestrator {
    source_root: PathBuf,
    annotation_extension: String,
    targets: Vec<SyncTarget>,
}

impl DatasetSyncOrchestrator {
    pub fn new(source_root: impl Into<PathBuf>, targets: Vec<SyncTarget>) -> Self {
        Self {
            source_root: source_root.into(),
            annotation_extension: "txt".to_string(),
            targets,
        }
    }

    pub fn with_annotation_extension(mut self, ext: impl Into<String>) -> Self {
        self.annotation_extension = ext.into();
        self
    }

    /// An absolute URL naming an existing file is used as is; anything else
    /// is a path relative to the source root
    pub fn resolve_image(&self, url: &str) -> PathBuf {
        let direct = Path::new(url);
        if direct.is_absolute() && direct.is_file() {
            return direct.to_path_buf();
        }
        self.source_root.join(url.trim_start_matches('/'))
    }

    /// Same stem as the image, annotation extension, in `annotation_dir`
    pub fn annotation_for(&self, image: &Path, annotation_dir: &Path) -> Option<PathBuf> {
        let stem = image.file_stem()?;
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(&self.annotation_extension);
        Some(annotation_dir.join(name))
    }

    /// Fetch qualifying records and copy every complete pair
    pub async fn sync<S: RecordSource>(&self, source: &S) -> Result<SyncSummary, SyncError> {
        info!("Dataset sync started");
        let records = source.fetch_records().await?;
        let summary = self.sync_records(&records);
        info!(
            "Dataset sync finished: {} records, stain +{}, symbol +{}, {} failed",
            summary.records,
            summary.copied_for(ModelKind::Stain),
            summary.copied_for(ModelKind::Symbol),
            summary.failed
        );
        Ok(summary)
    }

    pub fn sync_records(&self, records: &[DatasetRecord]) -> SyncSummary {
        let mut summary = SyncSummary::default();
        for record in records.iter().filter(|r| r.qualifies()) {
            summary.records += 1;
            for target in &self.targets {
                match self.copy_pair(target, record.url_for(target.kind)) {
                    Ok(PairOutcome::Copied) => {
                        *summary.copied.entry(target.kind).or_default() += 1;
                    }
                    Ok(PairOutcome::NoUrl) => {}
                    Ok(outcome) => {
                        log_missing(target.kind, &outcome);
                        *summary.skipped.entry(target.kind).or_default() += 1;
                    }
                    Err(e) => {
                        warn!("[{}] Failed to copy pair: {:#}", target.kind, e);
                        summary.failed += 1;
                    }
                }
            }
        }
        summary
    }

    /// Copy image and annotation together or not at all
    pub fn copy_pair(&self, target: &SyncTarget, url: Option<&str>) -> Result<PairOutcome> {
        let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
            return Ok(PairOutcome::NoUrl);
        };
        let image = self.resolve_image(url);
        let annotation = self
            .annotation_for(&image, &target.annotation_source)
            .ok_or_else(|| anyhow::anyhow!("Image URL has no file name: {}", url))?;

        match (image.is_file(), annotation.is_file()) {
            (true, true) => {}
            (false, true) => return Ok(PairOutcome::MissingImage(image)),
            (true, false) => return Ok(PairOutcome::MissingAnnotation(annotation)),
            (false, false) => return Ok(PairOutcome::MissingBoth { image, annotation }),
        }

        let image_name = image
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Image URL has no file name: {}", url))?;
        let annotation_name = annotation
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Annotation path has no file name: {:?}", annotation))?;

        fs::create_dir_all(&target.pool_images)?;
        fs::create_dir_all(&target.pool_labels)?;
        let image_dst = target.pool_images.join(image_name);
        let annotation_dst = target.pool_labels.join(annotation_name);

        // Both files are staged next to their destinations and only renamed
        // into the pool once both copies exist.
        let image_tmp = staging_path(&image_dst);
        let annotation_tmp = staging_path(&annotation_dst);
        let staged = fs::copy(&image, &image_tmp)
            .with_context(|| format!("Failed to copy {:?} to {:?}", image, image_tmp))
            .and_then(|_| {
                fs::copy(&annotation, &annotation_tmp)
                    .with_context(|| format!("Failed to copy {:?} to {:?}", annotation, annotation_tmp))
            });
        if let Err(e) = staged {
            discard(&image_tmp);
            discard(&annotation_tmp);
            return Err(e);
        }

        fs::rename(&annotation_tmp, &annotation_dst).with_context(|| {
            discard(&image_tmp);
            discard(&annotation_tmp);
            format!("Failed to move {:?} into the pool", annotation_dst)
        })?;
        fs::rename(&image_tmp, &image_dst).with_context(|| {
            discard(&image_tmp);
            discard(&annotation_dst);
            format!("Failed to move {:?} into the pool", image_dst)
        })?;
        debug!("[{}] Copied {:?}", target.kind, image_name);
        Ok(PairOutcome::Copied)
    }
}

/// Hidden sibling of `dst` used while a pair is being copied
fn staging_path(dst: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = dst.file_name() {
        name.push(file_name);
    }
    name.push(".partial");
    dst.with_file_name(name)
}

/// Remove a file left behind by an unfinished pair copy
fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed unfinished copy {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove unfinished copy {:?}: {}", path, e),
    }
}

fn log_missing(kind: ModelKind, outcome: &PairOutcome) {
    match outcome {
        PairOutcome::MissingImage(image) => warn!("[{}] Missing image {:?}, skipped", kind, image),
        PairOutcome::MissingAnnotation(annotation) => {
            warn!("[{}] Missing annotation {:?}, skipped", kind, annotation)
        }
        PairOutcome::MissingBoth { image, annotation } => {
            warn!("[{}] Missing image {:?} and annotation {:?}, skipped", kind, image, annotation)
        }
        PairOutcome::Copied | PairOutcome::NoUrl => {}
    }
}

/// Number of images currently in a pool directory
pub fn pool_size(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read pool {:?}", dir))? {
        if entry?.file_type()?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}
