#![cfg(unix)]

mod common;

use std::path::Path;
use std::time::{Duration, Instant};

use common::*;
use image::DynamicImage;
use tempfile::TempDir;
use washlens::detection::{SidecarRuntime, ValidationRequest};

/// Detector helper answering each request with the shell snippet of the
/// first matching `case` pattern; `$id` holds the request id
fn scripted_helper(dir: &TempDir, cases: &str) -> SidecarRuntime {
    let script = format!(
        r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  case "$line" in
{cases}
    *'"op":"release"'*) exit 0 ;;
    *) printf '{{"id":"%s","error":{{"kind":"other","message":"unexpected"}}}}\n' "$id" ;;
  esac
done
"#
    );
    let path = dir.path().join("helper.sh");
    std::fs::write(&path, script).unwrap();
    SidecarRuntime::new("sh", vec![path.display().to_string()])
}

const LOAD_OK: &str = r#"    *'"op":"load"'*) printf '{"id":"%s","result":null}\n' "$id" ;;"#;

fn image() -> DynamicImage {
    DynamicImage::new_rgb8(8, 8)
}

#[test]
fn out_of_memory_on_accelerator_falls_back_to_cpu() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!(
            "{}\n{}",
            r#"    *'"op":"load"'*'"mode":"accelerated_half"'*) printf '{"id":"%s","error":{"kind":"out_of_memory","message":"CUDA out of memory"}}\n' "$id" ;;"#,
            LOAD_OK
        ),
    );
    let mut backend = DetectionBackend::new(runtime);

    let loaded = backend.load(Path::new("best.pt")).unwrap();
    assert_eq!(loaded.mode, ExecutionMode::CpuFull);
    backend.unload(loaded);
}

#[test]
fn other_load_errors_are_returned() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        r#"    *'"op":"load"'*) printf '{"id":"%s","error":{"kind":"bad_weights","message":"unexpected end of file"}}\n' "$id" ;;"#,
    );
    let mut backend = DetectionBackend::new(runtime);

    match backend.load(Path::new("best.pt")).err() {
        Some(LoadError::Other { source, .. }) => {
            assert!(source.to_string().contains("unexpected end of file"));
        }
        other => panic!("expected a non-memory load error, got {:?}", other),
    }
}

#[test]
fn null_inference_result_is_an_empty_record() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!(
            "{}\n{}",
            LOAD_OK,
            r#"    *'"op":"infer"'*) printf '{"id":"%s","result":null}\n' "$id" ;;"#
        ),
    );
    let mut backend = DetectionBackend::new(runtime);
    let mut loaded = backend.load(Path::new("best.pt")).unwrap();

    let record = loaded.infer(&image(), 0.25).unwrap();
    assert!(record.detections.is_empty());
}

#[test]
fn detections_are_read_from_the_result() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!(
            "{}\n{}",
            LOAD_OK,
            r#"    *'"op":"infer"'*) printf '{"id":"%s","result":[{"class_index":1,"confidence":0.8},{"class_index":0,"confidence":0.4}]}\n' "$id" ;;"#
        ),
    );
    let mut backend = DetectionBackend::new(runtime);
    let mut loaded = backend.load(Path::new("best.pt")).unwrap();

    let record = loaded.infer(&image(), 0.25).unwrap();
    assert_eq!(record.detections.len(), 2);
    assert_eq!(record.detections[0].class_index, 1);
    assert_eq!(record.detections[0].confidence, 0.8);
}

#[test]
fn responses_for_other_requests_are_skipped() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!(
            "{}\n{}",
            LOAD_OK,
            r#"    *'"op":"infer"'*)
      printf '{"id":"00000000-0000-0000-0000-000000000000","result":[{"class_index":2,"confidence":0.9}]}\n'
      printf '\n'
      printf '{"id":"%s","result":[]}\n' "$id" ;;"#
        ),
    );
    let mut backend = DetectionBackend::new(runtime);
    let mut loaded = backend.load(Path::new("best.pt")).unwrap();

    let record = loaded.infer(&image(), 0.25).unwrap();
    assert!(record.detections.is_empty());
}

#[test]
fn validation_outcome_is_read_from_the_result() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!(
            "{}\n{}",
            LOAD_OK,
            r#"    *'"op":"validate"'*'"augment":true'*) printf '{"id":"%s","result":{"class_ap":{"0":0.7,"2":0.5},"precision":0.8,"recall":0.7,"map50":0.6,"map50_95":0.3,"inference_ms":12.5,"names":["wash_30","no_bleach","tumble_dry"]}}\n' "$id" ;;"#
        ),
    );
    let mut backend = DetectionBackend::new(runtime);
    let mut loaded = backend.load(Path::new("best.pt")).unwrap();

    let outcome = loaded
        .validate(&ValidationRequest {
            data_config: "data/symbol/data.yaml".into(),
            split: "test".to_string(),
            image_size: 2048,
            confidence: 0.5,
            augment: true,
            classes: Some(vec![0, 2]),
        })
        .unwrap();
    assert_eq!(outcome.class_ap[&2], 0.5);
    assert_eq!(outcome.map50, 0.6);
    assert_eq!(outcome.names.len(), 3);
}

#[test]
fn helper_exit_is_an_inference_error() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!("{}\n{}", LOAD_OK, r#"    *'"op":"infer"'*) exit 0 ;;"#),
    );
    let mut backend = DetectionBackend::new(runtime);
    let mut loaded = backend.load(Path::new("best.pt")).unwrap();

    let err = loaded.infer(&image(), 0.25).unwrap_err();
    assert!(format!("{:#}", err).contains("closed its output"));
}

#[test]
fn hung_helper_does_not_block_unload() {
    let dir = TempDir::new().unwrap();
    let runtime = scripted_helper(
        &dir,
        &format!(
            "{}\n{}",
            r#"    *'"op":"release"'*) exec sleep 60 ;;"#,
            LOAD_OK
        ),
    );
    let mut backend = DetectionBackend::new(runtime);
    let loaded = backend.load(Path::new("best.pt")).unwrap();

    let started = Instant::now();
    backend.unload(loaded);
    assert!(started.elapsed() < Duration::from_secs(10));
}
