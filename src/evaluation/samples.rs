use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::ClassSet;

const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// Test image whose ground-truth class is encoded in its file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub class_index: usize,
}

/// Ground truth from a file name such as `Coffee_0012.jpg`: the stem up to the
/// first `_`, lower-cased, must be a known class.
pub fn ground_truth_from_file_name(file_name: &str, classes: &ClassSet) -> Option<usize> {
    let path = Path::new(file_name);
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let label = stem.split('_').next()?.to_lowercase();
    classes.index_of(&label)
}

/// List labeled images in `dir`, sorted by file name so every pass sees the
/// same order regardless of how the file system enumerates entries.
pub fn collect_labeled_images(dir: &Path, classes: &ClassSet) -> Result<Vec<LabeledImage>> {
    let mut images = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read test directory {:?}", dir))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(class_index) = ground_truth_from_file_name(name, classes) {
            images.push(LabeledImage {
                path: entry.path(),
                class_index,
            });
        }
    }
    images.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> ClassSet {
        ClassSet::new(["blood", "coffee", "wine"])
    }

    #[test]
    fn prefix_before_underscore_is_the_label() {
        assert_eq!(ground_truth_from_file_name("Coffee_0012.JPG", &classes()), Some(1));
        assert_eq!(ground_truth_from_file_name("wine.png", &classes()), Some(2));
    }

    #[test]
    fn unknown_labels_and_extensions_are_ignored() {
        assert_eq!(ground_truth_from_file_name("tea_01.jpg", &classes()), None);
        assert_eq!(ground_truth_from_file_name("blood_01.txt", &classes()), None);
        assert_eq!(ground_truth_from_file_name("blood_01.jpeg", &classes()), None);
    }
}
