use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::Array2;
use rand::Rng;

use crate::audio::is_wav;
use crate::augment::Augmentation;
use crate::config::{AugmentConfig, CryClass, FeatureConfig};
use crate::error::{Error, Result};
use crate::process::extract_features;

/// Feature rows and their class labels, index-aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<u8>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn push(&mut self, features: Vec<f32>, label: u8) {
        self.features.push(features);
        self.labels.push(label);
    }

    pub fn extend(&mut self, other: Dataset) {
        self.features.extend(other.features);
        self.labels.extend(other.labels);
    }

    /// Width of the feature rows; errors on empty or ragged data.
    pub fn feature_dim(&self) -> Result<usize> {
        let dim = self
            .features
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::InvalidDataset("dataset is empty".into()))?;
        if self.features.len() != self.labels.len() {
            return Err(Error::InvalidDataset(format!(
                "{} feature rows but {} labels",
                self.features.len(),
                self.labels.len()
            )));
        }
        if let Some(row) = self.features.iter().position(|r| r.len() != dim) {
            return Err(Error::InvalidDataset(format!(
                "row {row} has {} features, expected {dim}",
                self.features[row].len()
            )));
        }
        Ok(dim)
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        let dim = self.feature_dim()?;
        let flat: Vec<f32> = self.features.iter().flatten().copied().collect();
        Array2::from_shape_vec((self.len(), dim), flat)
            .map_err(|e| Error::InvalidDataset(e.to_string()))
    }
}

/// WAV files directly inside `dir`, sorted by name.
pub fn wav_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file() && is_wav(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Extracts features for every WAV in `dir`: the clean clip first, then
/// one row per augmentation when `augment` is set.
pub fn load_class_dir<R: Rng + ?Sized>(
    dir: &Path,
    label: u8,
    augment: bool,
    features: &FeatureConfig,
    augmentation: &AugmentConfig,
    rng: &mut R,
) -> Result<Dataset> {
    let mut dataset = Dataset::default();
    for file in wav_files(dir)? {
        debug!("processing {}", file.display());
        dataset.push(
            extract_features(&file, None, features, augmentation, rng)?,
            label,
        );

        if augment {
            for aug in Augmentation::ALL {
                dataset.push(
                    extract_features(&file, Some(aug), features, augmentation, rng)?,
                    label,
                );
            }
        }
    }
    Ok(dataset)
}

/// Walks `base_dir/<class>` for each class; labels follow the order of
/// `classes`.
pub fn build_dataset<R: Rng + ?Sized>(
    base_dir: &Path,
    classes: &[CryClass],
    augment: bool,
    features: &FeatureConfig,
    augmentation: &AugmentConfig,
    rng: &mut R,
) -> Result<Dataset> {
    let mut dataset = Dataset::default();
    for (idx, class) in classes.iter().enumerate() {
        let label = u8::try_from(idx)
            .map_err(|_| Error::InvalidParameter(format!("too many classes ({})", classes.len())))?;
        let dir = base_dir.join(class.as_str());
        let rows = load_class_dir(&dir, label, augment, features, augmentation, rng)?;
        info!("class {class} (label {label}): {} rows", rows.len());
        dataset.extend(rows);
    }
    info!("dataset built: {} rows", dataset.len());
    Ok(dataset)
}

/// Number of WAV files per class directory.
pub fn count_class_files(base_dir: &Path, classes: &[CryClass]) -> Result<Vec<(CryClass, usize)>> {
    classes
        .iter()
        .map(|&class| Ok((class, wav_files(&base_dir.join(class.as_str()))?.len())))
        .collect()
}
