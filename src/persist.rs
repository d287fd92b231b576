//! Saved models: network weights as safetensors next to a JSON file with
//! the classes, feature configuration, network shape and training history.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{AugmentConfig, CryClass, FeatureConfig, NetworkConfig};
use crate::error::{Error, Result};
use crate::models::{l2_normalize, History};
use crate::network::{argmax_rows, Network};
use crate::process::extract_features;

/// Everything except the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ModelMetadata {
    classes: Vec<CryClass>,
    features: FeatureConfig,
    input_dim: usize,
    network: NetworkConfig,
    history: History,
}

/// A fitted network with what is needed to run it on new recordings.
#[derive(Debug)]
pub struct TrainedModel {
    pub classes: Vec<CryClass>,
    pub features: FeatureConfig,
    pub network: Network,
    pub history: History,
}

/// Most likely class for one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: CryClass,
    pub label: u8,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.probabilities
            .get(self.label as usize)
            .copied()
            .unwrap_or(0.0)
    }
}

/// The JSON file stored beside a weights file.
pub fn metadata_path(weights: &Path) -> Result<PathBuf> {
    let metadata = weights.with_extension("json");
    if metadata == weights {
        return Err(Error::InvalidParameter(format!(
            "{} would be overwritten by its own metadata; use a .safetensors path",
            weights.display()
        )));
    }
    Ok(metadata)
}

impl TrainedModel {
    /// Writes the weights to `path` and the metadata beside it.
    pub fn save(&self, path: &Path) -> Result<()> {
        let metadata_file = metadata_path(path)?;
        let metadata = ModelMetadata {
            classes: self.classes.clone(),
            features: self.features.clone(),
            input_dim: self.network.input_dim(),
            network: self.network.config().clone(),
            history: self.history.clone(),
        };

        let file = File::create(&metadata_file).map_err(|e| Error::io(&metadata_file, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &metadata)?;
        writer.flush().map_err(|e| Error::io(&metadata_file, e))?;

        self.network.save_weights(path)?;
        info!(
            "model saved to {} ({})",
            path.display(),
            metadata_file.display()
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let metadata_file = metadata_path(path)?;
        let file = File::open(&metadata_file).map_err(|e| Error::io(&metadata_file, e))?;
        let metadata: ModelMetadata = serde_json::from_reader(BufReader::new(file))?;
        if metadata.classes.len() != metadata.network.num_classes {
            return Err(Error::InvalidDataset(format!(
                "model lists {} classes but has {} outputs",
                metadata.classes.len(),
                metadata.network.num_classes
            )));
        }

        let mut network = Network::new(metadata.input_dim, &metadata.network)?;
        network.load_weights(path)?;
        Ok(Self {
            classes: metadata.classes,
            features: metadata.features,
            network,
            history: metadata.history,
        })
    }

    /// Class probabilities for already extracted, unnormalized feature rows.
    pub fn predict_features(&self, features: &Array2<f32>) -> Result<Array2<f32>> {
        self.network.predict(&l2_normalize(features))
    }

    pub fn classify_file(&self, path: &Path) -> Result<Prediction> {
        // no augmentation, so the generator is never drawn from
        let mut rng = StdRng::seed_from_u64(0);
        let features = extract_features(
            path,
            None,
            &self.features,
            &AugmentConfig::default(),
            &mut rng,
        )?;
        let row = Array2::from_shape_vec((1, features.len()), features)
            .map_err(|e| Error::InvalidDataset(e.to_string()))?;

        let probabilities = self.predict_features(&row)?;
        let label = argmax_rows(&probabilities)
            .first()
            .copied()
            .unwrap_or_default();
        let class = *self.classes.get(label as usize).ok_or_else(|| {
            Error::InvalidDataset(format!("no class for output {label}"))
        })?;

        Ok(Prediction {
            class,
            label,
            probabilities: probabilities.row(0).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sine, write_wav};
    use tempfile::TempDir;

    fn model() -> TrainedModel {
        let network = Network::new(13, &NetworkConfig::default()).unwrap();
        TrainedModel {
            classes: CryClass::ALL.to_vec(),
            features: FeatureConfig::default(),
            network,
            history: History {
                loss: vec![1.2, 0.9],
                accuracy: vec![0.4, 0.6],
                val_loss: vec![1.3, 1.0],
                val_accuracy: vec![0.3, 0.5],
                learning_rate: vec![0.05, 0.05],
            },
        }
    }

    #[test]
    fn test_save_and_load_preserve_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let original = model();
        original.save(&path).unwrap();
        assert!(dir.path().join("model.json").exists());

        let loaded = TrainedModel::load(&path).unwrap();
        assert_eq!(loaded.classes, original.classes);
        assert_eq!(loaded.features, original.features);
        assert_eq!(loaded.history, original.history);
        assert_eq!(loaded.network.input_dim(), 13);

        let rows = Array2::from_shape_fn((3, 13), |(i, j)| ((i * 13 + j) as f32).sin());
        assert_eq!(
            loaded.predict_features(&rows).unwrap(),
            original.predict_features(&rows).unwrap()
        );
    }

    #[test]
    fn test_classify_file_returns_distribution() {
        let dir = TempDir::new().unwrap();
        let wav = dir.path().join("cry.wav");
        write_wav(&wav, &sine(450.0, 22050, 0.5), 22050);

        let prediction = model().classify_file(&wav).unwrap();
        assert_eq!(prediction.probabilities.len(), 6);
        assert!((prediction.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert_eq!(prediction.class, CryClass::ALL[prediction.label as usize]);
        assert!(prediction.confidence() >= 1.0 / 6.0);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = TrainedModel::load(Path::new("/nonexistent/model.safetensors")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_json_weights_path_is_rejected() {
        assert!(matches!(
            metadata_path(Path::new("model.json")),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(
            metadata_path(Path::new("out/model.safetensors")).unwrap(),
            Path::new("out/model.json")
        );
    }

    #[test]
    fn test_load_rejects_class_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut broken = model();
        broken.classes.pop();
        broken.save(&path).unwrap();
        assert!(matches!(
            TrainedModel::load(&path),
            Err(Error::InvalidDataset(_))
        ));
    }
}
