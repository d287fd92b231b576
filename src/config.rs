//! Pipeline configuration.
//!
//! Every default mirrors the values the classifier was originally tuned
//! with, so `PipelineConfig::default()` reproduces the reference run.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The six categories the classifier distinguishes. Label index is the
/// position in [`CryClass::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryClass {
    BellyPain,
    Burping,
    Discomfort,
    Hungry,
    Tired,
    NotBaby,
}

impl CryClass {
    pub const ALL: [CryClass; 6] = [
        CryClass::BellyPain,
        CryClass::Burping,
        CryClass::Discomfort,
        CryClass::Hungry,
        CryClass::Tired,
        CryClass::NotBaby,
    ];

    /// Directory name of the class inside the dataset root.
    pub fn as_str(&self) -> &'static str {
        match self {
            CryClass::BellyPain => "belly_pain",
            CryClass::Burping => "burping",
            CryClass::Discomfort => "discomfort",
            CryClass::Hungry => "hungry",
            CryClass::Tired => "tired",
            CryClass::NotBaby => "not_baby",
        }
    }
}

impl fmt::Display for CryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CryClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CryClass::ALL
            .iter()
            .copied()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown class name: {s}")))
    }
}

/// Loading and MFCC parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    /// Minimum number of samples; shorter clips are zero padded.
    pub fixed_length: usize,
    pub n_mfcc: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            fixed_length: 66150,
            n_mfcc: 13,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    pub noise_factor: f32,
    pub pitch_steps: f32,
    pub stretch_rate: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            noise_factor: 0.005,
            pitch_steps: 2.0,
            stretch_rate: 1.25,
        }
    }
}

/// Shape of the dense network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub hidden_units: Vec<usize>,
    /// One rate per hidden block.
    pub dropout: Vec<f32>,
    pub num_classes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden_units: vec![256, 128, 64],
            dropout: vec![0.4, 0.3, 0.2],
            num_classes: CryClass::ALL.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub test_fraction: f32,
    pub seed: u64,
    pub learning_rate: f32,
    pub epochs: usize,
    pub batch_size: usize,
    pub plateau_factor: f32,
    pub plateau_patience: usize,
    pub plateau_min_delta: f32,
    pub min_learning_rate: f32,
    pub early_stop_patience: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            test_fraction: 0.2,
            seed: 42,
            learning_rate: 0.05,
            epochs: 50,
            batch_size: 32,
            plateau_factor: 0.5,
            plateau_patience: 3,
            plateau_min_delta: 1e-4,
            min_learning_rate: 1e-5,
            early_stop_patience: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub classes: Vec<CryClass>,
    pub augment: bool,
    pub features: FeatureConfig,
    pub augmentation: AugmentConfig,
    pub network: NetworkConfig,
    pub training: TrainConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classes: CryClass::ALL.to_vec(),
            augment: true,
            features: FeatureConfig::default(),
            augmentation: AugmentConfig::default(),
            network: NetworkConfig::default(),
            training: TrainConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config; fields left out keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidParameter(msg));

        if self.classes.is_empty() {
            return invalid("at least one class is required".into());
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.classes.iter().find(|c| !seen.insert(**c)) {
            return invalid(format!("class {dup} is listed more than once"));
        }
        if self.classes.len() != self.network.num_classes {
            return invalid(format!(
                "{} classes configured but the network has {} outputs",
                self.classes.len(),
                self.network.num_classes
            ));
        }
        if self.network.hidden_units.len() != self.network.dropout.len() {
            return invalid("hidden_units and dropout must have the same length".into());
        }
        if let Some(rate) = self.network.dropout.iter().find(|r| !(0.0..1.0).contains(*r)) {
            return invalid(format!("dropout rate {rate} outside [0, 1)"));
        }
        let f = &self.features;
        if f.sample_rate == 0 || f.n_mfcc == 0 || f.n_fft == 0 || f.hop_length == 0 {
            return invalid("feature parameters must be non-zero".into());
        }
        if f.n_mfcc > f.n_mels {
            return invalid(format!("n_mfcc ({}) exceeds n_mels ({})", f.n_mfcc, f.n_mels));
        }
        if self.augmentation.stretch_rate <= 0.0 {
            return invalid("stretch_rate must be positive".into());
        }
        let t = &self.training;
        if !(0.0..1.0).contains(&t.test_fraction) || t.test_fraction == 0.0 {
            return invalid(format!("test_fraction {} outside (0, 1)", t.test_fraction));
        }
        if t.epochs == 0 {
            return invalid("epochs must be non-zero".into());
        }
        // batch norm needs two rows per batch
        if t.batch_size < 2 {
            return invalid(format!("batch_size {} is below 2", t.batch_size));
        }
        if !(t.plateau_factor > 0.0 && t.plateau_factor < 1.0) {
            return invalid(format!("plateau_factor {} outside (0, 1)", t.plateau_factor));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_class_names_round_trip() {
        for (idx, class) in CryClass::ALL.iter().enumerate() {
            assert_eq!(class.as_str().parse::<CryClass>().unwrap(), *class);
            assert_eq!(CryClass::ALL[idx], *class);
        }
        assert!("crying".parse::<CryClass>().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"augment": false, "training": {"epochs": 3}}"#).unwrap();
        assert!(!config.augment);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.features.n_mfcc, 13);
        assert_eq!(config.classes.len(), 6);
    }

    #[test]
    fn test_mismatched_dropout_is_rejected() {
        let mut config = PipelineConfig::default();
        config.network.dropout.pop();
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_duplicate_classes_are_rejected() {
        let mut config = PipelineConfig::default();
        config.classes[5] = CryClass::Hungry;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(msg) if msg.contains("hungry")));
    }

    #[test]
    fn test_plateau_factor_must_shrink_the_rate() {
        for factor in [0.0, 1.0, 1.5, -0.5] {
            let mut config = PipelineConfig::default();
            config.training.plateau_factor = factor;
            assert!(
                matches!(config.validate(), Err(Error::InvalidParameter(_))),
                "factor {factor} accepted"
            );
        }
    }

    #[test]
    fn test_single_row_batches_are_rejected() {
        let mut config = PipelineConfig::default();
        config.training.batch_size = 1;
        assert!(matches!(config.validate(), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_class_count_must_match_outputs() {
        let mut config = PipelineConfig::default();
        config.classes.truncate(4);
        assert!(config.validate().is_err());
    }
}
