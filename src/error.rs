use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the classifier pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported file format: {0} (expected a .wav file)")]
    UnsupportedFormat(PathBuf),

    #[error("unknown augmentation type: {0}")]
    UnknownAugmentation(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Wav {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("plotting failed: {0}")]
    Plot(String),

    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("model serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn plot(err: impl std::fmt::Display) -> Self {
        Error::Plot(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
