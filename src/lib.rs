//! Infant cry classification from short WAV recordings: augmentation,
//! mean-MFCC features and a small dense network.

pub mod audio;
pub mod augment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod models;
pub mod network;
pub mod persist;
pub mod pipeline;
pub mod process;
pub mod show;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
