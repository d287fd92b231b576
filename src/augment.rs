//! Waveform augmentations used to enlarge the training set.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use rand::distributions::Distribution;
use rand::Rng;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::audio::resample;
use crate::config::AugmentConfig;
use crate::error::{Error, Result};
use crate::process::Stft;

const VOCODER_N_FFT: usize = 2048;
const VOCODER_HOP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Augmentation {
    Noise,
    PitchShift,
    TimeStretch,
}

impl Augmentation {
    /// Order in which the dataset builder applies augmentations.
    pub const ALL: [Augmentation; 3] = [
        Augmentation::Noise,
        Augmentation::PitchShift,
        Augmentation::TimeStretch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Augmentation::Noise => "noise",
            Augmentation::PitchShift => "pitch_shift",
            Augmentation::TimeStretch => "time_stretch",
        }
    }

    /// Applies this augmentation with the parameters from `config`.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        samples: &[f32],
        sample_rate: u32,
        config: &AugmentConfig,
        rng: &mut R,
    ) -> Result<Vec<f32>> {
        match self {
            Augmentation::Noise => add_noise(samples, config.noise_factor, rng),
            Augmentation::PitchShift => pitch_shift(samples, sample_rate, config.pitch_steps),
            Augmentation::TimeStretch => time_stretch(samples, config.stretch_rate),
        }
    }
}

impl fmt::Display for Augmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Augmentation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Augmentation::ALL
            .iter()
            .copied()
            .find(|aug| aug.as_str() == s)
            .ok_or_else(|| Error::UnknownAugmentation(s.to_string()))
    }
}

/// Adds Gaussian noise scaled by `noise_factor`.
pub fn add_noise<R: Rng + ?Sized>(
    samples: &[f32],
    noise_factor: f32,
    rng: &mut R,
) -> Result<Vec<f32>> {
    let normal = Normal::new(0.0, 1.0).map_err(|e| Error::InvalidParameter(e.to_string()))?;
    Ok(samples
        .iter()
        .map(|&s| s + noise_factor * normal.sample(rng) as f32)
        .collect())
}

/// Changes duration by `rate` without touching pitch. The result holds
/// `round(len / rate)` samples.
pub fn time_stretch(samples: &[f32], rate: f32) -> Result<Vec<f32>> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(Error::InvalidParameter(format!("stretch rate {rate}")));
    }
    let length = (samples.len() as f32 / rate).round() as usize;
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let stft = Stft::new(VOCODER_N_FFT, VOCODER_HOP);
    let frames = stft.forward(samples);
    let stretched = phase_vocoder(&frames, rate, VOCODER_HOP, VOCODER_N_FFT);
    Ok(stft.inverse(&stretched, length))
}

/// Shifts pitch by `n_steps` semitones, keeping the original length.
pub fn pitch_shift(samples: &[f32], sample_rate: u32, n_steps: f32) -> Result<Vec<f32>> {
    if sample_rate == 0 {
        return Err(Error::InvalidParameter("sample rate must be non-zero".into()));
    }
    if samples.is_empty() || n_steps == 0.0 {
        return Ok(samples.to_vec());
    }
    let rate = 2f32.powf(-n_steps / 12.0);
    let stretched = time_stretch(samples, rate)?;

    // treat the stretched clip as recorded at sr / rate and bring it back to sr
    let mut shifted = resample(&stretched, rate as f64)?;
    shifted.resize(samples.len(), 0.0);
    Ok(shifted)
}

fn phase_vocoder(
    frames: &[Vec<Complex<f32>>],
    rate: f32,
    hop_length: usize,
    n_fft: usize,
) -> Vec<Vec<Complex<f32>>> {
    let n_bins = frames.first().map_or(0, Vec::len);
    let zero = vec![Complex::new(0.0, 0.0); n_bins];
    let column = |i: usize| frames.get(i).unwrap_or(&zero);

    let phi_advance: Vec<f32> = (0..n_bins)
        .map(|k| 2.0 * PI * hop_length as f32 * k as f32 / n_fft as f32)
        .collect();
    let mut phase_acc: Vec<f32> = column(0).iter().map(|c| c.arg()).collect();

    let mut out = Vec::new();
    let mut step = 0.0f32;
    while step < frames.len() as f32 {
        let base = step.floor() as usize;
        let alpha = step - base as f32;
        let (left, right) = (column(base), column(base + 1));

        let frame = (0..n_bins)
            .map(|k| {
                let mag = (1.0 - alpha) * left[k].norm() + alpha * right[k].norm();
                Complex::from_polar(mag, phase_acc[k])
            })
            .collect();
        out.push(frame);

        for k in 0..n_bins {
            let mut dphase = right[k].arg() - left[k].arg() - phi_advance[k];
            dphase -= 2.0 * PI * (dphase / (2.0 * PI)).round();
            phase_acc[k] += phi_advance[k] + dphase;
        }
        step += rate;
    }
    out
}
