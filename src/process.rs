//! Spectral processing: STFT, mel filterbank and MFCC.

use std::f32::consts::PI;
use std::path::Path;
use std::sync::Arc;

use log::trace;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::audio::load_audio;
use crate::augment::Augmentation;
use crate::config::{AugmentConfig, FeatureConfig};
use crate::error::Result;

const AMIN: f32 = 1e-10;
const TOP_DB: f32 = 80.0;

/// Periodic Hann window.
pub fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / size as f32).cos())
        .collect()
}

/// Short-time Fourier transform with centered, zero padded frames.
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop_length: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            n_fft,
            hop_length,
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    pub fn n_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn n_frames(&self, len: usize) -> usize {
        1 + len / self.hop_length
    }

    /// Returns `frames x (n_fft / 2 + 1)` complex bins.
    pub fn forward(&self, samples: &[f32]) -> Vec<Vec<Complex<f32>>> {
        let pad = self.n_fft / 2;
        let n_frames = self.n_frames(samples.len());
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];

        (0..n_frames)
            .map(|frame| {
                let start = frame * self.hop_length;
                for (j, slot) in buffer.iter_mut().enumerate() {
                    // index into the virtually padded signal
                    let sample = (start + j)
                        .checked_sub(pad)
                        .and_then(|i| samples.get(i))
                        .copied()
                        .unwrap_or(0.0);
                    *slot = Complex::new(sample * self.window[j], 0.0);
                }
                self.forward.process(&mut buffer);
                buffer[..self.n_bins()].to_vec()
            })
            .collect()
    }

    /// Overlap-add inverse of [`Stft::forward`], trimmed or padded to `length`.
    pub fn inverse(&self, frames: &[Vec<Complex<f32>>], length: usize) -> Vec<f32> {
        let pad = self.n_fft / 2;
        let total = self.n_fft + self.hop_length * frames.len().saturating_sub(1);
        let mut signal = vec![0.0f32; total];
        let mut norm = vec![0.0f32; total];
        let mut buffer = vec![Complex::new(0.0, 0.0); self.n_fft];

        for (t, frame) in frames.iter().enumerate() {
            // rebuild the full spectrum from the one-sided bins
            for (k, slot) in buffer.iter_mut().enumerate() {
                *slot = if k < frame.len() {
                    frame[k]
                } else {
                    frame[self.n_fft - k].conj()
                };
            }
            self.inverse.process(&mut buffer);

            let start = t * self.hop_length;
            for (j, value) in buffer.iter().enumerate() {
                let w = self.window[j];
                signal[start + j] += value.re / self.n_fft as f32 * w;
                norm[start + j] += w * w;
            }
        }

        let mut out: Vec<f32> = signal
            .iter()
            .zip(&norm)
            .skip(pad)
            .take(length)
            .map(|(&s, &n)| if n > AMIN { s / n } else { s })
            .collect();
        out.resize(length, 0.0);
        out
    }
}

fn hz_to_mel(hz: f32) -> f32 {
    // Slaney scale: linear below 1 kHz, logarithmic above
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4f32.ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = 6.4f32.ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * f_sp
    }
}

/// Triangular, area-normalized mel filters of shape `n_mels x (n_fft / 2 + 1)`.
pub fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: u32) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;
    let fft_freqs: Vec<f32> = (0..n_bins)
        .map(|i| i as f32 * sample_rate as f32 / n_fft as f32)
        .collect();

    let mel_max = hz_to_mel(nyquist);
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            filters[[m, k]] = lower.min(upper).max(0.0) * enorm;
        }
    }
    filters
}

/// Mel power spectrogram, `n_mels x frames`.
pub fn mel_spectrogram(samples: &[f32], sample_rate: u32, config: &FeatureConfig) -> Array2<f32> {
    let stft = Stft::new(config.n_fft, config.hop_length);
    let frames = stft.forward(samples);

    let mut power = Array2::<f32>::zeros((stft.n_bins(), frames.len()));
    for (t, frame) in frames.iter().enumerate() {
        for (k, bin) in frame.iter().enumerate() {
            power[[k, t]] = bin.norm_sqr();
        }
    }

    mel_filterbank(config.n_mels, config.n_fft, sample_rate).dot(&power)
}

/// Converts power to decibels relative to `reference`, floored `TOP_DB`
/// below the peak.
pub fn power_to_db(power: &Array2<f32>, reference: f32) -> Array2<f32> {
    let offset = 10.0 * reference.max(AMIN).log10();
    let db = power.mapv(|p| 10.0 * p.max(AMIN).log10() - offset);
    let peak = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    db.mapv(|v| v.max(peak - TOP_DB))
}

/// Mel spectrogram in dB referenced to its own maximum, for display.
pub fn mel_spectrogram_db(samples: &[f32], sample_rate: u32, config: &FeatureConfig) -> Array2<f32> {
    let mel = mel_spectrogram(samples, sample_rate, config);
    let peak = mel.iter().copied().fold(0.0f32, f32::max);
    power_to_db(&mel, peak)
}

/// Orthonormal DCT-II along the first axis, keeping `n_out` rows.
fn dct_ortho(input: &Array2<f32>, n_out: usize) -> Array2<f32> {
    let n = input.nrows();
    let basis = Array2::from_shape_fn((n_out, n), |(k, i)| {
        let scale = if k == 0 {
            (1.0 / n as f32).sqrt()
        } else {
            (2.0 / n as f32).sqrt()
        };
        scale * (PI * k as f32 * (2 * i + 1) as f32 / (2 * n) as f32).cos()
    });
    basis.dot(input)
}

/// MFCC matrix of shape `n_mfcc x frames`.
pub fn mfcc(samples: &[f32], sample_rate: u32, config: &FeatureConfig) -> Array2<f32> {
    let mel = mel_spectrogram(samples, sample_rate, config);
    dct_ortho(&power_to_db(&mel, 1.0), config.n_mfcc)
}

/// Mean of each MFCC coefficient over time; always `n_mfcc` long.
pub fn mean_mfcc(samples: &[f32], sample_rate: u32, config: &FeatureConfig) -> Vec<f32> {
    mfcc(samples, sample_rate, config)
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(config.n_mfcc))
        .to_vec()
}

/// Loads `path`, optionally augments it, and reduces it to one mean MFCC
/// vector of `features.n_mfcc` values.
pub fn extract_features<R: Rng + ?Sized>(
    path: &Path,
    augmentation: Option<Augmentation>,
    features: &FeatureConfig,
    augment: &AugmentConfig,
    rng: &mut R,
) -> Result<Vec<f32>> {
    let audio = load_audio(path, features.sample_rate, features.fixed_length)?;
    let samples = match augmentation {
        Some(aug) => aug.apply(&audio.samples, audio.sample_rate, augment, rng)?,
        None => audio.samples,
    };
    trace!(
        "extracting mfcc from {} ({:?}, {} samples)",
        path.display(),
        augmentation,
        samples.len()
    );
    Ok(mean_mfcc(&samples, audio.sample_rate, features))
}
