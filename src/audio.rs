use std::path::Path;

use hound::SampleFormat;
use log::debug;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::error::{Error, Result};

/// Mono audio clip with amplitudes in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Audio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Audio {
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// True when the path carries a `.wav` extension (any case).
pub fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

/// Loads a WAV file at its native rate, downmixed to mono.
pub fn load_wav(file_path: &Path) -> Result<Audio> {
    let wav_err = |source| Error::Wav {
        path: file_path.to_path_buf(),
        source,
    };

    let reader = hound::WavReader::open(file_path).map_err(wav_err)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(wav_err)?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(wav_err)?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    debug!(
        "decoded {} ({} Hz, {} ch, {} frames)",
        file_path.display(),
        spec.sample_rate,
        channels,
        samples.len()
    );

    Ok(Audio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Resamples by `ratio` (output rate / input rate) with a band-limited sinc
/// interpolator. The result holds `round(len * ratio)` samples.
pub fn resample(samples: &[f32], ratio: f64) -> Result<Vec<f32>> {
    if !(ratio.is_finite() && ratio > 0.0) {
        return Err(Error::InvalidParameter(format!("resample ratio {ratio}")));
    }
    if samples.is_empty() || (ratio - 1.0).abs() < f64::EPSILON {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)
        .map_err(|e| Error::Resample(e.to_string()))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();

    let input = vec![samples.to_vec()];
    let mut output = resampler
        .process(&input, None)
        .map_err(|e| Error::Resample(e.to_string()))?
        .into_iter()
        .next()
        .unwrap_or_default();

    // flush the filter tail so the delayed samples come out
    while output.len() < expected + delay {
        let tail = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| Error::Resample(e.to_string()))?
            .into_iter()
            .next()
            .unwrap_or_default();
        if tail.is_empty() {
            break;
        }
        output.extend(tail);
    }

    let mut output: Vec<f32> = output.into_iter().skip(delay).take(expected).collect();
    output.resize(expected, 0.0);
    Ok(output)
}

/// Zero pads `samples` at the end up to `size`; never truncates.
pub fn pad_to_length(samples: &mut Vec<f32>, size: usize) {
    if samples.len() < size {
        samples.resize(size, 0.0);
    }
}

/// Loads a WAV clip, resampled to `target_sample_rate` and padded to at
/// least `fixed_length` samples. Longer clips keep their full length.
pub fn load_audio(path: &Path, target_sample_rate: u32, fixed_length: usize) -> Result<Audio> {
    if !is_wav(path) {
        return Err(Error::UnsupportedFormat(path.to_path_buf()));
    }

    let audio = load_wav(path)?;
    let mut samples = if audio.sample_rate == target_sample_rate {
        audio.samples
    } else {
        resample(
            &audio.samples,
            target_sample_rate as f64 / audio.sample_rate as f64,
        )?
    };
    pad_to_length(&mut samples, fixed_length);

    Ok(Audio {
        samples,
        sample_rate: target_sample_rate,
    })
}
