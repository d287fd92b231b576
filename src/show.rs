//! PNG plots for inspecting recordings and training runs.

use std::path::{Path, PathBuf};

use log::info;
use ndarray::Array2;
use palette::{LinSrgb, Mix};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use rand::Rng;

use crate::audio::load_audio;
use crate::augment::{add_noise, Augmentation};
use crate::config::{AugmentConfig, CryClass, FeatureConfig};
use crate::error::{Error, Result};
use crate::metrics::ConfusionMatrix;
use crate::models::History;
use crate::process::mel_spectrogram_db;

const MAX_PLOT_POINTS: usize = 4000;

/// Thins a waveform to at most `MAX_PLOT_POINTS` (time, amplitude) pairs.
fn waveform_points(samples: &[f32], sample_rate: u32) -> Vec<(f32, f32)> {
    let step = samples.len().div_ceil(MAX_PLOT_POINTS).max(1);
    samples
        .iter()
        .enumerate()
        .step_by(step)
        .map(|(i, &s)| (i as f32 / sample_rate as f32, s))
        .collect()
}

fn amplitude_range<'a>(signals: impl IntoIterator<Item = &'a [f32]>) -> (f32, f32) {
    let (min, max) = signals
        .into_iter()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    if min < max {
        (min, max)
    } else {
        (-1.0, 1.0)
    }
}

/// Draws `overlay` (translucent blue) under `original` (orange).
pub fn plot_waveforms(
    original: &[f32],
    overlay: &[f32],
    sample_rate: u32,
    overlay_label: &str,
    title: &str,
    output: &Path,
) -> Result<()> {
    let root = BitMapBackend::new(output, (1500, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(Error::plot)?;

    let duration = original.len().max(overlay.len()).max(1) as f32 / sample_rate as f32;
    let (min_sample, max_sample) = amplitude_range([original, overlay]);

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0f32..duration, min_sample..max_sample)
        .map_err(Error::plot)?;

    chart
        .configure_mesh()
        .x_labels(10)
        .y_labels(5)
        .x_desc("Time (s)")
        .y_desc("Amplitude")
        .draw()
        .map_err(Error::plot)?;

    let orange = RGBColor(255, 140, 0);
    chart
        .draw_series(LineSeries::new(
            waveform_points(overlay, sample_rate),
            BLUE.mix(0.5),
        ))
        .map_err(Error::plot)?
        .label(overlay_label)
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE.mix(0.5)));
    chart
        .draw_series(LineSeries::new(
            waveform_points(original, sample_rate),
            orange.mix(0.75),
        ))
        .map_err(Error::plot)?
        .label("Original Audio")
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], orange.mix(0.75)));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(Error::plot)?;

    root.present().map_err(Error::plot)?;
    info!("waveform saved to {}", output.display());
    Ok(())
}

/// Blue to white to red, for x in [0, 1].
fn coolwarm(x: f32) -> RGBAColor {
    let blue = LinSrgb::new(0.0, 0.0, 1.0);
    let white = LinSrgb::new(1.0, 1.0, 1.0);
    let red = LinSrgb::new(1.0, 0.0, 0.0);

    let x = x.clamp(0.0, 1.0);
    let color = if x < 0.5 {
        blue.mix(white, x * 2.0)
    } else {
        white.mix(red, (x - 0.5) * 2.0)
    };

    RGBAColor(
        (color.red * 255.0) as u8,
        (color.green * 255.0) as u8,
        (color.blue * 255.0) as u8,
        1.0,
    )
}

/// White to blue, for x in [0, 1].
fn blues(x: f32) -> RGBAColor {
    let white = LinSrgb::new(0.97, 0.98, 1.0);
    let blue = LinSrgb::new(0.03, 0.19, 0.42);
    let color = white.mix(blue, x.clamp(0.0, 1.0));
    RGBAColor(
        (color.red * 255.0) as u8,
        (color.green * 255.0) as u8,
        (color.blue * 255.0) as u8,
        1.0,
    )
}

/// Heat map of a `n_mels x frames` dB spectrogram with a dB color bar.
pub fn plot_mel_spectrogram(
    mel_db: &Array2<f32>,
    sample_rate: u32,
    hop_length: usize,
    title: &str,
    output: &Path,
) -> Result<()> {
    let (n_mels, n_frames) = mel_db.dim();
    if n_mels == 0 || n_frames == 0 {
        return Err(Error::InvalidParameter("empty spectrogram".into()));
    }

    let root = BitMapBackend::new(output, (1500, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(Error::plot)?;
    let (main, bar) = root.split_horizontally(1380);

    let min_value = mel_db.iter().copied().fold(f32::INFINITY, f32::min);
    let max_value = mel_db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = (max_value - min_value).max(f32::EPSILON);
    let frame_secs = hop_length as f32 / sample_rate as f32;

    let mut chart = ChartBuilder::on(&main)
        .caption(title, ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0f32..n_frames as f32 * frame_secs, 0f32..n_mels as f32)
        .map_err(Error::plot)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Time (s)")
        .y_desc("Mel band")
        .draw()
        .map_err(Error::plot)?;

    chart
        .draw_series(mel_db.indexed_iter().map(|((band, frame), &value)| {
            let t = frame as f32 * frame_secs;
            Rectangle::new(
                [(t, band as f32), (t + frame_secs, band as f32 + 1.0)],
                coolwarm((value - min_value) / span).filled(),
            )
        }))
        .map_err(Error::plot)?;

    let mut colorbar = ChartBuilder::on(&bar)
        .margin(10)
        .margin_top(50)
        .y_label_area_size(60)
        .x_label_area_size(40)
        .build_cartesian_2d(0f32..1f32, min_value..max_value)
        .map_err(Error::plot)?;
    colorbar
        .configure_mesh()
        .disable_mesh()
        .disable_x_axis()
        .y_desc("dB")
        .y_label_formatter(&|v| format!("{v:+.0}"))
        .draw()
        .map_err(Error::plot)?;
    let steps = 64;
    colorbar
        .draw_series((0..steps).map(|i| {
            let lo = min_value + span * i as f32 / steps as f32;
            let hi = min_value + span * (i + 1) as f32 / steps as f32;
            Rectangle::new([(0.0, lo), (1.0, hi)], coolwarm(i as f32 / steps as f32).filled())
        }))
        .map_err(Error::plot)?;

    root.present().map_err(Error::plot)?;
    info!("mel spectrogram saved to {}", output.display());
    Ok(())
}

/// Training and validation accuracy (left) and loss (right) per epoch.
pub fn plot_history(history: &History, output: &Path) -> Result<()> {
    let epochs = history.epochs();
    if epochs == 0 {
        return Err(Error::InvalidParameter("empty training history".into()));
    }

    let root = BitMapBackend::new(output, (1400, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(Error::plot)?;
    let panels = root.split_evenly((1, 2));

    let curves = [
        (
            "Training and Validation Accuracy",
            "Accuracy",
            &history.accuracy,
            &history.val_accuracy,
        ),
        (
            "Training and Validation Loss",
            "Loss",
            &history.loss,
            &history.val_loss,
        ),
    ];

    for (panel, (title, y_desc, train, val)) in panels.iter().zip(curves) {
        let (lo, hi) = amplitude_range([train.as_slice(), val.as_slice()]);
        let pad = (hi - lo).max(1e-3) * 0.05;

        let mut chart = ChartBuilder::on(panel)
            .caption(title, ("sans-serif", 22))
            .margin(10)
            .x_label_area_size(40)
            .y_label_area_size(60)
            .build_cartesian_2d(1f32..(epochs as f32).max(2.0), (lo - pad)..(hi + pad))
            .map_err(Error::plot)?;
        chart
            .configure_mesh()
            .x_desc("Epoch")
            .y_desc(y_desc)
            .draw()
            .map_err(Error::plot)?;

        let points = |values: &[f32]| -> Vec<(f32, f32)> {
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| ((i + 1) as f32, v))
                .collect()
        };
        chart
            .draw_series(LineSeries::new(points(train), &BLUE))
            .map_err(Error::plot)?
            .label(format!("Training {y_desc}"))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
        chart
            .draw_series(LineSeries::new(points(val), &RED))
            .map_err(Error::plot)?
            .label(format!("Validation {y_desc}"))
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()
            .map_err(Error::plot)?;
    }

    root.present().map_err(Error::plot)?;
    info!("training curves saved to {}", output.display());
    Ok(())
}

/// Annotated heat map, true labels on the y axis.
pub fn plot_confusion_matrix(cm: &ConfusionMatrix, title: &str, output: &Path) -> Result<()> {
    let n = cm.class_names.len() as i32;
    if n == 0 {
        return Err(Error::InvalidParameter("confusion matrix has no classes".into()));
    }
    let max_count = cm.max_count().max(1) as f32;

    let root = BitMapBackend::new(output, (900, 750)).into_drawing_area();
    root.fill(&WHITE).map_err(Error::plot)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(110)
        .build_cartesian_2d((0..n).into_segmented(), (0..n).into_segmented())
        .map_err(Error::plot)?;

    // row 0 is drawn at the top
    let name_at = |value: &SegmentValue<i32>, flip: bool| match value {
        SegmentValue::CenterOf(i) => {
            let idx = if flip { n - 1 - i } else { *i };
            cm.class_names
                .get(idx as usize)
                .cloned()
                .unwrap_or_default()
        }
        _ => String::new(),
    };
    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(n as usize)
        .y_labels(n as usize)
        .x_label_formatter(&|v| name_at(v, false))
        .y_label_formatter(&|v| name_at(v, true))
        .x_desc("Predicted Label")
        .y_desc("True Label")
        .draw()
        .map_err(Error::plot)?;

    let cells: Vec<(i32, i32, usize)> = cm
        .counts
        .indexed_iter()
        .map(|((t, p), &count)| (p as i32, n - 1 - t as i32, count))
        .collect();

    chart
        .draw_series(cells.iter().map(|&(x, y, count)| {
            Rectangle::new(
                [
                    (SegmentValue::Exact(x), SegmentValue::Exact(y)),
                    (SegmentValue::Exact(x + 1), SegmentValue::Exact(y + 1)),
                ],
                blues(count as f32 / max_count).filled(),
            )
        }))
        .map_err(Error::plot)?;

    let centered = Pos::new(HPos::Center, VPos::Center);
    chart
        .draw_series(cells.iter().map(|&(x, y, count)| {
            let shade = count as f32 / max_count;
            let color = if shade > 0.5 { WHITE } else { BLACK };
            Text::new(
                count.to_string(),
                (SegmentValue::CenterOf(x), SegmentValue::CenterOf(y)),
                ("sans-serif", 18).into_font().color(&color).pos(centered),
            )
        }))
        .map_err(Error::plot)?;

    root.present().map_err(Error::plot)?;
    info!("confusion matrix saved to {}", output.display());
    Ok(())
}

fn plot_path(out_dir: &Path, class: CryClass, kind: &str) -> PathBuf {
    out_dir.join(format!("{}_{kind}.png", class.as_str()))
}

/// Original waveform overlaid with its noisy version.
pub fn visualize_audio_with_noise<R: Rng + ?Sized>(
    audio_file: &Path,
    class: CryClass,
    features: &FeatureConfig,
    noise_factor: f32,
    out_dir: &Path,
    rng: &mut R,
) -> Result<PathBuf> {
    let audio = load_audio(audio_file, features.sample_rate, features.fixed_length)?;
    let noisy = add_noise(&audio.samples, noise_factor, rng)?;

    let output = plot_path(out_dir, class, "noise");
    plot_waveforms(
        &audio.samples,
        &noisy,
        audio.sample_rate,
        "Noisy Audio",
        &format!("Audio Visualization ({class})"),
        &output,
    )?;
    Ok(output)
}

pub fn visualize_spectrogram(
    audio_file: &Path,
    class: CryClass,
    features: &FeatureConfig,
    out_dir: &Path,
) -> Result<PathBuf> {
    let audio = load_audio(audio_file, features.sample_rate, features.fixed_length)?;
    let mel_db = mel_spectrogram_db(&audio.samples, audio.sample_rate, features);

    let output = plot_path(out_dir, class, "spectrogram");
    plot_mel_spectrogram(
        &mel_db,
        audio.sample_rate,
        features.hop_length,
        &format!("Spectrogram ({class})"),
        &output,
    )?;
    Ok(output)
}

/// Parses the augmentation names accepted for waveform comparison plots.
pub fn waveform_augmentation(augment_type: &str) -> Result<Augmentation> {
    match augment_type.parse()? {
        aug @ (Augmentation::PitchShift | Augmentation::TimeStretch) => Ok(aug),
        Augmentation::Noise => Err(Error::UnknownAugmentation(augment_type.to_string())),
    }
}

/// Original waveform overlaid with a pitch-shifted or time-stretched copy.
pub fn visualize_audio_with_augmentation<R: Rng + ?Sized>(
    audio_file: &Path,
    class: CryClass,
    augment_type: &str,
    features: &FeatureConfig,
    augment: &AugmentConfig,
    out_dir: &Path,
    rng: &mut R,
) -> Result<PathBuf> {
    let aug = waveform_augmentation(augment_type)?;
    let audio = load_audio(audio_file, features.sample_rate, features.fixed_length)?;
    let augmented = aug.apply(&audio.samples, audio.sample_rate, augment, rng)?;

    let label = capitalize(aug.as_str());
    let output = plot_path(out_dir, class, aug.as_str());
    plot_waveforms(
        &audio.samples,
        &augmented,
        audio.sample_rate,
        &format!("{label} Audio"),
        &format!("Audio Visualization ({class}) - {label}"),
        &output,
    )?;
    Ok(output)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
