//! End-to-end training run: dataset, plots, training, persistence.

use std::path::{Path, PathBuf};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{CryClass, PipelineConfig};
use crate::dataset::{build_dataset, count_class_files, wav_files};
use crate::error::{Error, Result};
use crate::models::{train_model, Evaluation, History, TrainingOutcome};
use crate::persist::{metadata_path, TrainedModel};
use crate::show;

/// Where a training run reads from and writes to.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub model_path: PathBuf,
}

#[derive(Debug)]
pub struct RunSummary {
    pub file_counts: Vec<(CryClass, usize)>,
    pub rows: usize,
    pub evaluation: Evaluation,
    pub model: TrainedModel,
    pub plots: Vec<PathBuf>,
}

/// Waveform and spectrogram plots for the first recording of each class.
fn plot_class_examples(
    paths: &RunPaths,
    config: &PipelineConfig,
    rng: &mut StdRng,
) -> Result<Vec<PathBuf>> {
    let mut plots = Vec::new();
    for &class in &config.classes {
        let Some(audio_file) = wav_files(&paths.data_dir.join(class.as_str()))?.into_iter().next()
        else {
            warn!("class {class} has no recordings to plot");
            continue;
        };

        plots.push(show::visualize_audio_with_noise(
            &audio_file,
            class,
            &config.features,
            config.augmentation.noise_factor,
            &paths.out_dir,
            rng,
        )?);
        plots.push(show::visualize_spectrogram(
            &audio_file,
            class,
            &config.features,
            &paths.out_dir,
        )?);
        for augment_type in ["pitch_shift", "time_stretch"] {
            info!("visualizing {class} with {augment_type} augmentation");
            plots.push(show::visualize_audio_with_augmentation(
                &audio_file,
                class,
                augment_type,
                &config.features,
                &config.augmentation,
                &paths.out_dir,
                rng,
            )?);
        }
    }
    Ok(plots)
}

fn plot_training(
    history: &History,
    evaluation: &Evaluation,
    out_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let curves = out_dir.join("training_history.png");
    show::plot_history(history, &curves)?;

    let train_cm = out_dir.join("confusion_train.png");
    show::plot_confusion_matrix(
        &evaluation.train_confusion,
        "Training Data Confusion Matrix",
        &train_cm,
    )?;
    let test_cm = out_dir.join("confusion_test.png");
    show::plot_confusion_matrix(
        &evaluation.test_confusion,
        "Testing Data Confusion Matrix",
        &test_cm,
    )?;
    Ok(vec![curves, train_cm, test_cm])
}

/// Builds the dataset, trains the network and saves the weights to
/// `paths.model_path` with metadata in its `.json` sibling. Plots are
/// written to `paths.out_dir` when `plots` is set.
pub fn run_training(paths: &RunPaths, config: &PipelineConfig, plots: bool) -> Result<RunSummary> {
    config.validate()?;
    metadata_path(&paths.model_path)?;

    let file_counts = count_class_files(&paths.data_dir, &config.classes)?;
    for (class, count) in &file_counts {
        info!("{class} contains {count} audio files");
    }

    let mut rng = StdRng::seed_from_u64(config.training.seed);
    let dataset = build_dataset(
        &paths.data_dir,
        &config.classes,
        config.augment,
        &config.features,
        &config.augmentation,
        &mut rng,
    )?;
    if dataset.is_empty() {
        return Err(Error::InvalidDataset(format!(
            "no .wav files found under {}",
            paths.data_dir.display()
        )));
    }

    let mut written = Vec::new();
    if plots {
        std::fs::create_dir_all(&paths.out_dir).map_err(|e| Error::io(&paths.out_dir, e))?;
        written.extend(plot_class_examples(paths, config, &mut rng)?);
    }

    let class_names: Vec<String> = config.classes.iter().map(|c| c.to_string()).collect();
    let TrainingOutcome {
        network,
        history,
        evaluation,
    } = train_model(&dataset, &class_names, &config.network, &config.training)?;

    if plots {
        written.extend(plot_training(&history, &evaluation, &paths.out_dir)?);
    }

    let model = TrainedModel {
        classes: config.classes.clone(),
        features: config.features.clone(),
        network,
        history,
    };
    if let Some(parent) = paths.model_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    model.save(&paths.model_path)?;

    Ok(RunSummary {
        file_counts,
        rows: dataset.len(),
        evaluation,
        model,
        plots: written,
    })
}
