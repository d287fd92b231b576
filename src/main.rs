use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use cry_classifier::config::PipelineConfig;
use cry_classifier::persist::TrainedModel;
use cry_classifier::pipeline::{run_training, RunPaths};

#[derive(Parser)]
#[command(version, about = "Classify infant cries from WAV recordings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the dataset, train the network and save it
    Train {
        /// Directory with one subdirectory of .wav files per class
        #[arg(long)]
        data: PathBuf,
        /// Where plots are written
        #[arg(long, default_value = "output")]
        out: PathBuf,
        /// Weights file; metadata goes to the same name with a .json extension
        #[arg(long, default_value = "baby_cry_model.safetensors")]
        model: PathBuf,
        /// JSON file overriding the default parameters
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        no_augment: bool,
        #[arg(long)]
        no_plots: bool,
    },
    /// Predict the class of a single recording
    Classify {
        #[arg(long)]
        model: PathBuf,
        wav: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Train {
            data,
            out,
            model,
            config,
            no_augment,
            no_plots,
        } => {
            let mut pipeline_config = match &config {
                Some(path) => PipelineConfig::from_json_file(path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => PipelineConfig::default(),
            };
            if no_augment {
                pipeline_config.augment = false;
            }

            let paths = RunPaths {
                data_dir: data,
                out_dir: out,
                model_path: model,
            };
            let summary = run_training(&paths, &pipeline_config, !no_plots)
                .context("training failed")?;
            let scores = &summary.evaluation;

            println!("Dataset rows: {}", summary.rows);
            println!(
                "Test loss: {:.4}, test accuracy: {:.2}",
                scores.test_loss, scores.test_accuracy
            );
            println!("\nTraining data classification report:\n{}", scores.train_report);
            println!("Training data confusion matrix:\n{}", scores.train_confusion);
            println!("Testing data classification report:\n{}", scores.test_report);
            println!("Testing data confusion matrix:\n{}", scores.test_confusion);
            for plot in &summary.plots {
                info!("wrote {}", plot.display());
            }
        }
        Command::Classify { model, wav } => {
            let trained = TrainedModel::load(&model)
                .with_context(|| format!("loading model {}", model.display()))?;
            let prediction = trained
                .classify_file(&wav)
                .with_context(|| format!("classifying {}", wav.display()))?;
            println!(
                "{}: {} ({:.2})",
                wav.display(),
                prediction.class,
                prediction.confidence()
            );
            for (class, p) in trained.classes.iter().zip(&prediction.probabilities) {
                println!("  {class:>16} {p:.4}");
            }
        }
    }
    Ok(())
}
