use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use read_origin_nn::device::gpu_report;
use read_origin_nn::logging::{self, LogConfig};
use read_origin_nn::{predict, train, PredictConfig, TrainConfig};

#[derive(Parser)]
#[command(name = "read-origin-nn")]
#[command(about = "Classify sequencing reads by origin with a hybrid CNN/BiLSTM network")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(short = 'v', long, global = true, default_value = "false", help = "Verbose output (debug logs)")]
    verbose: bool,

    #[arg(long, global = true, help = "Write logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Train the neural network.
    Train {
        /// Input FASTQ files (named `<name>__<label>.fastq[.gz]`), followed by the output weights path
        #[arg(required = true, num_args = 2..)]
        paths: Vec<PathBuf>,

        #[arg(long, help = "Path to alignment data (read_id,chromosome,start,end)")]
        alignment_data: Option<PathBuf>,

        #[arg(long, default_value = "10", help = "Number of epochs for training")]
        epochs: usize,

        #[arg(long, default_value = "32", help = "Batch size for training")]
        batch_size: usize,

        #[arg(long, default_value = "false", help = "Replicate training across all visible GPUs")]
        multi_gpu: bool,
    },

    /// Predict classes for the input sequences.
    Predict {
        /// Path to the model weights
        model_weights: PathBuf,

        /// Input FASTQ files
        #[arg(required = true)]
        fastq_files: Vec<PathBuf>,

        #[arg(long, help = "Path to alignment data (read_id,chromosome,start,end)")]
        alignment_data: Option<PathBuf>,
    },

    /// Report accelerator support and visible GPUs.
    CheckGpu,
}

fn main() -> Result<()> {
    let args = Args::parse();

    logging::init(&LogConfig {
        level: if args.verbose { "debug" } else { "info" }.to_string(),
        log_file: args.log_file.clone(),
    })?;

    match args.command {
        Command::Train {
            mut paths,
            alignment_data,
            epochs,
            batch_size,
            multi_gpu,
        } => {
            // 最后一个路径是模型权重输出
            let Some(model_weights) = paths.pop() else {
                bail!("Missing model weights path");
            };
            if batch_size == 0 {
                bail!("Batch size must be at least 1");
            }
            let config = TrainConfig {
                epochs,
                batch_size,
                multi_gpu,
                ..Default::default()
            };
            let report = train(&paths, &model_weights, alignment_data.as_deref(), &config)
                .context("Training failed")?;

            println!("Training complete!");
            println!("Epochs run: {}", report.epochs_run());
            if let Some(acc) = report.val_accuracy {
                println!("Final Validation Accuracy: {:.2}%", acc * 100.0);
            }
            if let Some(acc) = report.test_accuracy {
                println!("Test Accuracy: {:.2}%", acc * 100.0);
            }
            println!("Model weights: {}", model_weights.display());
        }
        Command::Predict {
            model_weights,
            fastq_files,
            alignment_data,
        } => {
            let predictions = predict(
                &model_weights,
                &fastq_files,
                alignment_data.as_deref(),
                &PredictConfig::default(),
            )
            .context("Prediction failed")?;

            for prediction in predictions {
                println!("\n{prediction}");
            }
        }
        Command::CheckGpu => {
            println!("{}", gpu_report());
        }
    }

    Ok(())
}
