use crate::{
    predict, train, Backbone, CancelToken, ModelConfig, PredictConfig, TrainingConfig,
};
use anyhow::{Context as _, Result};
use burn::{backend::Autodiff, optim::AdamWConfig, prelude::Backend};
use clap::{CommandFactory as _, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(subcommand)]
    subcmd: SubCmd,
}

#[derive(Debug, Subcommand)]
enum SubCmd {
    /// Train a mask, gender and age classifier on the train split of a manifest.
    Train {
        /// Backbone of the classifier
        #[arg(short, long, default_value = Backbone::default())]
        model: Backbone,
        /// Start the backbone from ImageNet weights (ResNet only)
        #[arg(long)]
        pretrained: bool,
        /// Root directory of the subject image folders
        #[arg(short, long)]
        image_root: PathBuf,
        /// Training manifest csv
        #[arg(short = 'd', long)]
        manifest: PathBuf,
        /// Directory to save artifacts (The directory will be recreated if it exists)
        #[arg(short, long, default_value = "maskcls_artifact")]
        artifact_dir: PathBuf,
        /// Fraction of the subjects used for training, the rest validates
        #[arg(short = 'r', long, default_value = "0.8")]
        split_rate: f64,
        #[arg(short = 'e', long, default_value = "30")]
        num_epochs: usize,
        #[arg(short, long, default_value = "64")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
        /// Learning rate for the optimizer, decreasing to 1/10 of the given value
        #[arg(short, long, default_value = "1.0e-3")]
        learning_rate: f64,
        /// Number of epochs without validation loss improvement before stopping
        #[arg(long, default_value = "10")]
        early_stopping: usize,
        /// Random seed for the split, the shuffles and the augmentation
        #[arg(short, long, default_value = "41")]
        seed: u64,
        /// Train against smoothed targets
        #[arg(long)]
        soft_label: bool,
        /// Dropout probability of the classifier head
        #[arg(long, default_value = "0.0")]
        dropout: f64,
        /// Number of dropout samples averaged by the classifier head
        #[arg(long, default_value = "1")]
        dropout_samples: usize,
        /// Disable random flip, rotation and brightness on training images
        #[arg(long)]
        no_augment: bool,
        /// Log progress instead of drawing the terminal dashboard
        #[arg(long)]
        no_tui: bool,
    },
    /// Predict the class of every image of an inference manifest
    Predict {
        /// Artifact directory produced by `train`, the submission is written there
        #[arg(short, long)]
        checkpoint_dir: PathBuf,
        /// Directory the `ImageID` column is relative to
        #[arg(short, long)]
        image_root: PathBuf,
        /// Inference manifest csv with an `ImageID` column
        #[arg(short = 'd', long)]
        manifest: PathBuf,
        #[arg(short, long, default_value = "64")]
        batch_size: usize,
        /// Number of workers for data loading
        #[arg(short = 'w', long, default_value = "4")]
        num_workers: usize,
    },
    /// generate auto completion script
    GenCompletion {
        /// shell name
        shell: Shell,
    },
}

#[cfg(feature = "tch")]
type MyBackend = burn::backend::LibTorch<f32, i8>;
#[cfg(all(feature = "candle", not(feature = "tch")))]
type MyBackend = burn::backend::Candle<f32, u8>;
#[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
type MyBackend = burn::backend::NdArray<f32>;

type MyAutodiffBackend = Autodiff<MyBackend>;

fn device() -> <MyBackend as Backend>::Device {
    #[cfg(all(feature = "tch", target_os = "macos"))]
    let device = burn::backend::libtorch::LibTorchDevice::Mps;
    #[cfg(all(feature = "tch", not(target_os = "macos")))]
    let device = burn::backend::libtorch::LibTorchDevice::Cuda(0);

    #[cfg(all(feature = "candle", not(feature = "tch"), target_os = "macos"))]
    let device = burn::backend::candle::CandleDevice::Metal(0);
    #[cfg(all(feature = "candle", not(feature = "tch"), not(target_os = "macos")))]
    let device = burn::backend::candle::CandleDevice::Cuda(0);

    #[cfg(all(feature = "ndarray", not(any(feature = "tch", feature = "candle"))))]
    let device = burn::backend::ndarray::NdArrayDevice::Cpu;

    device
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

pub fn run() -> Result<()> {
    let args = Cli::parse();
    if !matches!(args.subcmd, SubCmd::GenCompletion { .. }) {
        init_tracing();
    }
    match args.subcmd {
        SubCmd::Train {
            model,
            pretrained,
            image_root,
            manifest,
            artifact_dir,
            split_rate,
            num_epochs,
            batch_size,
            num_workers,
            learning_rate,
            early_stopping,
            seed,
            soft_label,
            dropout,
            dropout_samples,
            no_augment,
            no_tui,
        } => {
            train::<MyAutodiffBackend>(
                artifact_dir,
                TrainingConfig::new(
                    ModelConfig::new(model)
                        .with_pretrained(pretrained)
                        .with_dropout(dropout)
                        .with_dropout_samples(dropout_samples),
                    AdamWConfig::new(),
                    image_root,
                    manifest,
                )
                .with_split_rate(split_rate)
                .with_num_epochs(num_epochs)
                .with_batch_size(batch_size)
                .with_num_workers(num_workers)
                .with_learning_rate(learning_rate)
                .with_early_stopping(early_stopping)
                .with_seed(seed)
                .with_augment(!no_augment)
                .with_soft_label(soft_label)
                .with_tui(!no_tui),
                device(),
            )
            .context("training failed")?;
        }
        SubCmd::Predict {
            checkpoint_dir,
            image_root,
            manifest,
            batch_size,
            num_workers,
        } => {
            let submission = predict::<MyBackend>(
                PredictConfig::new(checkpoint_dir, image_root, manifest)
                    .with_batch_size(batch_size)
                    .with_num_workers(num_workers),
                device(),
                &CancelToken::new(),
            )
            .context("inference failed")?;
            println!("{}", submission.display());
        }
        SubCmd::GenCompletion { shell } => {
            generate(shell, &mut Cli::command(), "maskcls", &mut std::io::stdout());
        }
    }
    Ok(())
}
