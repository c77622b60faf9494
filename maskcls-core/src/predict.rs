use crate::{
    data::{InferenceBatch, InferenceBatcher, LoadFailure, MaskDataset},
    error::{Error, Result},
    manifest::ManifestTable,
    model::Classifier,
    train::{TrainingConfig, MODEL_FILE},
};
use burn::{
    config::Config,
    data::dataloader::{DataLoaderBuilder, Dataset},
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, info};

/// Column appended to the manifest in the submission file.
pub const ANSWER_COLUMN: &str = "ans";
pub const SUBMISSION_FILE: &str = "submission.csv";

#[derive(Config, Debug)]
pub struct PredictConfig {
    /// Directory holding the training config and the model record
    checkpoint_dir: PathBuf,
    image_root: PathBuf,
    manifest: PathBuf,
    #[config(default = 64)]
    batch_size: usize,
    #[config(default = 4)]
    num_workers: usize,
}

/// Cooperative cancellation, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Index of the highest score, the first one on ties.
pub fn argmax(scores: &[f32]) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &score)| {
            if score > max {
                (i, score)
            } else {
                (best, max)
            }
        })
        .0
}

/// Runs `classifier` over every batch and returns one class per dataset index.
///
/// Batches may arrive in any order, each prediction is stored at the index carried by its batch.
/// The first batch with an image that failed to load ends the run with [`Error::Image`].
pub fn collect_predictions<B, C, I>(
    batches: I,
    classifier: &C,
    total: usize,
    cancel: &CancelToken,
) -> Result<Vec<usize>>
where
    B: Backend,
    C: Classifier<B>,
    I: IntoIterator<Item = std::result::Result<InferenceBatch<B>, LoadFailure>>,
{
    let mut predictions = vec![None; total];
    let mut completed = 0;
    for batch in batches {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { completed, total });
        }
        let batch = batch?;
        let size = batch.indices.len();
        let scores = classifier.infer(batch.images)?;
        let [rows, classes] = scores.dims();
        if rows != size || classes == 0 {
            return Err(Error::Classifier(format!(
                "expected {size} score rows, got shape [{rows}, {classes}]"
            )));
        }
        let scores = scores
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| Error::Classifier(format!("{err:?}")))?;
        for (index, row) in batch.indices.into_iter().zip(scores.chunks(classes)) {
            let slot = predictions
                .get_mut(index)
                .ok_or(Error::IndexOutOfRange { index, len: total })?;
            *slot = Some(argmax(row));
        }
        completed += size;
        debug!("predicted {completed}/{total}");
    }
    predictions
        .into_iter()
        .enumerate()
        .map(|(index, prediction)| {
            prediction.ok_or_else(|| Error::Classifier(format!("no prediction for sample {index}")))
        })
        .collect()
}

/// Writes `manifest` with an extra [`ANSWER_COLUMN`] to `destination`.
pub fn write_submission(manifest: &Path, predictions: &[usize], destination: &Path) -> Result<()> {
    ManifestTable::read(manifest)?
        .with_column(ANSWER_COLUMN, predictions)?
        .write(destination)
}

/// Predicts every image of the manifest and returns the path of the submission file.
pub fn predict<B: Backend>(
    config: PredictConfig,
    device: B::Device,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let training = TrainingConfig::load_from(&config.checkpoint_dir)?;
    let model_path = config.checkpoint_dir.join(MODEL_FILE);
    let record = CompactRecorder::new()
        .load(model_path.clone(), &device)
        .map_err(|err| Error::Checkpoint {
            path: model_path,
            reason: err.to_string(),
        })?;
    let model = training.model.init::<B>(&device).load_record(record);

    let dataset = MaskDataset::predict(
        &config.image_root,
        &config.manifest,
        Some(Arc::new(training.transform.init())),
    )?;
    let total = dataset.len();
    let dataloader = DataLoaderBuilder::new(InferenceBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(dataset);

    let predictions = collect_predictions(dataloader.iter(), &model, total, cancel)?;

    let destination = config.checkpoint_dir.join(SUBMISSION_FILE);
    write_submission(&config.manifest, &predictions, &destination)?;
    info!(
        "wrote {} predictions to {}",
        predictions.len(),
        destination.display()
    );
    Ok(destination)
}
