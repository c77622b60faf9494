use crate::{
    data::{DatasetConfig, MaskBatcher, Split},
    error::{Error, Result},
    model::ModelConfig,
    transform::{Transform, TransformConfig},
};
use burn::{
    data::dataloader::{DataLoaderBuilder, Dataset},
    lr_scheduler::linear::LinearLrSchedulerConfig,
    optim::AdamWConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{
            store::{Aggregate, Direction, Split as MetricSplit},
            AccuracyMetric, LearningRateMetric, LossMetric,
        },
        renderer::{MetricState, MetricsRenderer, TrainingProgress},
        LearnerBuilder, MetricEarlyStoppingStrategy, StoppingCondition,
    },
};
use std::{path::Path, path::PathBuf, sync::Arc};
use tracing::{debug, info};

/// Saved next to the model so that prediction can rebuild it.
pub const CONFIG_FILE: &str = "config.json";
/// Record name, the recorder appends its own extension.
pub const MODEL_FILE: &str = "model";

#[derive(Config)]
pub struct TrainingConfig {
    pub(crate) model: ModelConfig,
    optimizer: AdamWConfig,
    image_root: PathBuf,
    manifest: PathBuf,
    #[config(default = "TransformConfig::new()")]
    pub(crate) transform: TransformConfig,
    #[config(default = 0.8)]
    split_rate: f64,
    #[config(default = 30)]
    num_epochs: usize,
    #[config(default = 64)]
    batch_size: usize,
    #[config(default = 4)]
    num_workers: usize,
    #[config(default = 41)]
    seed: u64,
    #[config(default = 1.0e-3)]
    learning_rate: f64,
    #[config(default = 10)]
    early_stopping: usize,
    /// Random flip, rotation and brightness on the train split
    #[config(default = true)]
    augment: bool,
    /// Train against smoothed targets
    #[config(default = false)]
    soft_label: bool,
    /// Draw the terminal dashboard, progress goes to the log otherwise
    #[config(default = true)]
    tui: bool,
}

impl TrainingConfig {
    fn dataset(&self, split: Split) -> DatasetConfig {
        DatasetConfig::new(self.image_root.clone(), self.manifest.clone(), split)
            .with_split_rate(self.split_rate)
            .with_seed(self.seed)
            .with_soft_label(self.soft_label)
    }

    pub fn load_from(artifact_dir: &Path) -> Result<Self> {
        let path = artifact_dir.join(CONFIG_FILE);
        Self::load(&path).map_err(|err| Error::Checkpoint {
            path,
            reason: err.to_string(),
        })
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    // Remove existing artifacts before to get an accurate learner summary
    std::fs::remove_dir_all(artifact_dir).ok();
    std::fs::create_dir_all(artifact_dir)?;
    Ok(())
}

/// Reports training progress through `tracing`, for runs without a terminal.
struct LogRenderer;

impl LogRenderer {
    fn metric(split: &str, state: MetricState) {
        let entry = match state {
            MetricState::Generic(entry) | MetricState::Numeric(entry, _) => entry,
        };
        debug!("{split} {}: {}", entry.name, entry.formatted);
    }

    fn progress(split: &str, item: TrainingProgress) {
        debug!(
            "{split} epoch {}/{} iteration {} ({}/{} items)",
            item.epoch,
            item.epoch_total,
            item.iteration,
            item.progress.items_processed,
            item.progress.items_total
        );
    }
}

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, state: MetricState) {
        Self::metric("train", state);
    }

    fn update_valid(&mut self, state: MetricState) {
        Self::metric("valid", state);
    }

    fn render_train(&mut self, item: TrainingProgress) {
        Self::progress("train", item);
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        Self::progress("valid", item);
    }
}

/// Learning rate scheduler steps over the whole run.
fn scheduler_iterations(samples: usize, batch_size: usize, num_epochs: usize) -> usize {
    (samples.div_ceil(batch_size.max(1)) * num_epochs).max(1)
}

pub fn train<B: AutodiffBackend>(
    artifact_dir: PathBuf,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    create_artifact_dir(&artifact_dir)?;

    B::seed(config.seed);

    config.save(artifact_dir.join(CONFIG_FILE))?;

    let train_transform: Arc<dyn Transform> = if config.augment {
        Arc::new(config.transform.init_augmented(config.seed))
    } else {
        Arc::new(config.transform.init())
    };
    let dataset_train = config.dataset(Split::Train).init(Some(train_transform))?;
    let dataset_valid = config
        .dataset(Split::Validation)
        .init(Some(Arc::new(config.transform.init())))?;
    if dataset_train.is_empty() || dataset_valid.is_empty() {
        return Err(Error::Config(format!(
            "split rate {} leaves {} train and {} validation samples",
            config.split_rate,
            dataset_train.len(),
            dataset_valid.len()
        )));
    }
    info!(
        "training {:?} on {} samples, validating on {}",
        config.model.backbone(),
        dataset_train.len(),
        dataset_valid.len()
    );
    let iterations =
        scheduler_iterations(dataset_train.len(), config.batch_size, config.num_epochs);

    let model = config
        .model
        .init_pretrained::<B>(&device)?
        .with_soft_label(dataset_train.is_soft_label(), &device);

    let batcher_train = MaskBatcher::<B>::new(device.clone());
    let batcher_valid = MaskBatcher::<B::InnerBackend>::new(device.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_train);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset_valid);

    let builder = LearnerBuilder::new(&artifact_dir)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_train(LearningRateMetric::new())
        .early_stopping(MetricEarlyStoppingStrategy::new::<LossMetric<B>>(
            Aggregate::Mean,
            Direction::Lowest,
            MetricSplit::Valid,
            StoppingCondition::NoImprovementSince {
                n_epochs: config.early_stopping,
            },
        ))
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary();
    let builder = if config.tui {
        builder
    } else {
        builder.renderer(LogRenderer)
    };
    let learner = builder.build(
        model,
        config.optimizer.init(),
        LinearLrSchedulerConfig::new(
            config.learning_rate,
            config.learning_rate / 10.,
            iterations,
        )
        .init(),
    );

    let model_trained = learner.fit(dataloader_train, dataloader_valid);

    let model_path = artifact_dir.join(MODEL_FILE);
    model_trained
        .save_file(&model_path, &CompactRecorder::new())
        .map_err(|err| Error::Checkpoint {
            path: model_path.clone(),
            reason: err.to_string(),
        })?;
    info!("saved trained model to {}", model_path.display());
    Ok(())
}
