#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
mod cli;
mod data;
mod error;
#[cfg(test)]
mod fixtures;
mod label;
mod manifest;
mod model;
mod predict;
mod train;
mod transform;

#[cfg(any(feature = "ndarray", feature = "tch", feature = "candle"))]
pub use cli::run;
pub use data::{
    DatasetConfig, InferenceBatch, InferenceBatcher, LoadFailure, LoadedItem, MaskBatch,
    MaskBatcher, MaskDataset, MaskItem, Split,
};
pub use error::{Error, Result};
pub use label::{
    derive_samples, discover_images, label_records, AgeBucket, Gender, ImageSample, Labels,
    MaskStatus, NUM_CLASSES,
};
pub use manifest::{
    read_image_ids, read_records, ManifestLayout, ManifestRecord, ManifestTable, IMAGE_ID_COLUMN,
};
pub use model::{Backbone, BaseCnn, Classifier, MaskModel, ModelConfig};
pub use predict::{
    argmax, collect_predictions, predict, write_submission, CancelToken, PredictConfig,
    ANSWER_COLUMN, SUBMISSION_FILE,
};
pub use train::{train, TrainingConfig, CONFIG_FILE, MODEL_FILE};
pub use transform::{
    to_tensor, AugmentTransform, ImageTensor, StandardTransform, Transform, TransformConfig,
};
