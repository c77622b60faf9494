use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("malformed manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("index {index} out of range for a dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("failed to load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: Arc<image::ImageError>,
    },

    #[error("failed to load checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    #[error("classifier failed: {0}")]
    Classifier(String),

    #[error("inference cancelled after {completed} of {total} samples")]
    Cancelled { completed: usize, total: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

impl Error {
    /// Whether the error comes from malformed input or configuration rather than the environment.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidLabel(_) | Error::Manifest { .. } | Error::Config(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
