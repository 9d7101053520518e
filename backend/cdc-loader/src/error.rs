use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoaderError>;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Properties error: {0}")]
    Properties(String),

    /// A change-event handle could not be read on the engine thread
    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Load error: {0}")]
    Load(String),

    /// The queue between engine and consumer can no longer deliver batches
    #[error("Change queue closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoaderError {
    /// Only a dead queue stops the consumer loop; everything else is per batch.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoaderError::QueueClosed)
    }
}

impl From<envy::Error> for LoaderError {
    fn from(err: envy::Error) -> Self {
        LoaderError::Config(err.to_string())
    }
}
