use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("corpus root {0} does not exist or is not a directory")]
    MissingCorpus(PathBuf),
    #[error("index destination {path} is not writable: {source}")]
    UnwritableDestination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("corrupt index: {0}")]
    Corrupt(String),
    #[error("index build interrupted")]
    Interrupted,
}

impl IndexError {
    /// Errors the operator has to fix before a build can start.
    pub fn is_configuration(&self) -> bool {
        matches!(self, IndexError::MissingCorpus(_) | IndexError::UnwritableDestination { .. })
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
