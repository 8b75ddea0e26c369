use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupted journal {key}: {reason}")]
    CorruptedJournal { key: String, reason: String },

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
}

impl From<opendal::Error> for StorageError {
    fn from(e: opendal::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}
