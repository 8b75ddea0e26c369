use thiserror::Error;
use wellstore_storage::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

/// ErrorKind is the stable classification of an [`Error`]. The protocol
/// layer maps each kind to its own numeric result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RowShapeMismatch,
    DuplicateColumnIdentifier,
    BadColumnIdentifier,
    IndexColumnMissing,
    IndexNotFirstColumn,
    DuplicateIndexInBatch,
    MixedIndexTypes,
    MissingUnitForChannel,
    MaxPointsExceeded,
    MaxNodesExceeded,
    ChildIdentifierNotUnique,
    RequiredFieldEmpty,
    ObjectNotFound,
    ObjectAlreadyExists,
    ConcurrentModificationTimeout,
    InvalidChannelValue,
    InvalidDelimiter,
    UnitCountMismatch,
    DirectionMismatch,
    TooManyChannels,
    InvalidConfig,
    Storage,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("row {row} has {actual} values, expected {expected}")]
    RowShapeMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate column identifier {0:?}")]
    DuplicateColumnIdentifier(String),

    #[error("bad identifier {0:?}")]
    BadColumnIdentifier(String),

    #[error("index channel {0:?} missing from column list")]
    IndexColumnMissing(String),

    #[error("index channel {0:?} must be the first column")]
    IndexNotFirstColumn(String),

    #[error("index value {0} appears more than once in the batch")]
    DuplicateIndexInBatch(String),

    #[error("index value {value:?} is not a {expected} index")]
    MixedIndexTypes { value: String, expected: String },

    #[error("channel {0:?} has no unit")]
    MissingUnitForChannel(String),

    #[error("request carries {points} data points, limit is {limit}")]
    MaxPointsExceeded { points: usize, limit: usize },

    #[error("request carries {nodes} rows, limit is {limit}")]
    MaxNodesExceeded { nodes: usize, limit: usize },

    #[error("channel mnemonic {0:?} is not unique")]
    ChildIdentifierNotUnique(String),

    #[error("required field {0} is empty")]
    RequiredFieldEmpty(String),

    #[error("object {0} not found")]
    ObjectNotFound(String),

    #[error("object {0} already exists")]
    ObjectAlreadyExists(String),

    #[error("timed out waiting for exclusive access to {0}")]
    ConcurrentModificationTimeout(String),

    #[error("value {value:?} is not valid for channel {channel:?}")]
    InvalidChannelValue { channel: String, value: String },

    #[error("invalid delimiter or null indicator: {0}")]
    InvalidDelimiter(String),

    #[error("{units} units supplied for {columns} columns")]
    UnitCountMismatch { units: usize, columns: usize },

    #[error("request direction {requested} does not match log direction {actual}")]
    DirectionMismatch { requested: String, actual: String },

    #[error("log would carry {count} channels, limit is {limit}")]
    TooManyChannels { count: usize, limit: usize },

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("corrupted record {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RowShapeMismatch { .. } => ErrorKind::RowShapeMismatch,
            Self::DuplicateColumnIdentifier(_) => ErrorKind::DuplicateColumnIdentifier,
            Self::BadColumnIdentifier(_) => ErrorKind::BadColumnIdentifier,
            Self::IndexColumnMissing(_) => ErrorKind::IndexColumnMissing,
            Self::IndexNotFirstColumn(_) => ErrorKind::IndexNotFirstColumn,
            Self::DuplicateIndexInBatch(_) => ErrorKind::DuplicateIndexInBatch,
            Self::MixedIndexTypes { .. } => ErrorKind::MixedIndexTypes,
            Self::MissingUnitForChannel(_) => ErrorKind::MissingUnitForChannel,
            Self::MaxPointsExceeded { .. } => ErrorKind::MaxPointsExceeded,
            Self::MaxNodesExceeded { .. } => ErrorKind::MaxNodesExceeded,
            Self::ChildIdentifierNotUnique(_) => ErrorKind::ChildIdentifierNotUnique,
            Self::RequiredFieldEmpty(_) => ErrorKind::RequiredFieldEmpty,
            Self::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            Self::ObjectAlreadyExists(_) => ErrorKind::ObjectAlreadyExists,
            Self::ConcurrentModificationTimeout(_) => ErrorKind::ConcurrentModificationTimeout,
            Self::InvalidChannelValue { .. } => ErrorKind::InvalidChannelValue,
            Self::InvalidDelimiter(_) => ErrorKind::InvalidDelimiter,
            Self::UnitCountMismatch { .. } => ErrorKind::UnitCountMismatch,
            Self::DirectionMismatch { .. } => ErrorKind::DirectionMismatch,
            Self::TooManyChannels { .. } => ErrorKind::TooManyChannels,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Storage(_) | Self::Corrupted { .. } => ErrorKind::Storage,
        }
    }

    /// is_retryable reports whether the same request may succeed when resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::ConcurrentModificationTimeout(_)
        )
    }

    pub(crate) fn corrupted(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupted {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
