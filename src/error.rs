use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction failed for {}: {message}", .path.display())]
    Extraction { path: PathBuf, message: String },

    #[error("model runtime unreachable at {host}: {message}")]
    ModelUnavailable { host: String, message: String },

    #[error("model call timed out after {seconds}s")]
    ModelTimeout { seconds: u64 },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    ModelShapeMismatch { expected: usize, actual: usize },

    #[error("store corruption: {0}")]
    StoreCorruption(String),

    #[error("indexing queue is full")]
    QueueFull,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable kind string, used in API error bodies and CLI
    /// output.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "IoError",
            Error::Extraction { .. } => "ExtractionError",
            Error::ModelUnavailable { .. } => "ModelUnavailable",
            Error::ModelTimeout { .. } => "ModelTimeout",
            Error::ModelShapeMismatch { .. } => "ModelShapeMismatch",
            Error::StoreCorruption(_) => "StoreCorruption",
            Error::QueueFull => "QueueFull",
            Error::Cancelled => "Cancelled",
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::Database(_) => "StoreCorruption",
            Error::Other(_) => "Other",
        }
    }

    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ModelUnavailable { .. }
                | Error::ModelTimeout { .. }
                | Error::QueueFull
        )
    }

    /// Fatal errors halt the scheduler and flip the API into degraded
    /// read-only mode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ModelShapeMismatch { .. } | Error::StoreCorruption(_)
        )
    }

    /// Process exit code for the CLI: 0 success, 2 config error, 3 model
    /// unreachable, 4 corrupted store, 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigInvalid(_) => 2,
            Error::ModelUnavailable { .. } => 3,
            Error::StoreCorruption(_) | Error::Database(_) => 4,
            _ => 1,
        }
    }
}
