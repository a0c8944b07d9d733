//! Error taxonomy for the ingestion and retrieval pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the ingestion-to-retrieval pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// The document yielded zero extractable characters.
    #[error("no extractable text in document")]
    EmptyInput,

    /// File extension outside the supported set (pdf, docx, txt).
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// The embedding provider failed or returned a malformed response.
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// Vector dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Training the approximate index failed.
    #[error("index training failed: {0}")]
    IndexTrain(String),

    /// The generation provider failed or timed out.
    #[error("generation provider error: {0}")]
    GenerationProvider(String),

    /// Unknown document id.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// Unknown chat session or message id.
    #[error("session or message not found: {0}")]
    SessionNotFound(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Index artifact (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
