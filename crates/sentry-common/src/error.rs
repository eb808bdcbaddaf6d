//! Shared error type for the sensor pipeline.

use thiserror::Error;

/// Top-level sensor error.
#[derive(Error, Debug)]
pub enum SentryError {
    /// Configuration failed validation (missing interface, bad snapshot length, ...).
    #[error("config error: {0}")]
    Config(String),

    /// A capture strategy failed to open its packet sources.
    #[error("capture open failure: {0}")]
    CaptureOpen(String),

    /// The named capture strategy does not exist in the registry.
    #[error("unknown capture strategy: {0}")]
    UnknownStrategy(String),

    /// A protocol analyzer could not make sense of the payload.
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    /// The local log file or database could not be opened.
    #[error("storage open failure: {0}")]
    StorageOpen(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for fallible sensor operations.
pub type SentryResult<T> = Result<T, SentryError>;

/// Analyzer-local soft failure. Callers record it against the
/// connection's analyzer key rather than aborting the whole pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalyzerError {
    /// Payload ended before a length-prefixed field could be read.
    #[error("truncated payload: {0}")]
    Truncated(String),

    /// Bytes did not match the expected wire format.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Payload had zero bytes to analyze.
    #[error("empty payload")]
    Empty,
}
