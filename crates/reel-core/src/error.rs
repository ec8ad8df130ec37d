//! Unified error type for the transcoding pipeline.
//!
//! Lower layers return structured variants; only the controller turns them
//! into a persisted FAILED status. HTTP handlers derive a status code via
//! [`Error::http_status`].

use std::fmt;

/// Unified error type covering all failure modes in reeler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An entity identifier or path segment is malformed.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The source could not be opened or carries no video stream.
    #[error("Probe error: {0}")]
    Probe(String),

    /// The encoder failed. `diagnostic` holds the captured stderr tail.
    #[error("Transcode error: {message}")]
    Transcode {
        /// Short description of what went wrong.
        message: String,
        /// Captured encoder output for operators.
        diagnostic: String,
    },

    /// Every requested image derivative failed.
    #[error("Derivative error: {0}")]
    Derivative(String),

    /// A second handoff arrived while the asset is still being processed.
    #[error("Upload already in progress for {entity}")]
    ConcurrentUpload {
        /// The asset key that is busy.
        entity: String,
    },

    /// The job was cancelled before it finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An external tool (ffmpeg, ffprobe) could not be run or returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Request or configuration data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "video", "avatar").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The caller did not present the transcoder secret.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidIdentifier(_) => 400,
            Error::Validation(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::NotFound { .. } => 404,
            Error::ConcurrentUpload { .. } => 409,
            Error::Probe(_) => 422,
            Error::Derivative(_) => 422,
            Error::Tool { .. } => 502,
            Error::Transcode { .. } => 502,
            Error::Cancelled(_) => 503,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Text suitable for persisting as a FAILED diagnostic.
    ///
    /// Transcode failures carry the encoder output in addition to the
    /// message; everything else is its display form.
    pub fn diagnostic(&self) -> String {
        match self {
            Error::Transcode {
                message,
                diagnostic,
            } if !diagnostic.is_empty() => format!("{message}\n{diagnostic}"),
            other => other.to_string(),
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Transcode`].
    pub fn transcode(message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Error::Transcode {
            message: message.into(),
            diagnostic: diagnostic.into(),
        }
    }

    /// Convenience constructor for [`Error::ConcurrentUpload`].
    pub fn concurrent_upload(entity: impl fmt::Display) -> Self {
        Error::ConcurrentUpload {
            entity: entity.to_string(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
