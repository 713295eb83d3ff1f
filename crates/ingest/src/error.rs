use std::path::PathBuf;

/// Input that cannot be turned into a layout at all.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PDF {path}: {reason}")]
    Pdf { path: PathBuf, reason: String },

    #[error("invalid layout JSON {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported input format: {extension:?} ({path})")]
    Unsupported { path: PathBuf, extension: String },
}

/// Returned when a cancellation signal is observed between units of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;
