use thiserror::Error;

/// Failures surfaced by a [`crate::adapter::PermanentStore`] implementation.
/// Everything else inside the adapter is free to use `anyhow::Result`
/// internally; this is the typed boundary the rest of the core sees.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("index not declared: {0}")]
    UnknownIndex(String),
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
