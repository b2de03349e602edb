use std::io;

use thiserror::Error;

use crate::element::PathError;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),
    #[error("provider {0} is unavailable")]
    Unavailable(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
}

impl ProviderError {
    /// Everything except a malformed path may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Path(_))
    }
}
