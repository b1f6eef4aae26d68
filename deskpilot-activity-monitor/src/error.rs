use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Input listener stopped: {0}")]
    Listener(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode activity event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;
