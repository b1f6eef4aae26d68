use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid workflow plan: {0}")]
    InvalidPlan(String),

    #[error("Command execution failed: {0}")]
    Execution(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl ControlsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ControlsError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        ControlsError::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = ControlsError> = std::result::Result<T, E>;
