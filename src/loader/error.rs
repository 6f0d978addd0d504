use std::time::Duration;

use thiserror::Error;

/// Why a load record was rejected. Cloned to every waiter of the record.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("loading {id} from {url} timed out after {timeout:?}")]
    Timeout {
        id: String,
        url: String,
        timeout: Duration,
    },
    #[error("failed to load {id} from {url}: {reason}")]
    Failed {
        id: String,
        url: String,
        reason: String,
    },
    #[error("hook could not resolve {id}: {reason}")]
    HookResolution { id: String, reason: String },
    #[error("factory of {id} threw: {message}")]
    Factory { id: String, message: String },
    #[error("module {id} is not defined")]
    NotFound { id: String },
    #[error("engine error: {0}")]
    Engine(String),
}

impl LoadError {
    pub fn module_id(&self) -> Option<&str> {
        match self {
            LoadError::Timeout { id, .. }
            | LoadError::Failed { id, .. }
            | LoadError::HookResolution { id, .. }
            | LoadError::Factory { id, .. }
            | LoadError::NotFound { id } => Some(id),
            LoadError::Engine(_) => None,
        }
    }
}

impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        LoadError::Engine(format!("{err:#}"))
    }
}
