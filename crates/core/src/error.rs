use thiserror::Error;

pub type PiscesResult<T> = Result<T, PiscesError>;

#[derive(Error, Debug)]
pub enum PiscesError {
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Invalid traffic strategy: {0}")]
    InvalidStrategy(String),

    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    #[error("Early-stop threshold must lie in (0.5, 1.0), got {0}")]
    InvalidThreshold(f64),

    #[error("Experiment has no groups: {0}")]
    NoGroups(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PiscesError {
    /// True for errors caused by caller input rather than system state.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidStrategy(_) | Self::InvalidEventType(_) | Self::InvalidThreshold(_)
        )
    }
}

impl From<config::ConfigError> for PiscesError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
