use thiserror::Error;

/// Errors raised by model construction, the forward/backward passes,
/// training and persistence.
#[derive(Error, Debug)]
pub enum RnnError {
    /// Invalid dimensions or hyperparameters supplied by the caller.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Token or label outside the range the model was built for.
    #[error("Domain error: {0}")]
    Domain(String),

    /// Internal bookkeeping went wrong. This is a bug, not a user error.
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RnnError {
    fn from(error: serde_json::Error) -> Self {
        RnnError::Serialization(error.to_string())
    }
}

impl From<bincode::Error> for RnnError {
    fn from(error: bincode::Error) -> Self {
        RnnError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RnnError>;
