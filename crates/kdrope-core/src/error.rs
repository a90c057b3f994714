use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid argument: {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Position {position} out of range: rotation tables cover {max_len} positions")]
    OutOfRange { position: usize, max_len: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Empty batch: no position carries loss weight")]
    EmptyBatch,
}

impl CoreError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
