use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResAllocError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Invalid resource request: {0}")]
    InvalidRequest(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<toml::de::Error> for ResAllocError {
    fn from(error: toml::de::Error) -> Self {
        Self::ConfigError(error.to_string())
    }
}

impl From<anyhow::Error> for ResAllocError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

pub fn config_error<T>(message: impl Into<String>) -> crate::Result<T> {
    Err(ResAllocError::ConfigError(message.into()))
}
