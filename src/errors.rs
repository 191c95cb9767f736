use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NOT_A_RECORD: {0}")]
    NotARecord(String),
    #[error("NO_CHANNEL: no open channel peer")]
    NoChannel,
    #[error("REMOTE_ERROR: {0}")]
    Remote(String),
    #[error("MALFORMED_MESSAGE: {0}")]
    MalformedMessage(String),
    #[error("PERSISTENCE_FAILURE: {0}")]
    Persistence(String),
    #[error("TRANSPORT_FAILURE: {0}")]
    Transport(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedMessage(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<crate::mapper::PathParseError> for AppError {
    fn from(value: crate::mapper::PathParseError) -> Self {
        Self::NotARecord(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
