use super::IsRetryable;
use super::oauth::OauthError;
use std::path::PathBuf;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum CastorError {
    #[error(transparent)]
    Oauth(#[from] OauthError),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timed out waiting for lock on {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("No available account")]
    NoAvailableAccount,

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

impl IsRetryable for CastorError {
    fn is_retryable(&self) -> bool {
        match self {
            CastorError::ReqwestError(_) => true,
            // Lock contention is a transient condition; the caller may retry
            // the whole operation at a higher level.
            CastorError::LockTimeout(_) => true,
            CastorError::Oauth(e) => e.is_retryable(),
            _ => false,
        }
    }
}
