use super::IsRetryable;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum OauthError {
    #[error("OAuth flow error: {message}")]
    Flow {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("OAuth request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("OAuth upstream error with status: {0}")]
    UpstreamStatus(StatusCode),

    #[error("OAuth token endpoint parse error: {message}. Body: {body}")]
    Parse { message: String, body: String },
}

impl IsRetryable for OauthError {
    fn is_retryable(&self) -> bool {
        match self {
            OauthError::Request(_) => true,
            OauthError::UpstreamStatus(status) => status.is_server_error(),
            _ => false,
        }
    }
}
