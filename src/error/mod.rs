mod castor;
mod oauth;

pub use castor::CastorError;
pub use oauth::OauthError;

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
