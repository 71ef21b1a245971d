//! Raw OAuth wire calls against the upstream authorization server.
//!
//! The upstream deviates from RFC response shapes in small ways (notably
//! `resource_url` in token responses), so these are plain form-encoded
//! `reqwest` posts rather than an `oauth2`-crate client; status/error mapping
//! lives with the callers in `device_flow` and `refresher`.

use crate::auth::credential::{QwenCredential, normalize_resource_url};
use crate::config::AuthConfig;
use crate::utils::now_ms;
use serde::Deserialize;
use tracing::debug;

pub(crate) const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Success body of the token endpoint (device-code and refresh grants share it).
#[derive(Debug, Deserialize)]
pub(crate) struct TokenEndpointSuccess {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    resource_url: Option<String>,
}

impl TokenEndpointSuccess {
    /// Validate the response and turn it into a credential with an absolute
    /// expiry. Missing `access_token`, `refresh_token`, or `expires_in`
    /// invalidates the whole response; nothing is persisted from it.
    pub(crate) fn into_credential(self) -> Option<QwenCredential> {
        let access_token = self.access_token.filter(|s| !s.is_empty())?;
        let refresh_token = self.refresh_token.filter(|s| !s.is_empty())?;
        let expires_in = self.expires_in.filter(|s| *s > 0)?;

        Some(QwenCredential {
            access_token,
            refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expiry_date: now_ms() + expires_in * 1000,
            resource_url: self.resource_url.as_deref().and_then(normalize_resource_url),
        })
    }
}

/// Error body of the token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenEndpointError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

pub(crate) struct QwenOauthEndpoints;

impl QwenOauthEndpoints {
    pub(crate) fn http_client(cfg: &AuthConfig) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent("castor-oauth/1.0")
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(cfg.http_timeout)
            .build()
            .expect("FATAL: initialize OAuth HTTP client failed")
    }

    pub(crate) async fn request_device_code(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        code_challenge: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        debug!(url = %cfg.device_code_url, "requesting device code");
        http.post(cfg.device_code_url.clone())
            .form(&[
                ("client_id", cfg.client_id.as_str()),
                ("scope", cfg.scope.as_str()),
                ("code_challenge", code_challenge),
                ("code_challenge_method", "S256"),
            ])
            .send()
            .await
    }

    pub(crate) async fn poll_device_token(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        device_code: &str,
        code_verifier: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        http.post(cfg.token_url.clone())
            .form(&[
                ("grant_type", DEVICE_GRANT_TYPE),
                ("client_id", cfg.client_id.as_str()),
                ("device_code", device_code),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await
    }

    pub(crate) async fn refresh_token_grant(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        http.post(cfg.token_url.clone())
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", cfg.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
    }
}
