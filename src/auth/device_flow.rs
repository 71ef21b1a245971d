//! OAuth 2.0 Device Authorization Grant (RFC 8628) with PKCE.
//!
//! The authorizer owns single wire calls; the poll loop state machine lives in
//! [`poll_until_complete`] and is driven entirely by [`PollOutcome`] values,
//! so every transition is testable without a network.

use crate::auth::endpoints::{QwenOauthEndpoints, TokenEndpointError, TokenEndpointSuccess};
use crate::auth::credential::QwenCredential;
use crate::config::AuthConfig;
use crate::error::OauthError;
use oauth2::{PkceCodeChallenge, PkceCodeVerifier};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use url::Url;

/// PKCE S256 pair. The verifier is held by the caller for the poll phase.
pub fn create_pkce() -> (String, String) {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    (challenge.as_str().to_string(), PkceCodeVerifier::secret(&verifier).clone())
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Total window in seconds after which the device code is dead.
    pub expires_in: i64,
    /// Poll interval hint in seconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

/// Outcome of one token-endpoint poll.
#[derive(Debug)]
pub enum PollOutcome {
    Pending,
    SlowDown,
    Expired,
    Denied,
    Success(QwenCredential),
    Failed { fatal: bool },
}

/// Terminal result of a full device-flow poll loop.
#[derive(Debug)]
pub enum DeviceFlowResult {
    Success(QwenCredential),
    Denied,
    Expired,
    /// Unrecognized upstream behavior; restarting the login is required.
    FailedFatal,
    /// Too many consecutive network failures.
    FailedTransient,
}

/// Knobs of the poll loop. Defaults are the production constants; tests
/// tighten them to keep wall-clock time down.
#[derive(Debug, Clone, Copy)]
pub struct PollLoopOptions {
    /// Added to every sleep so we never poll ahead of the server's interval.
    pub safety_margin: Duration,
    pub max_interval: Duration,
    /// Consecutive transient failures tolerated before giving up.
    pub max_transient_failures: u32,
}

impl Default for PollLoopOptions {
    fn default() -> Self {
        PollLoopOptions {
            safety_margin: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            max_transient_failures: 3,
        }
    }
}

pub struct DeviceFlow;

impl DeviceFlow {
    /// Request a device/user code pair.
    ///
    /// Device-code requests are never retried automatically: a failure here is
    /// surfaced to the user as an actionable "login failed" rather than a
    /// silent retry loop.
    pub async fn request_device_code(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        code_challenge: &str,
    ) -> Result<DeviceAuthResponse, OauthError> {
        let resp = QwenOauthEndpoints::request_device_code(cfg, http, code_challenge).await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, body = %body, "device code request rejected");
            return Err(OauthError::UpstreamStatus(status));
        }

        let body = resp.text().await.unwrap_or_default();
        let mut device: DeviceAuthResponse =
            serde_json::from_str(&body).map_err(|e| OauthError::Parse {
                message: e.to_string(),
                body: body.clone(),
            })?;

        if device.device_code.is_empty()
            || device.user_code.is_empty()
            || device.verification_uri.is_empty()
        {
            return Err(OauthError::Flow {
                code: "invalid_device_response".to_string(),
                message: "device code response is missing required fields".to_string(),
                details: serde_json::from_str(&body).ok(),
            });
        }

        // Some upstream deployments omit the client-identifying query
        // parameter from the ready-made verification URL, which breaks the
        // browser approval page. Patch it in when absent.
        if let Some(complete) = device.verification_uri_complete.take() {
            device.verification_uri_complete =
                Some(ensure_client_param(&complete, &cfg.client_id));
        }

        info!(user_code = %device.user_code, "device authorization started");
        Ok(device)
    }

    /// Single poll of the token endpoint.
    pub async fn poll_once(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        device_code: &str,
        code_verifier: &str,
    ) -> PollOutcome {
        let resp =
            match QwenOauthEndpoints::poll_device_token(cfg, http, device_code, code_verifier).await
            {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(error = %e, "device token poll hit a network error");
                    return PollOutcome::Failed { fatal: false };
                }
            };

        let status = resp.status();
        if status.is_success() {
            return match resp.json::<TokenEndpointSuccess>().await {
                Ok(body) => match body.into_credential() {
                    Some(cred) => PollOutcome::Success(cred),
                    None => {
                        warn!("token endpoint success body failed validation");
                        PollOutcome::Failed { fatal: true }
                    }
                },
                Err(e) => {
                    warn!(error = %e, "token endpoint success body was malformed");
                    PollOutcome::Failed { fatal: true }
                }
            };
        }

        let body = resp.text().await.unwrap_or_default();
        let parsed: Option<TokenEndpointError> = serde_json::from_str(&body).ok();
        match parsed.as_ref().map(|e| e.error.as_str()) {
            Some("authorization_pending") => PollOutcome::Pending,
            Some("slow_down") => PollOutcome::SlowDown,
            Some("expired_token") => PollOutcome::Expired,
            Some("access_denied") => PollOutcome::Denied,
            other => {
                // Unrecognized errors are terminal: continuing to poll an
                // endpoint that rejects us would just hammer the server.
                warn!(
                    %status,
                    error = other.unwrap_or("<unparsed>"),
                    description = parsed.as_ref().and_then(|e| e.error_description.as_deref()).unwrap_or(""),
                    "device token poll failed"
                );
                PollOutcome::Failed { fatal: true }
            }
        }
    }

    /// The poll loop state machine: sleeps, polls, and classifies until a
    /// terminal state is reached or the device code's window elapses.
    pub async fn poll_until_complete(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        device: &DeviceAuthResponse,
        code_verifier: &str,
    ) -> DeviceFlowResult {
        Self::poll_until_complete_with(cfg, http, device, code_verifier, PollLoopOptions::default())
            .await
    }

    pub async fn poll_until_complete_with(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        device: &DeviceAuthResponse,
        code_verifier: &str,
        opts: PollLoopOptions,
    ) -> DeviceFlowResult {
        let mut interval = Duration::from_secs(device.interval.unwrap_or(5)).min(opts.max_interval);
        let deadline =
            Instant::now() + Duration::from_secs(u64::try_from(device.expires_in.max(0)).unwrap_or(0));
        let mut transient_failures: u32 = 0;

        loop {
            let wait = interval + opts.safety_margin;
            if Instant::now() + wait >= deadline {
                info!("device code window elapsed before authorization completed");
                return DeviceFlowResult::Expired;
            }
            sleep(wait).await;

            match Self::poll_once(cfg, http, &device.device_code, code_verifier).await {
                PollOutcome::Pending => {
                    transient_failures = 0;
                }
                PollOutcome::SlowDown => {
                    transient_failures = 0;
                    interval = (interval + Duration::from_secs(5)).min(opts.max_interval);
                    debug!(interval_ms = interval.as_millis(), "server asked to slow down");
                }
                PollOutcome::Failed { fatal: false } => {
                    transient_failures += 1;
                    if transient_failures >= opts.max_transient_failures {
                        warn!(
                            failures = transient_failures,
                            "giving up after consecutive transient poll failures"
                        );
                        return DeviceFlowResult::FailedTransient;
                    }
                }
                PollOutcome::Failed { fatal: true } => return DeviceFlowResult::FailedFatal,
                PollOutcome::Denied => return DeviceFlowResult::Denied,
                PollOutcome::Expired => return DeviceFlowResult::Expired,
                PollOutcome::Success(cred) => {
                    info!("device authorization completed");
                    return DeviceFlowResult::Success(cred);
                }
            }
        }
    }
}

/// Append `client=<id>` to a verification URL that lacks it.
fn ensure_client_param(uri: &str, client_id: &str) -> String {
    let Ok(mut url) = Url::parse(uri) else {
        return uri.to_string();
    };
    if url.query_pairs().any(|(k, _)| k == "client") {
        return uri.to_string();
    }
    url.query_pairs_mut().append_pair("client", client_id);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_param_is_appended_when_missing() {
        let got = ensure_client_param("https://chat.qwen.ai/authorize?user_code=ABCD", "cid-1");
        assert_eq!(
            got,
            "https://chat.qwen.ai/authorize?user_code=ABCD&client=cid-1"
        );
    }

    #[test]
    fn client_param_is_left_alone_when_present() {
        let uri = "https://chat.qwen.ai/authorize?client=existing&user_code=ABCD";
        assert_eq!(ensure_client_param(uri, "cid-1"), uri);
    }

    #[test]
    fn unparseable_verification_uri_passes_through() {
        assert_eq!(ensure_client_param("not a url", "cid-1"), "not a url");
    }
}
