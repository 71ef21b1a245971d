//! Token refresh with cross-process coordination and failure classification.
//!
//! Multiple host processes may race to refresh the same grant. The refresher
//! therefore takes the credential file lock, re-reads the freshest on-disk
//! state before deciding anything (double-checked refresh), and persists the
//! new credential before the lock is released.

use crate::auth::credential::QwenCredential;
use crate::auth::endpoints::{QwenOauthEndpoints, TokenEndpointSuccess};
use crate::auth::lock::FileLock;
use crate::auth::store::TokenStore;
use crate::config::AuthConfig;
use crate::error::{CastorError, IsRetryable};
use backon::{ConstantBuilder, Retryable};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts beyond the first for a transient refresh failure.
const REFRESH_EXTRA_ATTEMPTS: usize = 2;
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a coordinated refresh.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A new credential was obtained and persisted.
    Refreshed(QwenCredential),
    /// Another process already refreshed; the on-disk credential is valid.
    Valid(QwenCredential),
    /// The refresh token itself was rejected (401/403). The stored credential
    /// has been deleted; this identity needs a fresh login.
    AuthRejected,
    /// Transient or unclassified failure; the stored credential is kept.
    Failed,
}

/// Outcome of "give me a valid access token".
#[derive(Debug)]
pub enum AccessOutcome {
    Valid(QwenCredential),
    NotAuthenticated,
    AuthRejected,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RefreshError {
    #[error("refresh rejected by auth server with status {status}")]
    AuthRejected { status: u16 },

    #[error("refresh rate limited by auth server")]
    RateLimited,

    #[error("transient refresh failure: {reason}")]
    Transient { reason: String },

    #[error("fatal refresh failure: {reason}")]
    Fatal { reason: String },
}

impl IsRetryable for RefreshError {
    fn is_retryable(&self) -> bool {
        matches!(self, RefreshError::Transient { .. })
    }
}

pub struct Refresher;

impl Refresher {
    /// Single refresh exchange, classified.
    ///
    /// 401/403 mean the refresh token itself is dead; no retry can help.
    /// 429 must not be hammered. 5xx and network errors are transient.
    /// Everything else (including a malformed success body) is fatal.
    pub(crate) async fn refresh_once(
        cfg: &AuthConfig,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<QwenCredential, RefreshError> {
        let resp = QwenOauthEndpoints::refresh_token_grant(cfg, http, refresh_token)
            .await
            .map_err(|e| RefreshError::Transient {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            let body: TokenEndpointSuccess =
                resp.json().await.map_err(|e| RefreshError::Fatal {
                    reason: format!("malformed token response: {e}"),
                })?;
            return body.into_credential().ok_or_else(|| RefreshError::Fatal {
                reason: "token response failed validation".to_string(),
            });
        }

        match status.as_u16() {
            401 | 403 => Err(RefreshError::AuthRejected {
                status: status.as_u16(),
            }),
            429 => Err(RefreshError::RateLimited),
            s if status.is_server_error() => Err(RefreshError::Transient {
                reason: format!("server error {s}"),
            }),
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(RefreshError::Fatal {
                    reason: format!("unexpected status {s}: {body:.200}"),
                })
            }
        }
    }

    /// Coordinated refresh: lock, double-checked re-read, bounded retries,
    /// persist-before-release.
    pub async fn refresh(
        store: &TokenStore,
        http: &reqwest::Client,
        refresh_token: &str,
    ) -> Result<RefreshOutcome, CastorError> {
        let cfg = store.config().clone();
        let guard = FileLock::acquire(&store.lock_path()).await?;

        // Another process may have refreshed while we waited for the lock.
        let on_disk = store.load();
        if let Some(current) = &on_disk {
            if !current.is_expired(cfg.expiry_buffer_ms) {
                debug!("credential already refreshed by another process; skipping network call");
                guard.release();
                return Ok(RefreshOutcome::Valid(current.clone()));
            }
        }

        let attempt = (|| async { Self::refresh_once(&cfg, http, refresh_token).await })
            .retry(
                ConstantBuilder::default()
                    .with_delay(REFRESH_RETRY_DELAY)
                    .with_max_times(REFRESH_EXTRA_ATTEMPTS),
            )
            .when(RefreshError::is_retryable)
            .notify(|err: &RefreshError, dur: Duration| {
                warn!(error = %err, retry_in_ms = dur.as_millis(), "token refresh failed; retrying");
            })
            .await;

        match attempt {
            Ok(mut cred) => {
                // A refresh response may omit the routing hint; keep the one
                // we already had rather than losing it.
                if cred.resource_url.is_none() {
                    cred.resource_url = on_disk.and_then(|c| c.resource_url);
                }
                store.save(&cred)?;
                guard.release();
                info!("token refresh completed");
                Ok(RefreshOutcome::Refreshed(cred))
            }
            Err(RefreshError::AuthRejected { status }) => {
                warn!(status, "refresh token rejected; clearing stored credential");
                store.clear()?;
                guard.release();
                Ok(RefreshOutcome::AuthRejected)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                guard.release();
                Ok(RefreshOutcome::Failed)
            }
        }
    }

    /// Resolve a valid access token from disk, refreshing when the stored one
    /// is inside the expiry buffer.
    pub async fn ensure_valid(
        store: &TokenStore,
        http: &reqwest::Client,
    ) -> Result<AccessOutcome, CastorError> {
        let Some(cred) = store.load() else {
            return Ok(AccessOutcome::NotAuthenticated);
        };

        if !cred.is_expired(store.config().expiry_buffer_ms) {
            return Ok(AccessOutcome::Valid(cred));
        }

        match Self::refresh(store, http, &cred.refresh_token).await? {
            RefreshOutcome::Refreshed(cred) | RefreshOutcome::Valid(cred) => {
                Ok(AccessOutcome::Valid(cred))
            }
            RefreshOutcome::AuthRejected => Ok(AccessOutcome::AuthRejected),
            RefreshOutcome::Failed => Ok(AccessOutcome::Failed),
        }
    }
}
