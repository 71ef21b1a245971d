//! Outbound request orchestration.
//!
//! One `send` call owns the whole lifecycle of an upstream request: account
//! resolution, header injection, body sanitization, the retry/degrade/fallback
//! ladder, and quota bookkeeping. Callers hand over a raw request and get back
//! a [`DispatchOutcome`] they can serve directly.

use crate::accounts::{AccountManager, GetActiveOptions, RuntimeAccount};
use crate::config::DispatchConfig;
use crate::dispatch::body::OutboundBody;
use crate::dispatch::ladder::{
    DEGRADE_MAX_BODY_BYTES, Ladder, LadderStep, RETRYABLE_STATUSES, ResponseClass,
};
use crate::error::CastorError;
use crate::fallback::{CliFallback, FallbackOutcome, FallbackReply};
use castor_schema::ChatErrorBody;
use reqwest::header::{
    AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const AUTH_TYPE_HEADER: &str = "x-dashscope-authtype";
const CACHE_CONTROL_HEADER: &str = "x-dashscope-cachecontrol";
const UPSTREAM_USER_AGENT_HEADER: &str = "x-dashscope-useragent";

const AUTH_TYPE_VALUE: &str = "qwen-oauth";
const CACHE_CONTROL_VALUE: &str = "enable";
const USER_AGENT_VALUE: &str = concat!("castor/", env!("CARGO_PKG_VERSION"));

/// A raw outbound request. `path` is joined onto the selected account's API
/// origin; headers the caller sets are preserved verbatim.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl OutboundRequest {
    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        OutboundRequest {
            method: Method::POST,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Some(body.into()),
        }
    }
}

/// What the caller gets back. Every arm is directly servable; raw transport
/// errors never cross this boundary.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Final upstream response, body untouched (stream it through).
    Upstream(reqwest::Response),
    /// An upstream error the ladder decided to surface, already buffered
    /// because classification had to read it.
    Passthrough { status: StatusCode, body: String },
    /// Answer produced by the external CLI fallback.
    Fallback(FallbackReply),
    /// Locally synthesized error envelope (quota exhausted, timeout,
    /// upstream unreachable).
    Synthesized {
        status: StatusCode,
        body: ChatErrorBody,
    },
    /// The caller's cancellation token fired.
    Aborted,
}

enum Attempt {
    Response(reqwest::Response),
    TimedOut,
    NetworkError(reqwest::Error),
    Cancelled,
}

pub struct Dispatcher {
    cfg: DispatchConfig,
    http: reqwest::Client,
    accounts: Arc<AccountManager>,
    fallback: CliFallback,
}

impl Dispatcher {
    pub fn new(cfg: DispatchConfig, http: reqwest::Client, accounts: Arc<AccountManager>) -> Self {
        let fallback = CliFallback::new(cfg.fallback.clone());
        Dispatcher {
            cfg,
            http,
            accounts,
            fallback,
        }
    }

    /// Send a request through the active account, walking the retry ladder as
    /// needed. Every failure mode comes back as a servable [`DispatchOutcome`]:
    /// account-layer failures (nothing logged in, credential files locked,
    /// registry I/O) are converted to synthesized error envelopes rather than
    /// surfaced as `Err`.
    pub async fn send(
        &self,
        request: OutboundRequest,
        cancel: Option<&CancellationToken>,
    ) -> DispatchOutcome {
        match self.dispatch(request, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "dispatch failed before reaching upstream");
                account_error(&e)
            }
        }
    }

    async fn dispatch(
        &self,
        request: OutboundRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<DispatchOutcome, CastorError> {
        let account = self
            .accounts
            .get_active(GetActiveOptions::default())
            .await?
            .ok_or(CastorError::NoAvailableAccount)?;

        let mut body = OutboundBody::parse(request.body.as_deref());
        body.sanitize();
        body.cap_output_tokens();
        let original = body.clone();

        let headers = inject_headers(request.headers, &account.credential.access_token);

        let mut ladder = Ladder::new(self.cfg.max_retries);
        let mut degraded = false;
        let mut quota_marked = false;

        loop {
            let attempt = self
                .send_once(&account, &request.method, &request.path, &headers, &body, cancel)
                .await;

            let (class, observed) = match attempt {
                Attempt::Cancelled => return Ok(DispatchOutcome::Aborted),
                Attempt::Response(resp) => {
                    let status = resp.status();
                    if !RETRYABLE_STATUSES.contains(&status.as_u16()) {
                        return Ok(DispatchOutcome::Upstream(resp));
                    }
                    // Classification needs the body, so buffer it; if the
                    // ladder surfaces this response it goes out as-is.
                    let text = resp.text().await.unwrap_or_default();
                    let class = classify_error(status, &text);
                    (class, Observed::Http { status, body: text })
                }
                Attempt::TimedOut => (ResponseClass::Retryable, Observed::TimedOut),
                Attempt::NetworkError(e) => {
                    warn!(error = %e, "upstream request failed at the transport level");
                    (ResponseClass::Retryable, Observed::Unreachable)
                }
            };

            if class == ResponseClass::QuotaExhausted && !quota_marked {
                quota_marked = true;
                let code = error_code(&observed).unwrap_or_else(|| "quota_exhausted".to_string());
                self.accounts.mark_quota_exhausted(&account.id, &code).await?;
            }

            let degradable = !degraded
                && matches!(body, OutboundBody::Json(_))
                && body.payload_len() <= DEGRADE_MAX_BODY_BYTES;
            let fallback_available = self.fallback.enabled() && original.is_text_only();

            match ladder.next(class, degradable, fallback_available) {
                LadderStep::ReturnResponse => return Ok(surface(observed)),
                LadderStep::RetryAfter(delay) => {
                    debug!(delay_ms = delay.as_millis(), "retrying after backoff");
                    if !sleep_or_cancel(delay, cancel).await {
                        return Ok(DispatchOutcome::Aborted);
                    }
                    // Plain retries always resend the full payload; the
                    // degraded form is reserved for the quota step itself.
                    body = original.clone();
                }
                LadderStep::SendDegraded => {
                    info!("quota exhausted; resending a degraded payload");
                    body = body.degraded();
                    degraded = true;
                }
                LadderStep::InvokeFallback => {
                    return match self.fallback.run(&original, cancel).await {
                        FallbackOutcome::Success(reply) => Ok(DispatchOutcome::Fallback(reply)),
                        FallbackOutcome::Aborted => Ok(DispatchOutcome::Aborted),
                        FallbackOutcome::Failed(reason) => {
                            warn!(reason = %reason, "CLI fallback failed; surfacing quota error");
                            Ok(quota_error())
                        }
                    };
                }
                LadderStep::FailQuota => return Ok(quota_error()),
            }
        }
    }

    /// One upstream attempt under the request-level timeout, composed with
    /// the caller's cancellation token.
    async fn send_once(
        &self,
        account: &RuntimeAccount,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &OutboundBody,
        cancel: Option<&CancellationToken>,
    ) -> Attempt {
        let url = join_url(account.api_base(), path);
        let mut builder = self
            .http
            .request(method.clone(), &url)
            .headers(headers.clone());
        if let Some(payload) = body.to_payload() {
            builder = builder.body(payload);
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = builder.send() => match result {
                Ok(resp) => Attempt::Response(resp),
                Err(e) if e.is_timeout() => Attempt::TimedOut,
                Err(e) => Attempt::NetworkError(e),
            },
            () = tokio::time::sleep(self.cfg.request_timeout) => Attempt::TimedOut,
            () = cancelled => Attempt::Cancelled,
        }
    }
}

/// What the last attempt produced, kept around so the ladder can surface it.
enum Observed {
    Http { status: StatusCode, body: String },
    TimedOut,
    Unreachable,
}

fn surface(observed: Observed) -> DispatchOutcome {
    match observed {
        Observed::Http { status, body } => DispatchOutcome::Passthrough { status, body },
        Observed::TimedOut => DispatchOutcome::Synthesized {
            status: StatusCode::GATEWAY_TIMEOUT,
            body: ChatErrorBody::new(
                "upstream request timed out",
                "timeout_error",
                Some("upstream_timeout".to_string()),
            ),
        },
        Observed::Unreachable => DispatchOutcome::Synthesized {
            status: StatusCode::BAD_GATEWAY,
            body: ChatErrorBody::new(
                "upstream is unreachable",
                "upstream_error",
                Some("upstream_unavailable".to_string()),
            ),
        },
    }
}

/// Envelope for failures that happen before a request ever leaves: no usable
/// account, credential files held by another process, registry I/O trouble.
fn account_error(e: &CastorError) -> DispatchOutcome {
    match e {
        CastorError::NoAvailableAccount => DispatchOutcome::Synthesized {
            status: StatusCode::UNAUTHORIZED,
            body: ChatErrorBody::new(
                "no authenticated account is available; complete the device login flow",
                "authentication_error",
                Some("no_available_account".to_string()),
            ),
        },
        CastorError::LockTimeout(_) => DispatchOutcome::Synthesized {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ChatErrorBody::new(
                "credential files are locked by another process; retry shortly",
                "temporarily_unavailable",
                Some("lock_timeout".to_string()),
            ),
        },
        other => DispatchOutcome::Synthesized {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ChatErrorBody::new(
                other.to_string(),
                "internal_error",
                Some("internal_error".to_string()),
            ),
        },
    }
}

fn quota_error() -> DispatchOutcome {
    DispatchOutcome::Synthesized {
        status: StatusCode::TOO_MANY_REQUESTS,
        body: ChatErrorBody::new(
            "free-tier quota exhausted for all available accounts",
            "insufficient_quota",
            Some("insufficient_quota".to_string()),
        ),
    }
}

/// Classify a retryable-status response: a 429 whose body carries a
/// quota-exhaustion code is terminal for this account, anything else in the
/// retryable set is a transient condition.
fn classify_error(status: StatusCode, body: &str) -> ResponseClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        if let Ok(envelope) = serde_json::from_str::<ChatErrorBody>(body) {
            if envelope.is_quota_exhausted() {
                return ResponseClass::QuotaExhausted;
            }
        }
    }
    ResponseClass::Retryable
}

fn error_code(observed: &Observed) -> Option<String> {
    let Observed::Http { body, .. } = observed else {
        return None;
    };
    serde_json::from_str::<ChatErrorBody>(body)
        .ok()
        .and_then(|e| e.inner.code)
}

/// Add the identity headers the upstream expects, without clobbering anything
/// the caller set. `Authorization` is the one exception: token lifecycle is
/// owned here, so it is always overwritten.
fn inject_headers(mut headers: HeaderMap, access_token: &str) -> HeaderMap {
    let bearer = format!("Bearer {access_token}");
    if let Ok(v) = HeaderValue::from_str(&bearer) {
        headers.insert(AUTHORIZATION, v);
    }

    let defaults: [(HeaderName, &str); 5] = [
        (HeaderName::from_static(AUTH_TYPE_HEADER), AUTH_TYPE_VALUE),
        (
            HeaderName::from_static(CACHE_CONTROL_HEADER),
            CACHE_CONTROL_VALUE,
        ),
        (
            HeaderName::from_static(UPSTREAM_USER_AGENT_HEADER),
            USER_AGENT_VALUE,
        ),
        (USER_AGENT, USER_AGENT_VALUE),
        (CONTENT_TYPE, "application/json"),
    ];
    for (name, value) in defaults {
        if !headers.contains_key(&name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
    headers
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Sleep unless the cancellation token fires first. Returns `false` on cancel.
async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = cancelled => false,
    }
}
