//! Credential shape, normalization, and expiry policy.

use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// One OAuth grant, as persisted in the credential file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QwenCredential {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Absolute expiry instant, epoch milliseconds.
    pub expiry_date: i64,
    /// Upstream routing hint, normalized to an absolute https URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

/// Field name older deployments used for the absolute expiry instant.
const LEGACY_EXPIRY_FIELD: &str = "expires_at";

impl QwenCredential {
    /// Normalize a loosely-typed on-disk or token-endpoint object into a
    /// credential.
    ///
    /// Tolerated legacy shapes: expiry under `expires_at`, and a string-typed
    /// expiry value. An unparseable `resource_url` is dropped rather than
    /// failing the whole record. Missing/non-string tokens or a non-finite,
    /// non-positive expiry invalidate the record.
    pub fn normalize(raw: &Value) -> Option<Self> {
        let access_token = raw.get("access_token")?.as_str()?.to_string();
        let refresh_token = raw.get("refresh_token")?.as_str()?.to_string();
        if access_token.is_empty() || refresh_token.is_empty() {
            return None;
        }

        let expiry_raw = raw
            .get("expiry_date")
            .or_else(|| raw.get(LEGACY_EXPIRY_FIELD))?;
        let expiry_date = coerce_expiry(expiry_raw)?;

        let token_type = raw
            .get("token_type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("Bearer")
            .to_string();

        let resource_url = raw
            .get("resource_url")
            .and_then(Value::as_str)
            .and_then(normalize_resource_url);

        Some(QwenCredential {
            access_token,
            refresh_token,
            token_type,
            expiry_date,
            resource_url,
        })
    }

    /// True when `raw` uses a pre-canonical field layout and deserves an
    /// opportunistic rewrite on load.
    pub(crate) fn has_legacy_shape(raw: &Value) -> bool {
        raw.get(LEGACY_EXPIRY_FIELD).is_some()
            || raw.get("expiry_date").is_some_and(Value::is_string)
    }

    pub fn is_expired(&self, buffer_ms: i64) -> bool {
        is_expired_at(self.expiry_date, buffer_ms, now_ms())
    }
}

/// `now >= expiry - buffer`: refresh comfortably before hard expiry so a
/// request never goes out with a token that lapses mid-flight.
pub fn is_expired_at(expiry_ms: i64, buffer_ms: i64, now_ms: i64) -> bool {
    now_ms >= expiry_ms.saturating_sub(buffer_ms)
}

fn coerce_expiry(raw: &Value) -> Option<i64> {
    let ms = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !ms.is_finite() || ms <= 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    Some(ms as i64)
}

/// Normalize a routing hint to an absolute https URL string.
///
/// A bare host gets an `https://` prefix; anything that still fails URL
/// parsing is discarded (returns `None`) instead of invalidating the record.
pub(crate) fn normalize_resource_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&with_scheme).ok()?;
    Some(url.to_string().trim_end_matches('/').to_string())
}
