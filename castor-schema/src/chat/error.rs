//! OpenAI-style error envelope, plus quota classification helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Error codes the upstream uses for "free allotment used up", as opposed to a
/// generic per-minute rate limit. The distinction drives the dispatcher's
/// degrade/fallback ladder instead of blind retry.
const QUOTA_EXHAUSTED_CODES: &[&str] = &[
    "insufficient_quota",
    "free_allocated_quota_exceeded",
    "allocated_quota_exceeded",
    "quota_exhausted",
];

/// Standard envelope: `{"error":{"message":"...","type":"...","param":...,"code":"..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatErrorBody {
    #[serde(rename = "error")]
    pub inner: ChatErrorObject,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatErrorObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChatErrorBody {
    pub fn new(message: impl Into<String>, r#type: impl Into<String>, code: Option<String>) -> Self {
        ChatErrorBody {
            inner: ChatErrorObject {
                message: Some(message.into()),
                r#type: Some(r#type.into()),
                param: None,
                code,
                extra: BTreeMap::new(),
            },
            extra: BTreeMap::new(),
        }
    }

    /// True when this error reports the account's free allotment is used up
    /// for a cooldown window (matched against `code`, falling back to `type`).
    pub fn is_quota_exhausted(&self) -> bool {
        let matches_code =
            |s: &String| QUOTA_EXHAUSTED_CODES.iter().any(|c| s.eq_ignore_ascii_case(c));
        self.inner.code.as_ref().is_some_and(matches_code)
            || self.inner.r#type.as_ref().is_some_and(matches_code)
    }
}
