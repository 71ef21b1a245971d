//! Chat-completion request schema (message side).
//!
//! The dispatcher mostly manipulates request bodies as raw JSON so unknown
//! fields pass through untouched; these typed views exist for the pieces that
//! need real structure: prompt extraction and content-modality checks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One entry of the `messages` array.
///
/// `extra` collects unknown fields (`name`, `tool_call_id`, vendor extensions)
/// so deserialization never breaks when the host adds fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `content` is either a plain string or an array of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One element of an array-form `content`.
///
/// Non-text variants are kept as distinct arms so callers can detect
/// modality-bearing payloads without sniffing raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image_url")]
    ImageUrl {
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },

    #[serde(rename = "input_audio")]
    InputAudio {
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },

    #[serde(rename = "video_url")]
    VideoUrl {
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },

    #[serde(rename = "file")]
    File {
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },

    #[serde(untagged)]
    Other(Value),
}

impl ContentPart {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }

    /// True for any part that carries a non-text modality. `Other` parts are
    /// conservatively treated as non-text: an unrecognized shape may well be
    /// modality-bearing, and dropping it silently would be worse than refusing.
    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }
}

impl MessageContent {
    /// Concatenated text of all textual parts (the whole string for the
    /// plain-string form).
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(ContentPart::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_text_only(&self) -> bool {
        match self {
            MessageContent::Text(_) => true,
            MessageContent::Parts(parts) => parts.iter().all(ContentPart::is_text),
        }
    }
}

impl ChatMessage {
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::joined_text)
            .unwrap_or_default()
    }

    pub fn is_text_only(&self) -> bool {
        self.content.as_ref().is_none_or(MessageContent::is_text_only)
    }
}
