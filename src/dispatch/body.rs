//! Typed view over the outbound request body.
//!
//! Sanitization and token capping operate on this tagged union instead of
//! shape-sniffing raw JSON: a parseable JSON object gets the full treatment,
//! anything else passes through opaque and untouched.

use crate::model_catalog::{DEGRADE_OUTPUT_CEILING, output_ceiling};
use castor_schema::ChatMessage;
use serde_json::{Map, Value};
use tracing::debug;

/// Fields injected by the host for its own bookkeeping. They must never reach
/// the upstream network call.
const HOST_ONLY_FIELDS: &[&str] = &["sessionID", "providerID", "messageID", "agentID", "debug"];

/// Every known spelling of the output-token-limit field, at the top level and
/// under nested option objects.
const TOKEN_LIMIT_ALIASES: &[&str] = &[
    "max_tokens",
    "maxTokens",
    "max_output_tokens",
    "maxOutputTokens",
    "max_completion_tokens",
    "maxCompletionTokens",
];

const NESTED_OPTION_OBJECTS: &[&str] = &["options", "generation_config", "generationConfig"];

#[derive(Debug, Clone)]
pub enum OutboundBody {
    Json(Map<String, Value>),
    Opaque(Option<String>),
}

impl OutboundBody {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => OutboundBody::Opaque(None),
            Some(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => OutboundBody::Json(map),
                _ => OutboundBody::Opaque(Some(text.to_string())),
            },
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            OutboundBody::Json(map) => map.get("model").and_then(Value::as_str),
            OutboundBody::Opaque(_) => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            OutboundBody::Json(map) => map.get("stream").and_then(Value::as_bool).unwrap_or(false),
            OutboundBody::Opaque(_) => false,
        }
    }

    /// Serialized form for the wire. `None` means "no body".
    pub fn to_payload(&self) -> Option<String> {
        match self {
            OutboundBody::Json(map) => serde_json::to_string(map).ok(),
            OutboundBody::Opaque(raw) => raw.clone(),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.to_payload().map_or(0, |p| p.len())
    }

    /// Strip host-only metadata and drop `stream_options` when streaming is
    /// not actually enabled (the combination is inconsistent and some
    /// upstreams reject it).
    pub fn sanitize(&mut self) {
        let OutboundBody::Json(map) = self else {
            return;
        };

        for field in HOST_ONLY_FIELDS {
            if map.remove(*field).is_some() {
                debug!(field, "stripped host-only field from outbound body");
            }
        }

        let streaming = map.get("stream").and_then(Value::as_bool).unwrap_or(false);
        if !streaming && map.remove("stream_options").is_some() {
            debug!("removed stream_options from non-streaming request");
        }
    }

    /// Clamp every known token-limit alias to the model's documented ceiling.
    /// Values at or below the ceiling are left unchanged.
    pub fn cap_output_tokens(&mut self) {
        let Some(model) = self.model().map(str::to_string) else {
            return;
        };
        self.clamp_token_fields(output_ceiling(&model));
    }

    fn clamp_token_fields(&mut self, ceiling: u32) {
        let OutboundBody::Json(map) = self else {
            return;
        };

        clamp_in(map, ceiling);
        for nested in NESTED_OPTION_OBJECTS {
            if let Some(Value::Object(inner)) = map.get_mut(*nested) {
                clamp_in(inner, ceiling);
            }
        }
    }

    /// Build the degraded quota-retry payload: tools and forced tool choice
    /// removed, streaming off, token limit clamped far below the model cap.
    pub fn degraded(&self) -> OutboundBody {
        let mut copy = self.clone();
        let OutboundBody::Json(map) = &mut copy else {
            return copy;
        };

        map.remove("tools");
        map.remove("tool_choice");
        map.remove("parallel_tool_calls");
        map.insert("stream".to_string(), Value::Bool(false));
        map.remove("stream_options");
        map.insert(
            "max_tokens".to_string(),
            Value::from(DEGRADE_OUTPUT_CEILING),
        );

        copy.clamp_token_fields(DEGRADE_OUTPUT_CEILING);
        copy
    }

    /// Parsed `messages` array; empty for opaque bodies or unparseable arrays.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let OutboundBody::Json(map) = self else {
            return Vec::new();
        };
        map.get("messages")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// True only when every message content part is textual. Opaque bodies
    /// count as non-text: we cannot prove they carry no other modality.
    pub fn is_text_only(&self) -> bool {
        match self {
            OutboundBody::Json(_) => self.messages().iter().all(ChatMessage::is_text_only),
            OutboundBody::Opaque(_) => false,
        }
    }
}

fn clamp_in(map: &mut Map<String, Value>, ceiling: u32) {
    for alias in TOKEN_LIMIT_ALIASES {
        if let Some(value) = map.get_mut(*alias) {
            if let Some(requested) = value.as_u64() {
                if requested > u64::from(ceiling) {
                    debug!(alias, requested, ceiling, "capped output token limit");
                    *value = Value::from(ceiling);
                }
            }
        }
    }
}
