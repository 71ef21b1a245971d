//! Condense a chat transcript into a single CLI prompt.

use castor_schema::ChatMessage;

/// How many trailing turns the condensed-transcript form keeps. The CLI has
/// no notion of a conversation, so older context is dropped rather than
/// ballooning the argv.
const TRANSCRIPT_WINDOW: usize = 6;

/// Derive the prompt the CLI will be asked.
///
/// Prefers the latest user message with textual content; when there is none,
/// falls back to a condensed `role: text` transcript of the last few turns.
/// Returns `None` if the request carries no usable text at all.
pub(crate) fn build_prompt(messages: &[ChatMessage]) -> Option<String> {
    let latest_user = messages
        .iter()
        .rev()
        .filter(|m| m.role == "user")
        .map(ChatMessage::text)
        .find(|t| !t.trim().is_empty());
    if let Some(text) = latest_user {
        return Some(text);
    }

    let start = messages.len().saturating_sub(TRANSCRIPT_WINDOW);
    let lines: Vec<String> = messages[start..]
        .iter()
        .filter_map(|m| {
            let text = m.text();
            let text = text.trim();
            if text.is_empty() {
                None
            } else {
                Some(format!("{}: {}", m.role, text))
            }
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
