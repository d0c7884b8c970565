use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a message stands between the optimistic local write and the
/// server-confirmed truth. A failed send keeps its message in the thread
/// until the user explicitly retries.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

/// Message payload: plain text, or a fenced code block tagged with a language
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum MessageContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "code")]
    Code { language: String, source: String },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// Parse wire text. A payload fenced with ``` and a language tag becomes
    /// a code payload; everything else stays plain text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(rest) = trimmed.strip_prefix("```") {
            if let Some(body) = rest.strip_suffix("```") {
                if let Some((language, source)) = body.split_once('\n') {
                    let language = language.trim();
                    if !language.is_empty() && !language.contains(char::is_whitespace) {
                        return MessageContent::Code {
                            language: language.to_string(),
                            source: source.trim_end_matches('\n').to_string(),
                        };
                    }
                }
            }
        }
        MessageContent::Text {
            text: raw.to_string(),
        }
    }

    /// Render back to wire text (inverse of `parse`)
    pub fn to_wire_text(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Code { language, source } => {
                format!("```{}\n{}\n```", language, source)
            }
        }
    }

    /// Single-line preview for the conversation list
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { text } => text.lines().next().unwrap_or_default().to_string(),
            MessageContent::Code { language, .. } => format!("[code: {}]", language),
        }
    }
}

/// One message within a thread. `id` is server-assigned once confirmed; a
/// locally-generated provisional id stands in until then.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    pub delivery: DeliveryState,
}

impl Message {
    /// Server-confirmed message, as received from the store or the wire
    pub fn confirmed(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        content: MessageContent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            content,
            timestamp,
            delivery: DeliveryState::Confirmed,
        }
    }

    /// Locally-generated provisional message for an optimistic send
    pub fn provisional(sender_id: &str, content: MessageContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            content,
            timestamp: Utc::now(),
            delivery: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let content = MessageContent::parse("hello there");
        assert_eq!(content, MessageContent::text("hello there"));
    }

    #[test]
    fn test_parse_fenced_code() {
        let content = MessageContent::parse("```rust\nfn main() {}\n```");
        assert_eq!(
            content,
            MessageContent::Code {
                language: "rust".to_string(),
                source: "fn main() {}".to_string(),
            }
        );
    }

    #[test]
    fn test_fence_without_language_stays_text() {
        let raw = "```\nplain block\n```";
        let content = MessageContent::parse(raw);
        assert_eq!(content, MessageContent::text(raw));
    }

    #[test]
    fn test_code_wire_round_trip() {
        let content = MessageContent::Code {
            language: "python".to_string(),
            source: "print('hi')".to_string(),
        };
        assert_eq!(MessageContent::parse(&content.to_wire_text()), content);
    }

    #[test]
    fn test_preview() {
        assert_eq!(
            MessageContent::text("line one\nline two").preview(),
            "line one"
        );
        assert_eq!(
            MessageContent::Code {
                language: "rust".to_string(),
                source: "let x = 1;".to_string(),
            }
            .preview(),
            "[code: rust]"
        );
    }

    #[test]
    fn test_provisional_is_pending() {
        let msg = Message::provisional("user1", MessageContent::text("hi"));
        assert!(msg.is_pending());
        assert_eq!(msg.sender_id, "user1");
        assert!(!msg.id.is_empty());
    }
}
