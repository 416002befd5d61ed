use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Who produced a turn in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// One part of a multimodal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    /// Base64-encoded image bytes. Passed through to the provider as an
    /// inline data URI and never written to the context store.
    Image { media_type: String, data: String },
}

/// Message payload: plain text or a list of multimodal parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl TurnContent {
    pub fn text(s: impl Into<String>) -> Self {
        TurnContent::Text(s.into())
    }

    /// The text to persist for this turn. Image blobs are dropped; only the
    /// text parts of a multimodal payload survive into history.
    pub fn persisted_text(&self) -> String {
        match self {
            TurnContent::Text(t) => t.clone(),
            TurnContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text(t) => Some(t.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Wire shape for an OpenAI-style chat completion request.
    /// Plain text becomes a string, parts become the array form with
    /// images encoded as inline base64 data URIs.
    pub fn to_wire(&self) -> Value {
        match self {
            TurnContent::Text(t) => json!(t),
            TurnContent::Parts(parts) => {
                let items: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text(t) => json!({"type": "text", "text": t}),
                        ContentPart::Image { media_type, data } => json!({
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:{};base64,{}", media_type, data),
                            },
                        }),
                    })
                    .collect();
                json!(items)
            }
        }
    }
}

/// One message within a conversation's history, oldest-first ordering.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: TurnContent) -> Self {
        Self {
            role,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, TurnContent::text(text))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, TurnContent::text(text))
    }

    /// Wire shape: `{"role": ..., "content": ...}`.
    pub fn to_wire(&self) -> Value {
        json!({
            "role": self.role.as_str(),
            "content": self.content.to_wire(),
        })
    }
}

/// Aggregate counters for the admin /stats command.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub total_conversations: u64,
    pub total_turns: u64,
    /// Conversations with at least one surviving turn.
    pub active_conversations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_serialises_as_plain_string() {
        let turn = Turn::user("hello");
        let wire = turn.to_wire();
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"], "hello");
    }

    #[test]
    fn multimodal_content_serialises_as_part_array() {
        let turn = Turn::new(
            Role::User,
            TurnContent::Parts(vec![
                ContentPart::Text("what is this?".into()),
                ContentPart::Image {
                    media_type: "image/jpeg".into(),
                    data: "aGVsbG8=".into(),
                },
            ]),
        );
        let wire = turn.to_wire();
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,aGVsbG8="
        );
    }

    #[test]
    fn persisted_text_drops_image_blobs() {
        let content = TurnContent::Parts(vec![
            ContentPart::Text("caption".into()),
            ContentPart::Image {
                media_type: "image/png".into(),
                data: "xxxx".into(),
            },
        ]);
        assert_eq!(content.persisted_text(), "caption");
    }
}
