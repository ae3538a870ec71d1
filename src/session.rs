use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TITLE_MAX_CHARS: usize = 40;
pub const IMAGE_ONLY_TITLE: &str = "Image Analysis";
pub const UNTITLED: &str = "New Chat";

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

/// One conversation turn. `images` holds local file references in attachment order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredMessage")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub images: Vec<String>,
}

// Older rows carry a single `imageUri` next to (or instead of) `images`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMessage {
    id: String,
    role: Role,
    #[serde(default)]
    content: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    image_uri: Option<String>,
}

impl From<StoredMessage> for ChatMessage {
    fn from(raw: StoredMessage) -> Self {
        let mut images = Vec::with_capacity(raw.images.len() + 1);
        if let Some(uri) = raw.image_uri.filter(|u| !u.is_empty()) {
            images.push(uri);
        }
        images.extend(raw.images);
        Self { id: raw.id, role: raw.role, content: raw.content, images }
    }
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>, images: Vec<String>) -> Self {
        Self { id: new_message_id(), role, content: content.into(), images }
    }

    pub fn user(content: impl Into<String>, images: Vec<String>) -> Self {
        Self::new(Role::User, content, images)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, Vec::new())
    }

    pub fn has_text(&self) -> bool {
        !self.content.trim().is_empty()
    }

    /// A turn with neither text nor images carries nothing and must not be recorded.
    pub fn is_blank(&self) -> bool {
        !self.has_text() && self.images.is_empty()
    }
}

fn new_message_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
    /// Oldest first.
    pub messages: Vec<ChatMessage>,
    pub is_pinned: bool,
}

impl ChatSession {
    /// Display order for the chat screen.
    pub fn newest_first(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().rev()
    }

    pub fn updated_on(&self, day: chrono::NaiveDate) -> bool {
        self.timestamp.date_naive() == day
    }

    /// Case-insensitive match on the title or the last-message preview. A blank
    /// query matches everything.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        needle.is_empty()
            || self.title.to_lowercase().contains(&needle)
            || self.last_message.to_lowercase().contains(&needle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotEntry {
    /// Gallery asset id of the source image.
    pub id: String,
    pub local_uri: String,
    pub summary: String,
    /// Creation time of the source asset, not the time of summarization.
    pub timestamp: DateTime<Utc>,
}

pub fn derive_title(messages: &[ChatMessage]) -> String {
    let Some(first) = messages.iter().find(|m| m.role == Role::User) else {
        return UNTITLED.to_string();
    };
    let text = first.content.trim();
    if text.is_empty() {
        return if first.images.is_empty() { UNTITLED.to_string() } else { IMAGE_ONLY_TITLE.to_string() };
    }
    let mut title: String = text.chars().take(TITLE_MAX_CHARS).collect();
    if text.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

pub fn derive_preview(messages: &[ChatMessage]) -> String {
    match messages.last() {
        Some(m) if m.has_text() => m.content.clone(),
        Some(m) if !m.images.is_empty() => "Image attached".to_string(),
        _ => "...".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_image_uri_is_folded_into_images() {
        let raw = r#"{"id":"1","role":"user","content":"look","imageUri":"file:///a.jpg","images":["b.jpg"]}"#;
        let msg: ChatMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.images, vec!["file:///a.jpg".to_string(), "b.jpg".to_string()]);

        let out = serde_json::to_value(&msg).unwrap();
        assert!(out.get("imageUri").is_none());
        assert_eq!(out["images"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn message_list_survives_json_round_trip_in_order() {
        let messages = vec![
            ChatMessage::user("first", vec!["x.jpg".into()]),
            ChatMessage::assistant("second"),
            ChatMessage::user("", vec!["y.jpg".into(), "z.jpg".into()]),
        ];
        let encoded = serde_json::to_string(&messages).unwrap();
        let decoded: Vec<ChatMessage> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn title_comes_from_first_user_message() {
        let long = "a".repeat(45);
        let messages = vec![ChatMessage::assistant("hi there"), ChatMessage::user(long, vec![])];
        let title = derive_title(&messages);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));

        assert_eq!(derive_title(&[ChatMessage::user("Hello", vec![])]), "Hello");
        assert_eq!(derive_title(&[ChatMessage::user("  ", vec!["a.jpg".into()])]), IMAGE_ONLY_TITLE);
        assert_eq!(derive_title(&[]), UNTITLED);
    }

    #[test]
    fn preview_uses_latest_message() {
        let messages = vec![ChatMessage::user("question", vec![]), ChatMessage::assistant("answer")];
        assert_eq!(derive_preview(&messages), "answer");
        assert_eq!(derive_preview(&[ChatMessage::user("", vec!["a.jpg".into()])]), "Image attached");
        assert_eq!(derive_preview(&[]), "...");
    }

    #[test]
    fn blank_message_detection() {
        assert!(ChatMessage::user("   ", vec![]).is_blank());
        assert!(!ChatMessage::user("", vec!["a.jpg".into()]).is_blank());
    }
}
