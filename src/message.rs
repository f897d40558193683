use serde::{Deserialize, Deserializer, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::media;

/// Joins the two sorted identities of a conversation key.
pub const KEY_SEPARATOR: &str = "__";

/// Canonical key of the conversation between `a` and `b`.
///
/// The key does not depend on argument order, so `(alice, bob)` and
/// `(bob, alice)` address the same history.
pub fn conversation_key(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}{KEY_SEPARATOR}{second}")
}

/// Current UTC time as an RFC 3339 string.
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(MediaType::Image),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }

    /// Classifies an upload by its MIME type; anything but `image/*` and `video/*` is refused.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Some(MediaType::Image)
        } else if mime.starts_with("video/") {
            Some(MediaType::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }
}

// Unknown media kinds count as "no media" instead of failing the whole frame.
fn lenient_media_type<'de, D>(deserializer: D) -> Result<Option<MediaType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(MediaType::parse))
}

// Stored records may carry `null` where a string is expected.
fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn passes_validity(
    sender: &str,
    receiver: &str,
    text: &str,
    media_type: Option<MediaType>,
    media_url: Option<&str>,
) -> bool {
    if sender.is_empty() || receiver.is_empty() {
        return false;
    }
    let has_text = !text.trim().is_empty();
    let has_media = media_type.is_some() && media_url.is_some_and(|url| !url.is_empty());
    has_text || has_media
}

/// A chat message as persisted and relayed.
///
/// Every field is always present on the wire; absent media is `null` and
/// absent text is `""`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sender: String,
    pub receiver: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient_media_type")]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default, deserialize_with = "nullable_string")]
    pub timestamp: String,
}

impl Message {
    pub fn conversation_key(&self) -> String {
        conversation_key(&self.sender, &self.receiver)
    }

    /// Non-empty participants and either non-blank text or a complete media reference.
    pub fn is_valid(&self) -> bool {
        passes_validity(
            &self.sender,
            &self.receiver,
            &self.text,
            self.media_type,
            self.media_url.as_deref(),
        )
    }

    /// Whether `identity` is one of the two participants.
    pub fn involves(&self, identity: &str) -> bool {
        self.sender == identity || self.receiver == identity
    }

    /// The individual media references carried by this message.
    ///
    /// Multi-image messages carry a JSON array of references in `mediaUrl`.
    pub fn media_refs(&self) -> Vec<String> {
        self.media_url
            .as_deref()
            .map(media::split_refs)
            .unwrap_or_default()
    }
}

/// A `chat-message` payload as sent by clients, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient_media_type")]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl IncomingMessage {
    pub fn is_valid(&self) -> bool {
        passes_validity(
            self.sender.as_deref().unwrap_or_default(),
            self.receiver.as_deref().unwrap_or_default(),
            self.text.as_deref().unwrap_or_default(),
            self.media_type,
            self.media_url.as_deref(),
        )
    }

    /// Checks the payload once at the boundary and fills in what the server owns.
    ///
    /// Returns `None` for payloads that must be dropped. A missing or blank
    /// timestamp is replaced with the current server time; empty media URLs
    /// become `None`.
    pub fn into_message(self) -> Option<Message> {
        if !self.is_valid() {
            return None;
        }

        let timestamp = match self.timestamp {
            Some(ts) if !ts.trim().is_empty() => ts,
            _ => now_timestamp(),
        };

        Some(Message {
            sender: self.sender.unwrap_or_default(),
            receiver: self.receiver.unwrap_or_default(),
            text: self.text.unwrap_or_default(),
            media_type: self.media_type,
            media_url: self.media_url.filter(|url| !url.is_empty()),
            timestamp,
        })
    }
}

impl From<Message> for IncomingMessage {
    fn from(message: Message) -> Self {
        IncomingMessage {
            sender: Some(message.sender),
            receiver: Some(message.receiver),
            text: Some(message.text),
            media_type: message.media_type,
            media_url: message.media_url,
            timestamp: Some(message.timestamp),
        }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUser {
    pub username: String,
    pub last_message: String,
    pub last_message_time: String,
    #[serde(default)]
    pub profile_url: Option<String>,
}

/// Frames a client sends over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    Join(String),
    ChatMessage(IncomingMessage),
}

/// Frames the relay pushes to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    ChatMessage(Message),
}
