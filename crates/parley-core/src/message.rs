//! Chat message types for Parley.
//!
//! Messages are created once at post time and never mutated afterwards, so they
//! are shared as `Arc<Message>` between the cache and every waiter they are
//! delivered to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// A unique message identifier (random 128-bit UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A posted chat message.
///
/// Field names on the wire follow the legacy JSON shape
/// (`id`, `from`, `message`, `html`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Display name of the author.
    #[serde(rename = "from")]
    pub author: String,
    /// Raw message text.
    #[serde(rename = "message")]
    pub body: String,
    /// Pre-rendered markup for the message.
    #[serde(rename = "html")]
    pub rendered: String,
}

impl Message {
    /// Create a new message with a fresh ID, rendering it with `renderer`.
    #[must_use]
    pub fn new(author: impl Into<String>, body: impl Into<String>, renderer: &dyn Renderer) -> Self {
        let id = MessageId::generate();
        let author = author.into();
        let body = body.into();
        let rendered = renderer.render(&id, &author, &body);
        Self {
            id,
            author,
            body,
            rendered,
        }
    }
}

/// An ordered batch of messages, shared by every waiter it is delivered to.
pub type Batch = Arc<[Arc<Message>]>;

/// Turns a raw message into display markup.
///
/// The buffer treats the output as an opaque string.
pub trait Renderer: Send + Sync {
    /// Render the message with the given ID, author and body.
    fn render(&self, id: &MessageId, author: &str, body: &str) -> String;
}

/// Default renderer producing a single escaped `<div>` per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

impl Renderer for HtmlRenderer {
    fn render(&self, id: &MessageId, author: &str, body: &str) -> String {
        format!(
            r#"<div class="message" id="m{}"><b>{}: </b>{}</div>"#,
            id,
            escape_html(author),
            escape_html(body)
        )
    }
}

/// Escape the characters that are significant in HTML text and attributes.
#[must_use]
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("alice", "hello", &HtmlRenderer);
        assert_eq!(msg.author, "alice");
        assert_eq!(msg.body, "hello");
        assert!(msg.rendered.contains(&format!("id=\"m{}\"", msg.id)));
        assert!(msg.rendered.contains("<b>alice: </b>hello"));
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = MessageId::generate();
        let id2 = MessageId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_message_id_parse() {
        let id = MessageId::generate();
        let parsed: MessageId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("not-a-uuid".parse::<MessageId>().is_err());
        assert!("".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_html_renderer_escapes() {
        let msg = Message::new("<bob>", "a & b \"quoted\" 'x'", &HtmlRenderer);
        assert!(msg.rendered.contains("&lt;bob&gt;"));
        assert!(msg.rendered.contains("a &amp; b &quot;quoted&quot; &#39;x&#39;"));
        assert!(!msg.rendered.contains("<bob>"));
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::new("alice", "hi", &HtmlRenderer);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["id"], msg.id.to_string());
        assert_eq!(json["from"], "alice");
        assert_eq!(json["message"], "hi");
        assert_eq!(json["html"], msg.rendered);
    }

    #[test]
    fn test_custom_renderer() {
        struct Plain;
        impl Renderer for Plain {
            fn render(&self, _id: &MessageId, author: &str, body: &str) -> String {
                format!("{author}> {body}")
            }
        }

        let msg = Message::new("carol", "yo", &Plain);
        assert_eq!(msg.rendered, "carol> yo");
    }
}
