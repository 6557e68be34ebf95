//! Normalized inbound events and the conversation key they hash under.

use serde::{Deserialize, Serialize};

use crate::util::normalize_text;

/// Unique pairing of a channel and a participant identifying one dialogue.
///
/// The unit of all per-conversation state: debounce buffers, echo records,
/// lock entries. Stable for the lifetime of a conversation and never reused
/// across participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub channel_id: String,
    pub participant_id: String,
}

impl ConversationKey {
    pub fn new(channel_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            participant_id: participant_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.participant_id)
    }
}

/// What kind of webhook event arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Message,
    /// Connectivity status string reported by the messaging gateway.
    StateChange(String),
    /// A label was applied to the conversation on the gateway side.
    LabelApplied(String),
}

/// A media attachment reference carried by an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub mime_type: Option<String>,
}

/// Quoted/reply-to reference: the quoted message id when the gateway sends
/// one, plus whatever quoted text rode along in the payload itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotedRef {
    pub message_id: Option<String>,
    pub body: Option<String>,
}

/// A webhook payload normalized at the channel boundary.
///
/// `message_id` is always a single string here; gateways that deliver it as
/// a structured object get it flattened before the event reaches the engine.
/// Ids are unique per gateway delivery but NOT across redeliveries, so every
/// consumer must stay idempotent.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel_id: String,
    pub kind: EventKind,
    pub message_id: String,
    pub from_id: String,
    pub to_id: String,
    pub body: String,
    pub media_refs: Vec<MediaRef>,
    /// The gateway's own fromMe-style flag.
    pub is_outbound_echo: bool,
    pub timestamp_secs: i64,
    pub quoted: Option<QuotedRef>,
    pub push_name: Option<String>,
}

impl InboundEvent {
    /// The conversation this event belongs to. For outbound-originated
    /// events the participant is the recipient, not the sender.
    pub fn conversation_key(&self) -> ConversationKey {
        let participant = if self.is_outbound_echo {
            &self.to_id
        } else {
            &self.from_id
        };
        ConversationKey::new(self.channel_id.clone(), participant.clone())
    }

    /// Normalized body used for echo and duplicate comparison.
    pub fn normalized_body(&self) -> String {
        normalize_text(&self.body)
    }

    /// Sender and recipient are the same identity (a self-chat, used by
    /// operators for notes-to-self and smoke tests).
    pub fn is_self_chat(&self) -> bool {
        !self.from_id.is_empty() && self.from_id == self.to_id
    }

    pub fn has_required_fields(&self) -> bool {
        match self.kind {
            EventKind::Message => {
                !self.channel_id.is_empty() && !self.message_id.is_empty() && !self.from_id.is_empty()
            }
            _ => !self.channel_id.is_empty(),
        }
    }
}

/// The classifier's verdict for one inbound event. Priority-ordered: the
/// first matching guard in [`super::classifier::EventClassifier`] wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    UserMessage,
    SelfEcho,
    AdminMessage,
    Duplicate,
    Backlog,
    Ignored,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::SelfEcho => "self_echo",
            Self::AdminMessage => "admin_message",
            Self::Duplicate => "duplicate",
            Self::Backlog => "backlog",
            Self::Ignored => "ignored",
        }
    }
}

/// Flatten a gateway message id that may arrive as a plain string or as a
/// structured object (`{"_serialized": "...", ...}`).
pub fn normalize_message_id(raw: &serde_json::Value) -> Option<String> {
    match raw {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(s)) = map.get("_serialized") {
                if !s.is_empty() {
                    return Some(s.clone());
                }
            }
            if let Some(serde_json::Value::String(s)) = map.get("id") {
                if !s.is_empty() {
                    return Some(s.clone());
                }
            }
            // Last resort: deterministic compact serialization of the object.
            serde_json::to_string(raw).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(from: &str, to: &str, from_me: bool) -> InboundEvent {
        InboundEvent {
            channel_id: "ch1".into(),
            kind: EventKind::Message,
            message_id: "m1".into(),
            from_id: from.into(),
            to_id: to.into(),
            body: "hi".into(),
            media_refs: vec![],
            is_outbound_echo: from_me,
            timestamp_secs: 1_700_000_000,
            quoted: None,
            push_name: None,
        }
    }

    #[test]
    fn conversation_key_uses_sender_for_inbound() {
        let ev = message("+111", "+999", false);
        assert_eq!(ev.conversation_key(), ConversationKey::new("ch1", "+111"));
    }

    #[test]
    fn conversation_key_uses_recipient_for_outbound() {
        let ev = message("+999", "+111", true);
        assert_eq!(ev.conversation_key(), ConversationKey::new("ch1", "+111"));
    }

    #[test]
    fn self_chat_detection() {
        assert!(message("+111", "+111", true).is_self_chat());
        assert!(!message("+111", "+222", true).is_self_chat());
    }

    #[test]
    fn required_fields_for_message() {
        let mut ev = message("+111", "+999", false);
        assert!(ev.has_required_fields());
        ev.message_id.clear();
        assert!(!ev.has_required_fields());
    }

    #[test]
    fn state_change_only_needs_channel() {
        let mut ev = message("", "", false);
        ev.kind = EventKind::StateChange("open".into());
        assert!(ev.has_required_fields());
    }

    #[test]
    fn message_id_from_string() {
        assert_eq!(
            normalize_message_id(&json!("ABCDEF")),
            Some("ABCDEF".to_string())
        );
        assert_eq!(normalize_message_id(&json!("")), None);
    }

    #[test]
    fn message_id_from_serialized_object() {
        let raw = json!({"fromMe": false, "_serialized": "false_123@c.us_ABC"});
        assert_eq!(
            normalize_message_id(&raw),
            Some("false_123@c.us_ABC".to_string())
        );
    }

    #[test]
    fn message_id_from_object_id_field() {
        let raw = json!({"id": "XYZ"});
        assert_eq!(normalize_message_id(&raw), Some("XYZ".to_string()));
    }

    #[test]
    fn message_id_object_without_known_fields_serializes() {
        let raw = json!({"remote": "123@c.us"});
        let id = normalize_message_id(&raw).unwrap();
        assert!(id.contains("remote"));
    }

    #[test]
    fn message_id_number_rejected() {
        assert_eq!(normalize_message_id(&json!(42)), None);
    }
}
