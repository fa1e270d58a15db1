//! Normalized inbound message.
//!
//! Created once by the webhook normalizer and read-only afterwards. The body
//! is a tagged union carrying only the fields valid for its type.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Closed set of provider message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Address,
    Contacts,
    Interactive,
    Reaction,
    Button,
    Order,
    System,
    Unknown,
}

impl MessageType {
    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageType::Image
                | MessageType::Video
                | MessageType::Audio
                | MessageType::Document
                | MessageType::Sticker
        )
    }
}

/// Type-specific payload of an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        body: String,
    },
    Media {
        media_id: Option<String>,
        media_url: Option<String>,
        filename: Option<String>,
        mime_type: Option<String>,
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Address {
        street: Option<String>,
        city: Option<String>,
        state: Option<String>,
        zip_code: Option<String>,
        country_code: Option<String>,
    },
    Contacts {
        contacts_json: String,
    },
    InteractiveReply {
        interactive_type: Option<String>,
        button_id: Option<String>,
        list_id: Option<String>,
        cta_url: Option<String>,
    },
    Reaction {
        message_id: Option<String>,
        emoji: Option<String>,
    },
    /// Button template replies, order/system notifications and unknown types
    /// carry no structured fields the pipeline acts on.
    Empty,
}

/// Immutable message normalized from the provider webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-assigned id, unique per provider.
    pub message_id: String,
    /// Conversation key (the sender's wa_id).
    pub chat_id: String,
    /// Recipient address for the reply.
    pub from_number: String,
    /// Provider-assigned epoch seconds.
    pub timestamp: i64,
    pub message_type: MessageType,
    pub body: MessageBody,
}

impl InboundMessage {
    /// Text content the decision pipeline operates on, if any. Interactive
    /// replies surface the chosen option id as the user's input.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { body } => Some(body),
            MessageBody::Media { caption, .. } => caption.as_deref(),
            MessageBody::InteractiveReply {
                button_id, list_id, ..
            } => button_id.as_deref().or(list_id.as_deref()),
            _ => None,
        }
    }

    /// Message kinds the conversation pipeline does not act on.
    pub fn is_actionable(&self) -> bool {
        !matches!(
            self.message_type,
            MessageType::Unknown
                | MessageType::System
                | MessageType::Order
                | MessageType::Reaction
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn text_message(body: &str) -> InboundMessage {
        InboundMessage {
            message_id: "wamid.1".into(),
            chat_id: "5511999999999".into(),
            from_number: "5511999999999".into(),
            timestamp: 1_700_000_000,
            message_type: MessageType::Text,
            body: MessageBody::Text { body: body.into() },
        }
    }

    #[test]
    fn message_type_parses_snake_case() {
        assert_eq!(MessageType::from_str("text").unwrap(), MessageType::Text);
        assert_eq!(
            MessageType::from_str("interactive").unwrap(),
            MessageType::Interactive
        );
        assert!(MessageType::from_str("carousel").is_err());
    }

    #[test]
    fn media_types_are_media() {
        assert!(MessageType::Image.is_media());
        assert!(MessageType::Sticker.is_media());
        assert!(!MessageType::Text.is_media());
        assert!(!MessageType::Reaction.is_media());
    }

    #[test]
    fn text_accessor_reads_body() {
        assert_eq!(text_message("Olá").text(), Some("Olá"));
    }

    #[test]
    fn text_accessor_reads_media_caption() {
        let msg = InboundMessage {
            message_type: MessageType::Image,
            body: MessageBody::Media {
                media_id: Some("m1".into()),
                media_url: None,
                filename: None,
                mime_type: Some("image/jpeg".into()),
                caption: Some("a photo".into()),
            },
            ..text_message("")
        };
        assert_eq!(msg.text(), Some("a photo"));
    }

    #[test]
    fn interactive_reply_surfaces_option_id() {
        let msg = InboundMessage {
            message_type: MessageType::Interactive,
            body: MessageBody::InteractiveReply {
                interactive_type: Some("button_reply".into()),
                button_id: Some("opt_confirm".into()),
                list_id: None,
                cta_url: None,
            },
            ..text_message("")
        };
        assert_eq!(msg.text(), Some("opt_confirm"));
        assert!(msg.is_actionable());
    }

    #[test]
    fn system_and_unknown_are_not_actionable() {
        for message_type in [
            MessageType::Unknown,
            MessageType::System,
            MessageType::Order,
            MessageType::Reaction,
        ] {
            let msg = InboundMessage {
                message_type,
                body: MessageBody::Empty,
                ..text_message("")
            };
            assert!(!msg.is_actionable(), "{message_type} should be absorbed");
        }
        assert!(text_message("oi").is_actionable());
    }

    #[test]
    fn reaction_has_no_text() {
        let msg = InboundMessage {
            message_type: MessageType::Reaction,
            body: MessageBody::Reaction {
                message_id: Some("wamid.0".into()),
                emoji: Some("👍".into()),
            },
            ..text_message("")
        };
        assert_eq!(msg.text(), None);
    }
}
