//! Webhook payload normalizer.
//!
//! Walks the provider's `entry[].changes[].value.messages[]` structure and
//! produces immutable `InboundMessage` values. Unknown message types are kept
//! (as `MessageType::Unknown` with an empty body) and logged, never silently
//! dropped.

use std::str::FromStr;

use serde_json::Value;
use tracing::info;

use crate::domain::{InboundMessage, MessageBody, MessageType};

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn extract_text(msg: &Value) -> MessageBody {
    MessageBody::Text {
        body: msg
            .get("text")
            .and_then(|t| t.get("body"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn extract_media(msg: &Value, message_type: MessageType) -> MessageBody {
    let key = message_type.to_string();
    let block = msg.get(&key).cloned().unwrap_or(Value::Null);
    MessageBody::Media {
        media_id: str_field(&block, "id"),
        media_url: str_field(&block, "url"),
        filename: str_field(&block, "filename"),
        mime_type: str_field(&block, "mime_type"),
        caption: str_field(&block, "caption"),
    }
}

fn extract_location(msg: &Value) -> Option<MessageBody> {
    let block = msg.get("location")?;
    Some(MessageBody::Location {
        latitude: block.get("latitude")?.as_f64()?,
        longitude: block.get("longitude")?.as_f64()?,
        name: str_field(block, "name"),
        address: str_field(block, "address"),
    })
}

fn extract_address(msg: &Value) -> MessageBody {
    let block = msg.get("address").cloned().unwrap_or(Value::Null);
    MessageBody::Address {
        street: str_field(&block, "street"),
        city: str_field(&block, "city"),
        state: str_field(&block, "state"),
        zip_code: str_field(&block, "zip_code"),
        country_code: str_field(&block, "country_code"),
    }
}

fn extract_contacts(msg: &Value) -> MessageBody {
    let contacts = msg.get("contacts").cloned().unwrap_or(Value::Null);
    match &contacts {
        Value::Array(list) if !list.is_empty() => MessageBody::Contacts {
            contacts_json: contacts.to_string(),
        },
        _ => MessageBody::Empty,
    }
}

fn extract_interactive(msg: &Value) -> MessageBody {
    let block = msg.get("interactive").cloned().unwrap_or(Value::Null);
    let button_id = block
        .get("button_reply")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let list_id = block
        .get("list_reply")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let cta_url = block
        .get("cta_url_reply")
        .and_then(|r| r.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string);
    MessageBody::InteractiveReply {
        interactive_type: str_field(&block, "type"),
        button_id,
        list_id,
        cta_url,
    }
}

fn extract_reaction(msg: &Value) -> MessageBody {
    let block = msg.get("reaction").cloned().unwrap_or(Value::Null);
    MessageBody::Reaction {
        message_id: str_field(&block, "message_id"),
        emoji: str_field(&block, "emoji"),
    }
}

fn body_for(msg: &Value, message_type: MessageType) -> MessageBody {
    match message_type {
        MessageType::Text => extract_text(msg),
        t if t.is_media() => extract_media(msg, t),
        MessageType::Location => extract_location(msg).unwrap_or(MessageBody::Empty),
        MessageType::Address => extract_address(msg),
        MessageType::Contacts => extract_contacts(msg),
        MessageType::Interactive => extract_interactive(msg),
        MessageType::Reaction => extract_reaction(msg),
        _ => MessageBody::Empty,
    }
}

/// Extract all messages from a raw webhook payload.
///
/// Entries without a message id are skipped; status-update payloads yield an
/// empty vec.
pub fn extract_messages(payload: &Value) -> Vec<InboundMessage> {
    let mut messages = Vec::new();

    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for entry in &entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in &changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let Some(raw_messages) = value.get("messages").and_then(Value::as_array) else {
                continue;
            };

            for msg in raw_messages {
                let Some(message_id) = msg.get("id").and_then(Value::as_str) else {
                    continue;
                };
                let from = msg.get("from").and_then(Value::as_str).unwrap_or_default();
                let timestamp = msg
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse::<i64>().ok())
                    .or_else(|| msg.get("timestamp").and_then(Value::as_i64))
                    .unwrap_or(0);

                let raw_type = msg.get("type").and_then(Value::as_str).unwrap_or("unknown");
                let message_type = MessageType::from_str(raw_type).unwrap_or_else(|_| {
                    info!(message_type = raw_type, "unsupported_message_type_received");
                    MessageType::Unknown
                });

                messages.push(InboundMessage {
                    message_id: message_id.to_string(),
                    chat_id: from.to_string(),
                    from_number: from.to_string(),
                    timestamp,
                    message_type,
                    body: body_for(msg, message_type),
                });
            }
        }
    }

    messages
}

/// First `messages[].id` in the payload, if any. Used for the inbound
/// idempotency key.
pub fn first_message_id(payload: &Value) -> Option<String> {
    payload
        .get("entry")?
        .as_array()?
        .iter()
        .flat_map(|e| {
            e.get("changes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .find_map(|change| {
            change
                .get("value")?
                .get("messages")?
                .as_array()?
                .first()?
                .get("id")?
                .as_str()
                .map(str::to_string)
        })
}
