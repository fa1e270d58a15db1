//! Conformance validation for outbound messages.
//!
//! `validate_outbound_request` is a pure function over the request with a
//! closed error enum; `validate_payload` is total over arbitrary JSON and
//! never raises. Limits follow the Meta wire contract.

use serde_json::Value;
use thiserror::Error;

use super::models::{InteractiveType, OutboundMessageRequest, OutboundMessageType};

pub const MAX_TEXT_LENGTH: usize = 4096;
pub const MAX_CAPTION_LENGTH: usize = 1024;
pub const MAX_BUTTON_TEXT_LENGTH: usize = 20;
pub const MAX_LIST_ITEMS: usize = 10;
pub const MAX_BUTTONS_PER_MESSAGE: usize = 3;
pub const MAX_HEADER_FOOTER_LENGTH: usize = 60;
pub const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 255;

const SUPPORTED_IMAGE_TYPES: [&str; 2] = ["image/jpeg", "image/png"];
const SUPPORTED_VIDEO_TYPES: [&str; 2] = ["video/mp4", "video/3gpp"];
const SUPPORTED_AUDIO_TYPES: [&str; 4] = ["audio/aac", "audio/mp4", "audio/amr", "audio/ogg"];
const SUPPORTED_DOCUMENT_TYPES: [&str; 7] = [
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
];

/// Closed validation error set. These are values, not exceptions: the
/// dispatcher converts them into `VALIDATION_ERROR` responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("recipient must be in E.164 format (e.g., +5511999999999)")]
    RecipientNotE164,

    #[error("{field} is required for {message_type} messages")]
    MissingField {
        field: &'static str,
        message_type: String,
    },

    #[error("{field} exceeds maximum length of {max}")]
    TooLong { field: &'static str, max: usize },

    #[error("at most {max} {field} allowed, got {got}")]
    TooMany {
        field: &'static str,
        max: usize,
        got: usize,
    },

    #[error("{field} not allowed for {interactive_type} interactive type")]
    FieldNotAllowed {
        field: &'static str,
        interactive_type: InteractiveType,
    },

    #[error("unsupported {message_type} MIME type: {mime_type}")]
    UnsupportedMimeType {
        message_type: String,
        mime_type: String,
    },

    #[error("location coordinates out of range")]
    CoordinatesOutOfRange,
}

fn is_e164(to: &str) -> bool {
    let Some(digits) = to.strip_prefix('+') else {
        return false;
    };
    (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn require_text<'a>(
    request: &'a OutboundMessageRequest,
    message_type: &str,
) -> Result<&'a str, ValidationError> {
    request
        .text
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or(ValidationError::MissingField {
            field: "text",
            message_type: message_type.to_string(),
        })
}

fn validate_text(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let text = require_text(request, "text")?;
    if text.chars().count() > MAX_TEXT_LENGTH || text.len() > MAX_TEXT_LENGTH {
        return Err(ValidationError::TooLong {
            field: "text",
            max: MAX_TEXT_LENGTH,
        });
    }
    Ok(())
}

fn validate_media(
    request: &OutboundMessageRequest,
    message_type: OutboundMessageType,
) -> Result<(), ValidationError> {
    if request.media_id.is_none() && request.media_url.is_none() {
        return Err(ValidationError::MissingField {
            field: "media_id or media_url",
            message_type: message_type.to_string(),
        });
    }

    if matches!(
        message_type,
        OutboundMessageType::Image | OutboundMessageType::Video | OutboundMessageType::Document
    ) {
        if let Some(caption) = request.text.as_deref() {
            if caption.chars().count() > MAX_CAPTION_LENGTH {
                return Err(ValidationError::TooLong {
                    field: "caption",
                    max: MAX_CAPTION_LENGTH,
                });
            }
        }
    }

    if let Some(mime_type) = request.media_mime_type.as_deref() {
        let supported: &[&str] = match message_type {
            OutboundMessageType::Image => &SUPPORTED_IMAGE_TYPES,
            OutboundMessageType::Video => &SUPPORTED_VIDEO_TYPES,
            OutboundMessageType::Audio => &SUPPORTED_AUDIO_TYPES,
            OutboundMessageType::Document => &SUPPORTED_DOCUMENT_TYPES,
            _ => return Ok(()),
        };
        if !supported.contains(&mime_type) {
            return Err(ValidationError::UnsupportedMimeType {
                message_type: message_type.to_string(),
                mime_type: mime_type.to_string(),
            });
        }
    }

    Ok(())
}

fn validate_button_interactive(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let buttons = request
        .buttons
        .as_deref()
        .filter(|b| !b.is_empty())
        .ok_or(ValidationError::MissingField {
            field: "buttons",
            message_type: "interactive/button".to_string(),
        })?;

    if buttons.len() > MAX_BUTTONS_PER_MESSAGE {
        return Err(ValidationError::TooMany {
            field: "buttons",
            max: MAX_BUTTONS_PER_MESSAGE,
            got: buttons.len(),
        });
    }

    for button in buttons {
        check_len("button title", &button.title, MAX_BUTTON_TEXT_LENGTH)?;
    }
    Ok(())
}

fn validate_list_interactive(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let rows = request
        .sections
        .as_ref()
        .and_then(Value::as_array)
        .map(|sections| {
            sections
                .iter()
                .map(|s| {
                    s.get("rows")
                        .and_then(Value::as_array)
                        .map_or(0, Vec::len)
                })
                .sum::<usize>()
        })
        .unwrap_or(0);

    if rows == 0 {
        return Err(ValidationError::MissingField {
            field: "sections",
            message_type: "interactive/list".to_string(),
        });
    }
    if rows > MAX_LIST_ITEMS {
        return Err(ValidationError::TooMany {
            field: "list rows",
            max: MAX_LIST_ITEMS,
            got: rows,
        });
    }
    Ok(())
}

fn validate_flow_interactive(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    for (field, value) in [
        ("flow_id", &request.flow_id),
        ("flow_message_version", &request.flow_message_version),
        ("flow_token", &request.flow_token),
        ("flow_cta", &request.flow_cta),
        ("flow_action", &request.flow_action),
    ] {
        if value.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::MissingField {
                field,
                message_type: "interactive/flow".to_string(),
            });
        }
    }
    check_len(
        "flow_cta",
        request.flow_cta.as_deref().unwrap_or_default(),
        MAX_BUTTON_TEXT_LENGTH,
    )
}

fn validate_cta_url_interactive(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    if request.cta_url.as_deref().map_or(true, str::is_empty) {
        return Err(ValidationError::MissingField {
            field: "cta_url",
            message_type: "interactive/cta_url".to_string(),
        });
    }
    let display = request
        .cta_display_text
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(ValidationError::MissingField {
            field: "cta_display_text",
            message_type: "interactive/cta_url".to_string(),
        })?;
    check_len("cta_display_text", display, MAX_BUTTON_TEXT_LENGTH)?;

    if request.buttons.as_deref().is_some_and(|b| !b.is_empty()) {
        return Err(ValidationError::FieldNotAllowed {
            field: "buttons",
            interactive_type: InteractiveType::CtaUrl,
        });
    }
    Ok(())
}

fn validate_location_request_interactive(
    request: &OutboundMessageRequest,
) -> Result<(), ValidationError> {
    if request.buttons.as_deref().is_some_and(|b| !b.is_empty()) {
        return Err(ValidationError::FieldNotAllowed {
            field: "buttons",
            interactive_type: InteractiveType::LocationRequestMessage,
        });
    }
    Ok(())
}

fn validate_interactive(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let interactive_type = request
        .interactive_type
        .ok_or(ValidationError::MissingField {
            field: "interactive_type",
            message_type: "interactive".to_string(),
        })?;

    let body = require_text(request, "interactive")?;
    if body.chars().count() > MAX_TEXT_LENGTH {
        return Err(ValidationError::TooLong {
            field: "text",
            max: MAX_TEXT_LENGTH,
        });
    }

    if let Some(header) = request.header.as_deref() {
        check_len("header", header, MAX_HEADER_FOOTER_LENGTH)?;
    }
    if let Some(footer) = request.footer.as_deref() {
        check_len("footer", footer, MAX_HEADER_FOOTER_LENGTH)?;
    }

    match interactive_type {
        InteractiveType::Button => validate_button_interactive(request),
        InteractiveType::List => validate_list_interactive(request),
        InteractiveType::Flow => validate_flow_interactive(request),
        InteractiveType::CtaUrl => validate_cta_url_interactive(request),
        InteractiveType::LocationRequestMessage => validate_location_request_interactive(request),
    }
}

fn validate_location(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let (Some(lat), Some(lon)) = (request.location_latitude, request.location_longitude) else {
        return Err(ValidationError::MissingField {
            field: "location_latitude and location_longitude",
            message_type: "location".to_string(),
        });
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(ValidationError::CoordinatesOutOfRange);
    }
    Ok(())
}

fn validate_address(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let any = [
        &request.address_street,
        &request.address_city,
        &request.address_state,
        &request.address_zip_code,
        &request.address_country_code,
    ]
    .iter()
    .any(|f| f.is_some());
    if !any {
        return Err(ValidationError::MissingField {
            field: "at least one address field",
            message_type: "address".to_string(),
        });
    }
    Ok(())
}

fn validate_reaction(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    if request.reaction_message_id.as_deref().map_or(true, str::is_empty) {
        return Err(ValidationError::MissingField {
            field: "reaction_message_id",
            message_type: "reaction".to_string(),
        });
    }
    Ok(())
}

fn validate_contacts(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    if request.contacts_json.as_deref().map_or(true, str::is_empty) {
        return Err(ValidationError::MissingField {
            field: "contacts_json",
            message_type: "contacts".to_string(),
        });
    }
    Ok(())
}

fn validate_sticker(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    if request.sticker_id.is_none()
        && request.media_id.is_none()
        && request.media_url.is_none()
    {
        return Err(ValidationError::MissingField {
            field: "sticker_id, media_id or media_url",
            message_type: "sticker".to_string(),
        });
    }
    Ok(())
}

fn validate_template(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    let name = request
        .template_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or(ValidationError::MissingField {
            field: "template_name",
            message_type: "template".to_string(),
        })?;
    if name.len() > 512 {
        return Err(ValidationError::TooLong {
            field: "template_name",
            max: 512,
        });
    }
    Ok(())
}

/// Validate an outbound request against the Meta contract.
pub fn validate_outbound_request(
    request: &OutboundMessageRequest,
) -> Result<(), ValidationError> {
    if !is_e164(&request.to) {
        return Err(ValidationError::RecipientNotE164);
    }

    match request.message_type {
        OutboundMessageType::Text => validate_text(request)?,
        t if t.is_media() && t != OutboundMessageType::Sticker => validate_media(request, t)?,
        OutboundMessageType::Sticker => {
            validate_sticker(request)?;
            validate_media_mime_only(request)?;
        }
        OutboundMessageType::Interactive => validate_interactive(request)?,
        OutboundMessageType::Location => validate_location(request)?,
        OutboundMessageType::Address => validate_address(request)?,
        OutboundMessageType::Contacts => validate_contacts(request)?,
        OutboundMessageType::Reaction => validate_reaction(request)?,
        OutboundMessageType::Template => validate_template(request)?,
        _ => {}
    }

    if let Some(key) = request.idempotency_key.as_deref() {
        if key.len() > MAX_IDEMPOTENCY_KEY_LENGTH {
            return Err(ValidationError::TooLong {
                field: "idempotency_key",
                max: MAX_IDEMPOTENCY_KEY_LENGTH,
            });
        }
    }

    Ok(())
}

fn validate_media_mime_only(request: &OutboundMessageRequest) -> Result<(), ValidationError> {
    if let Some(mime_type) = request.media_mime_type.as_deref() {
        if mime_type != "image/webp" {
            return Err(ValidationError::UnsupportedMimeType {
                message_type: "sticker".to_string(),
                mime_type: mime_type.to_string(),
            });
        }
    }
    Ok(())
}

/// Validate a built wire payload. Total: returns `(ok, message)` for every
/// input, never raises.
pub fn validate_payload(payload: &Value) -> (bool, String) {
    let Some(object) = payload.as_object() else {
        return (false, "payload must be a non-empty object".to_string());
    };
    if object.is_empty() {
        return (false, "payload must be a non-empty object".to_string());
    }

    if payload.get("messaging_product").and_then(Value::as_str) != Some("whatsapp") {
        return (false, "messaging_product must be 'whatsapp'".to_string());
    }
    if payload.get("to").and_then(Value::as_str).is_none() {
        return (false, "missing required field: 'to'".to_string());
    }
    let Some(message_type) = payload.get("type").and_then(Value::as_str) else {
        return (false, "missing required field: 'type'".to_string());
    };

    let required_block = match message_type {
        "text" => {
            if payload
                .get("text")
                .and_then(|t| t.get("body"))
                .and_then(Value::as_str)
                .is_none()
            {
                return (false, "text message must have text.body".to_string());
            }
            None
        }
        "interactive" => Some("interactive"),
        "reaction" => Some("reaction"),
        "sticker" => Some("sticker"),
        "image" | "video" | "audio" | "document" | "location" | "address" | "contacts"
        | "template" => Some(message_type),
        other => return (false, format!("invalid message type: {other}")),
    };

    if let Some(block) = required_block {
        if payload.get(block).is_none() {
            return (false, format!("{message_type} message must have {block} field"));
        }
    }

    (true, "OK".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whatsapp::models::ButtonSpec;
    use serde_json::json;

    fn text_request(text: &str) -> OutboundMessageRequest {
        OutboundMessageRequest::text("+5511999999999", text, "wamid.1")
    }

    #[test]
    fn valid_text_request_passes() {
        assert!(validate_outbound_request(&text_request("Olá!")).is_ok());
    }

    #[test]
    fn recipient_must_be_e164() {
        let mut request = text_request("oi");
        request.to = "5511999999999".into();
        assert_eq!(
            validate_outbound_request(&request),
            Err(ValidationError::RecipientNotE164)
        );

        request.to = "+55abc".into();
        assert_eq!(
            validate_outbound_request(&request),
            Err(ValidationError::RecipientNotE164)
        );
    }

    #[test]
    fn text_over_4096_chars_is_rejected() {
        let request = text_request(&"a".repeat(4097));
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::TooLong { field: "text", .. })
        ));
    }

    #[test]
    fn text_over_4096_bytes_is_rejected() {
        // 2048 two-byte chars = 4096 bytes, ok; 2049 = 4098 bytes, too long
        let request = text_request(&"é".repeat(2049));
        assert!(validate_outbound_request(&request).is_err());
    }

    #[test]
    fn empty_text_is_missing() {
        let request = text_request("   ");
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::MissingField { field: "text", .. })
        ));
    }

    #[test]
    fn media_requires_id_or_url() {
        let mut request = text_request("legenda");
        request.message_type = OutboundMessageType::Image;
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::MissingField { .. })
        ));

        request.media_id = Some("media-1".into());
        assert!(validate_outbound_request(&request).is_ok());
    }

    #[test]
    fn caption_limit_applies_to_media() {
        let mut request = text_request(&"a".repeat(1025));
        request.message_type = OutboundMessageType::Image;
        request.media_id = Some("media-1".into());
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::TooLong { field: "caption", .. })
        ));
    }

    #[test]
    fn unsupported_mime_type_is_rejected() {
        let mut request = text_request("");
        request.text = None;
        request.message_type = OutboundMessageType::Image;
        request.media_id = Some("media-1".into());
        request.media_mime_type = Some("image/gif".into());
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::UnsupportedMimeType { .. })
        ));
    }

    #[test]
    fn buttons_capped_at_three() {
        let buttons: Vec<ButtonSpec> = (0..4)
            .map(|i| ButtonSpec {
                id: format!("b{i}"),
                title: "Ok".into(),
            })
            .collect();
        let request = OutboundMessageRequest::interactive_buttons(
            "+5511999999999",
            "Escolha",
            buttons,
            "wamid.1",
        );
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::TooMany { field: "buttons", .. })
        ));
    }

    #[test]
    fn button_title_capped_at_twenty() {
        let request = OutboundMessageRequest::interactive_buttons(
            "+5511999999999",
            "Escolha",
            vec![ButtonSpec {
                id: "b1".into(),
                title: "Um título de botão comprido demais".into(),
            }],
            "wamid.1",
        );
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::TooLong { field: "button title", .. })
        ));
    }

    #[test]
    fn flow_requires_all_five_fields() {
        let mut request = text_request("corpo");
        request.message_type = OutboundMessageType::Interactive;
        request.interactive_type = Some(InteractiveType::Flow);
        request.flow_id = Some("f1".into());
        request.flow_message_version = Some("3".into());
        request.flow_token = Some("tok".into());
        request.flow_cta = Some("Começar".into());
        // flow_action missing
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::MissingField { field: "flow_action", .. })
        ));

        request.flow_action = Some("navigate".into());
        assert!(validate_outbound_request(&request).is_ok());
    }

    #[test]
    fn cta_url_forbids_buttons() {
        let mut request = text_request("corpo");
        request.message_type = OutboundMessageType::Interactive;
        request.interactive_type = Some(InteractiveType::CtaUrl);
        request.cta_url = Some("https://example.com".into());
        request.cta_display_text = Some("Abrir".into());
        request.buttons = Some(vec![ButtonSpec {
            id: "b1".into(),
            title: "Não".into(),
        }]);
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::FieldNotAllowed { field: "buttons", .. })
        ));
    }

    #[test]
    fn location_request_forbids_buttons() {
        let mut request = text_request("onde você está?");
        request.message_type = OutboundMessageType::Interactive;
        request.interactive_type = Some(InteractiveType::LocationRequestMessage);
        request.buttons = Some(vec![ButtonSpec {
            id: "b1".into(),
            title: "Aqui".into(),
        }]);
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::FieldNotAllowed { .. })
        ));

        request.buttons = None;
        assert!(validate_outbound_request(&request).is_ok());
    }

    #[test]
    fn list_rows_capped_at_ten() {
        let mut request = text_request("escolha");
        request.message_type = OutboundMessageType::Interactive;
        request.interactive_type = Some(InteractiveType::List);
        let rows: Vec<Value> = (0..11).map(|i| json!({"id": i, "title": "r"})).collect();
        request.sections = Some(json!([{"title": "s", "rows": rows}]));
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::TooMany { field: "list rows", .. })
        ));
    }

    #[test]
    fn location_coordinates_are_bounded() {
        let mut request = text_request("");
        request.text = None;
        request.message_type = OutboundMessageType::Location;
        request.location_latitude = Some(91.0);
        request.location_longitude = Some(0.0);
        assert_eq!(
            validate_outbound_request(&request),
            Err(ValidationError::CoordinatesOutOfRange)
        );
    }

    #[test]
    fn idempotency_key_capped_at_255() {
        let mut request = text_request("oi");
        request.idempotency_key = Some("k".repeat(256));
        assert!(matches!(
            validate_outbound_request(&request),
            Err(ValidationError::TooLong { field: "idempotency_key", .. })
        ));
    }

    #[test]
    fn validate_payload_is_total() {
        for payload in [
            json!(null),
            json!([]),
            json!({}),
            json!({"messaging_product": "telegram"}),
            json!({"messaging_product": "whatsapp"}),
            json!({"messaging_product": "whatsapp", "to": "+55"}),
            json!({"messaging_product": "whatsapp", "to": "+55", "type": "carousel"}),
            json!({"messaging_product": "whatsapp", "to": "+55", "type": "text"}),
        ] {
            let (ok, message) = validate_payload(&payload);
            assert!(!ok);
            assert!(!message.is_empty());
        }

        let (ok, message) = validate_payload(&json!({
            "messaging_product": "whatsapp",
            "to": "+5511999999999",
            "type": "text",
            "text": {"body": "Olá"}
        }));
        assert!(ok);
        assert_eq!(message, "OK");
    }

    #[test]
    fn validate_payload_checks_type_block() {
        let (ok, message) = validate_payload(&json!({
            "messaging_product": "whatsapp",
            "to": "+55",
            "type": "interactive"
        }));
        assert!(!ok);
        assert!(message.contains("interactive"));
    }
}
