//! Outbound request/response models.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboundMessageType {
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
    Template,
}

impl OutboundMessageType {
    pub fn is_media(self) -> bool {
        matches!(
            self,
            OutboundMessageType::Image
                | OutboundMessageType::Video
                | OutboundMessageType::Audio
                | OutboundMessageType::Document
                | OutboundMessageType::Sticker
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InteractiveType {
    Button,
    List,
    Flow,
    CtaUrl,
    LocationRequestMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageCategory {
    Marketing,
    Utility,
    Authentication,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonSpec {
    pub id: String,
    pub title: String,
}

/// One outbound send request, deserialized from internal task bodies.
/// Fields are grouped per message type; validators enforce the disjoint
/// required sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessageRequest {
    pub to: String,
    pub message_type: OutboundMessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    // media
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_mime_type: Option<String>,

    // interactive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interactive_type: Option<InteractiveType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<ButtonSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_button_text: Option<String>,

    // flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_message_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_cta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_action: Option<String>,

    // cta_url
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta_display_text: Option<String>,

    // location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_address: Option<String>,

    // address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_zip_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_country_code: Option<String>,

    // contacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts_json: Option<String>,

    // reaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_emoji: Option<String>,

    // sticker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker_id: Option<String>,

    // template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<MessageCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_event_id: Option<String>,
}

impl OutboundMessageRequest {
    pub fn text(to: &str, text: &str, idempotency_key: &str) -> Self {
        OutboundMessageRequest {
            to: to.to_string(),
            message_type: OutboundMessageType::Text,
            text: Some(text.to_string()),
            idempotency_key: Some(idempotency_key.to_string()),
            ..Self::empty(to)
        }
    }

    fn empty(to: &str) -> Self {
        OutboundMessageRequest {
            to: to.to_string(),
            message_type: OutboundMessageType::Text,
            text: None,
            media_id: None,
            media_url: None,
            media_filename: None,
            media_mime_type: None,
            interactive_type: None,
            buttons: None,
            sections: None,
            header: None,
            footer: None,
            list_button_text: None,
            flow_id: None,
            flow_message_version: None,
            flow_token: None,
            flow_cta: None,
            flow_action: None,
            cta_url: None,
            cta_display_text: None,
            location_latitude: None,
            location_longitude: None,
            location_name: None,
            location_address: None,
            address_street: None,
            address_city: None,
            address_state: None,
            address_zip_code: None,
            address_country_code: None,
            contacts_json: None,
            reaction_message_id: None,
            reaction_emoji: None,
            sticker_id: None,
            template_name: None,
            template_language: None,
            category: None,
            idempotency_key: None,
            correlation_id: None,
            inbound_event_id: None,
        }
    }

    pub fn interactive_buttons(
        to: &str,
        body: &str,
        buttons: Vec<ButtonSpec>,
        idempotency_key: &str,
    ) -> Self {
        OutboundMessageRequest {
            message_type: OutboundMessageType::Interactive,
            interactive_type: Some(InteractiveType::Button),
            text: Some(body.to_string()),
            buttons: Some(buttons),
            idempotency_key: Some(idempotency_key.to_string()),
            ..Self::empty(to)
        }
    }
}

/// Dispatch result surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// True when the result came from the dedupe store, not a provider call.
    #[serde(default)]
    pub duplicate: bool,
}

impl OutboundMessageResponse {
    pub fn sent(message_id: &str) -> Self {
        OutboundMessageResponse {
            success: true,
            message_id: Some(message_id.to_string()),
            error_code: None,
            error_message: None,
            duplicate: false,
        }
    }

    pub fn already_sent(message_id: Option<&str>) -> Self {
        OutboundMessageResponse {
            success: true,
            message_id: message_id.map(str::to_string),
            error_code: None,
            error_message: None,
            duplicate: true,
        }
    }

    /// Failure response carrying the taxonomy code and error detail.
    pub fn failed(error: &crate::error::OutboundError) -> Self {
        OutboundMessageResponse {
            success: false,
            message_id: None,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
            duplicate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_constructor_sets_type_and_key() {
        let request = OutboundMessageRequest::text("+5511999999999", "Olá", "wamid.1");
        assert_eq!(request.message_type, OutboundMessageType::Text);
        assert_eq!(request.text.as_deref(), Some("Olá"));
        assert_eq!(request.idempotency_key.as_deref(), Some("wamid.1"));
    }

    #[test]
    fn request_deserializes_from_task_body() {
        let json = r#"{
            "to": "+5511999999999",
            "message_type": "interactive",
            "interactive_type": "button",
            "text": "Escolha",
            "buttons": [{"id": "a", "title": "Sim"}],
            "idempotency_key": "wamid.2"
        }"#;
        let request: OutboundMessageRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.message_type, OutboundMessageType::Interactive);
        assert_eq!(request.interactive_type, Some(InteractiveType::Button));
        assert_eq!(request.buttons.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn unknown_message_type_fails_deserialization() {
        let json = r#"{"to": "+55", "message_type": "carousel"}"#;
        assert!(serde_json::from_str::<OutboundMessageRequest>(json).is_err());
    }

    #[test]
    fn media_types_are_flagged() {
        assert!(OutboundMessageType::Image.is_media());
        assert!(!OutboundMessageType::Interactive.is_media());
    }

    #[test]
    fn interactive_type_snake_case() {
        use std::str::FromStr;
        assert_eq!(
            InteractiveType::from_str("location_request_message").unwrap(),
            InteractiveType::LocationRequestMessage
        );
        assert_eq!(InteractiveType::CtaUrl.to_string(), "cta_url");
    }

    #[test]
    fn already_sent_response_is_duplicate() {
        let response = OutboundMessageResponse::already_sent(Some("wamid.out"));
        assert!(response.success);
        assert!(response.duplicate);
        assert_eq!(response.message_id.as_deref(), Some("wamid.out"));
    }

    #[test]
    fn failed_response_carries_code_and_detail() {
        let error = crate::error::OutboundError::Retryable("HTTP 503".into());
        let response = OutboundMessageResponse::failed(&error);
        assert!(!response.success);
        assert_eq!(response.error_code.as_deref(), Some("WHATSAPP_RETRYABLE_ERROR"));
        assert!(response.error_message.as_deref().unwrap().contains("HTTP 503"));
        assert!(response.message_id.is_none());
    }

    #[test]
    fn failed_response_serializes_error_fields() {
        let error = crate::error::OutboundError::Permanent("HTTP 400".into());
        let json = serde_json::to_value(OutboundMessageResponse::failed(&error)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "WHATSAPP_PERMANENT_ERROR");
        assert!(json["error_message"].as_str().unwrap().contains("HTTP 400"));
        // success responses omit the error fields entirely
        let sent = serde_json::to_value(OutboundMessageResponse::sent("wamid.1")).unwrap();
        assert!(sent.get("error_code").is_none());
        assert!(sent.get("error_message").is_none());
    }
}
