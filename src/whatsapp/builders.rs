//! Payload builders — one per message type, emitting the provider's exact
//! wire structure. Builders truncate defensively; hard limits are enforced
//! earlier by the validators, so a builder error here means a validator bug.

use serde_json::{Value, json};

use super::models::{ButtonSpec, InteractiveType, OutboundMessageRequest, OutboundMessageType};
use super::validators::{
    MAX_BUTTON_TEXT_LENGTH, MAX_BUTTONS_PER_MESSAGE, MAX_CAPTION_LENGTH, MAX_HEADER_FOOTER_LENGTH,
    MAX_TEXT_LENGTH,
};
use crate::error::OutboundError;

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

fn base(to: &str, message_type: &str) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    map.insert("messaging_product".into(), json!("whatsapp"));
    map.insert("to".into(), json!(to));
    map.insert("type".into(), json!(message_type));
    map
}

pub fn build_text_payload(to: &str, text: &str) -> Result<Value, OutboundError> {
    let text = truncate(text.trim(), MAX_TEXT_LENGTH);
    if text.is_empty() {
        return Err(OutboundError::PayloadBuild(
            "text content cannot be empty".into(),
        ));
    }
    let mut payload = base(to, "text");
    payload.insert("text".into(), json!({"body": text}));
    Ok(Value::Object(payload))
}

fn media_block(request: &OutboundMessageRequest, with_caption: bool, with_filename: bool) -> Value {
    let mut block = serde_json::Map::new();
    if let Some(id) = &request.media_id {
        block.insert("id".into(), json!(id));
    } else if let Some(url) = &request.media_url {
        block.insert("link".into(), json!(url));
    }
    if with_caption {
        if let Some(caption) = request.text.as_deref().filter(|c| !c.is_empty()) {
            block.insert("caption".into(), json!(truncate(caption, MAX_CAPTION_LENGTH)));
        }
    }
    if with_filename {
        if let Some(filename) = &request.media_filename {
            block.insert("filename".into(), json!(filename));
        }
    }
    Value::Object(block)
}

fn build_media_payload(request: &OutboundMessageRequest) -> Result<Value, OutboundError> {
    let kind = request.message_type.to_string();
    let with_caption = matches!(
        request.message_type,
        OutboundMessageType::Image | OutboundMessageType::Video | OutboundMessageType::Document
    );
    let with_filename = request.message_type == OutboundMessageType::Document;
    let mut payload = base(&request.to, &kind);
    payload.insert(kind.clone(), media_block(request, with_caption, with_filename));
    Ok(Value::Object(payload))
}

fn action_buttons(buttons: &[ButtonSpec]) -> Value {
    let rendered: Vec<Value> = buttons
        .iter()
        .take(MAX_BUTTONS_PER_MESSAGE)
        .map(|button| {
            json!({
                "type": "reply",
                "reply": {
                    "id": button.id,
                    "title": truncate(&button.title, MAX_BUTTON_TEXT_LENGTH),
                }
            })
        })
        .collect();
    json!(rendered)
}

pub fn build_interactive_buttons_payload(
    to: &str,
    body: &str,
    buttons: &[ButtonSpec],
    header: Option<&str>,
    footer: Option<&str>,
) -> Result<Value, OutboundError> {
    if buttons.is_empty() || buttons.len() > MAX_BUTTONS_PER_MESSAGE {
        return Err(OutboundError::PayloadBuild(format!(
            "buttons count must be 1-{MAX_BUTTONS_PER_MESSAGE}, got {}",
            buttons.len()
        )));
    }
    let body = truncate(body.trim(), MAX_CAPTION_LENGTH);
    if body.is_empty() {
        return Err(OutboundError::PayloadBuild("body cannot be empty".into()));
    }

    let mut interactive = serde_json::Map::new();
    interactive.insert("type".into(), json!("button"));
    interactive.insert("body".into(), json!({"text": body}));
    interactive.insert("action".into(), json!({"buttons": action_buttons(buttons)}));
    if let Some(header) = header {
        interactive.insert(
            "header".into(),
            json!({"type": "text", "text": truncate(header.trim(), MAX_HEADER_FOOTER_LENGTH)}),
        );
    }
    if let Some(footer) = footer {
        interactive.insert(
            "footer".into(),
            json!({"text": truncate(footer.trim(), MAX_HEADER_FOOTER_LENGTH)}),
        );
    }

    let mut payload = base(to, "interactive");
    payload.insert("interactive".into(), Value::Object(interactive));
    Ok(Value::Object(payload))
}

fn build_interactive_list_payload(
    request: &OutboundMessageRequest,
) -> Result<Value, OutboundError> {
    let sections = request
        .sections
        .clone()
        .ok_or_else(|| OutboundError::PayloadBuild("sections cannot be empty".into()))?;
    let body = truncate(
        request.text.as_deref().unwrap_or_default().trim(),
        MAX_CAPTION_LENGTH,
    );
    if body.is_empty() {
        return Err(OutboundError::PayloadBuild("body cannot be empty".into()));
    }

    let button_text = truncate(
        request.list_button_text.as_deref().unwrap_or("Selecione"),
        MAX_BUTTON_TEXT_LENGTH,
    );

    let mut interactive = serde_json::Map::new();
    interactive.insert("type".into(), json!("list"));
    interactive.insert("body".into(), json!({"text": body}));
    interactive.insert(
        "action".into(),
        json!({"button": button_text, "sections": sections}),
    );
    if let Some(header) = &request.header {
        interactive.insert(
            "header".into(),
            json!({"type": "text", "text": truncate(header.trim(), MAX_HEADER_FOOTER_LENGTH)}),
        );
    }

    let mut payload = base(&request.to, "interactive");
    payload.insert("interactive".into(), Value::Object(interactive));
    Ok(Value::Object(payload))
}

fn build_interactive_flow_payload(
    request: &OutboundMessageRequest,
) -> Result<Value, OutboundError> {
    let body = truncate(
        request.text.as_deref().unwrap_or_default().trim(),
        MAX_CAPTION_LENGTH,
    );
    let mut interactive = serde_json::Map::new();
    interactive.insert("type".into(), json!("flow"));
    interactive.insert("body".into(), json!({"text": body}));
    interactive.insert(
        "action".into(),
        json!({
            "name": "flow",
            "parameters": {
                "flow_message_version": request.flow_message_version,
                "flow_token": request.flow_token,
                "flow_id": request.flow_id,
                "flow_cta": request.flow_cta,
                "flow_action": request.flow_action,
            }
        }),
    );

    let mut payload = base(&request.to, "interactive");
    payload.insert("interactive".into(), Value::Object(interactive));
    Ok(Value::Object(payload))
}

fn build_interactive_cta_url_payload(
    request: &OutboundMessageRequest,
) -> Result<Value, OutboundError> {
    let body = truncate(
        request.text.as_deref().unwrap_or_default().trim(),
        MAX_CAPTION_LENGTH,
    );
    let mut interactive = serde_json::Map::new();
    interactive.insert("type".into(), json!("cta_url"));
    interactive.insert("body".into(), json!({"text": body}));
    interactive.insert(
        "action".into(),
        json!({
            "name": "cta_url",
            "parameters": {
                "display_text": request.cta_display_text,
                "url": request.cta_url,
            }
        }),
    );

    let mut payload = base(&request.to, "interactive");
    payload.insert("interactive".into(), Value::Object(interactive));
    Ok(Value::Object(payload))
}

fn build_interactive_location_request_payload(
    request: &OutboundMessageRequest,
) -> Result<Value, OutboundError> {
    let body = truncate(
        request.text.as_deref().unwrap_or_default().trim(),
        MAX_CAPTION_LENGTH,
    );
    // action has name only, no buttons field
    let mut interactive = serde_json::Map::new();
    interactive.insert("type".into(), json!("location_request_message"));
    interactive.insert("body".into(), json!({"text": body}));
    interactive.insert("action".into(), json!({"name": "send_location"}));

    let mut payload = base(&request.to, "interactive");
    payload.insert("interactive".into(), Value::Object(interactive));
    Ok(Value::Object(payload))
}

pub fn build_reaction_payload(
    to: &str,
    message_id: &str,
    emoji: Option<&str>,
) -> Result<Value, OutboundError> {
    // single emoji only; anything longer falls back to thumbs-up
    let emoji = match emoji {
        Some(e) if !e.is_empty() && e.len() <= 8 && e.chars().count() <= 2 => e,
        _ => "👍",
    };
    let mut payload = base(to, "reaction");
    payload.insert(
        "reaction".into(),
        json!({"message_id": message_id, "emoji": emoji}),
    );
    Ok(Value::Object(payload))
}

pub fn build_sticker_payload(to: &str, sticker_id: &str) -> Result<Value, OutboundError> {
    if sticker_id.is_empty() {
        return Err(OutboundError::PayloadBuild("sticker id cannot be empty".into()));
    }
    let mut payload = base(to, "sticker");
    let block = if sticker_id.starts_with("http") {
        json!({"link": sticker_id})
    } else {
        json!({"id": sticker_id})
    };
    payload.insert("sticker".into(), block);
    Ok(Value::Object(payload))
}

fn build_location_payload(request: &OutboundMessageRequest) -> Result<Value, OutboundError> {
    let mut block = serde_json::Map::new();
    block.insert("latitude".into(), json!(request.location_latitude));
    block.insert("longitude".into(), json!(request.location_longitude));
    if let Some(name) = &request.location_name {
        block.insert("name".into(), json!(name));
    }
    if let Some(address) = &request.location_address {
        block.insert("address".into(), json!(address));
    }
    let mut payload = base(&request.to, "location");
    payload.insert("location".into(), Value::Object(block));
    Ok(Value::Object(payload))
}

fn build_address_payload(request: &OutboundMessageRequest) -> Result<Value, OutboundError> {
    let mut values = serde_json::Map::new();
    for (key, value) in [
        ("street", &request.address_street),
        ("city", &request.address_city),
        ("state", &request.address_state),
        ("zip_code", &request.address_zip_code),
        ("country_code", &request.address_country_code),
    ] {
        if let Some(value) = value {
            values.insert(key.into(), json!(value));
        }
    }
    let mut payload = base(&request.to, "address");
    payload.insert(
        "address".into(),
        json!({"body": request.text.as_deref().unwrap_or_default(), "values": values}),
    );
    Ok(Value::Object(payload))
}

fn build_contacts_payload(request: &OutboundMessageRequest) -> Result<Value, OutboundError> {
    let raw = request
        .contacts_json
        .as_deref()
        .ok_or_else(|| OutboundError::PayloadBuild("contacts_json missing".into()))?;
    let contacts: Value = serde_json::from_str(raw)
        .map_err(|e| OutboundError::PayloadBuild(format!("contacts_json invalid: {e}")))?;
    let mut payload = base(&request.to, "contacts");
    payload.insert("contacts".into(), contacts);
    Ok(Value::Object(payload))
}

fn build_template_payload(request: &OutboundMessageRequest) -> Result<Value, OutboundError> {
    let name = request
        .template_name
        .as_deref()
        .ok_or_else(|| OutboundError::PayloadBuild("template_name missing".into()))?;
    let language = request.template_language.as_deref().unwrap_or("pt_BR");
    let mut payload = base(&request.to, "template");
    payload.insert(
        "template".into(),
        json!({"name": name, "language": {"code": language}}),
    );
    Ok(Value::Object(payload))
}

/// Build the full provider payload for a validated request.
pub fn build_full_payload(request: &OutboundMessageRequest) -> Result<Value, OutboundError> {
    match request.message_type {
        OutboundMessageType::Text => {
            build_text_payload(&request.to, request.text.as_deref().unwrap_or_default())
        }
        t if t.is_media() && t != OutboundMessageType::Sticker => build_media_payload(request),
        OutboundMessageType::Sticker => {
            let sticker_id = request
                .sticker_id
                .as_deref()
                .or(request.media_id.as_deref())
                .or(request.media_url.as_deref())
                .unwrap_or_default();
            build_sticker_payload(&request.to, sticker_id)
        }
        OutboundMessageType::Interactive => match request.interactive_type {
            Some(InteractiveType::Button) => build_interactive_buttons_payload(
                &request.to,
                request.text.as_deref().unwrap_or_default(),
                request.buttons.as_deref().unwrap_or_default(),
                request.header.as_deref(),
                request.footer.as_deref(),
            ),
            Some(InteractiveType::List) => build_interactive_list_payload(request),
            Some(InteractiveType::Flow) => build_interactive_flow_payload(request),
            Some(InteractiveType::CtaUrl) => build_interactive_cta_url_payload(request),
            Some(InteractiveType::LocationRequestMessage) => {
                build_interactive_location_request_payload(request)
            }
            None => Err(OutboundError::PayloadBuild(
                "interactive_type missing".into(),
            )),
        },
        OutboundMessageType::Location => build_location_payload(request),
        OutboundMessageType::Address => build_address_payload(request),
        OutboundMessageType::Contacts => build_contacts_payload(request),
        OutboundMessageType::Reaction => build_reaction_payload(
            &request.to,
            request.reaction_message_id.as_deref().unwrap_or_default(),
            request.reaction_emoji.as_deref(),
        ),
        OutboundMessageType::Template => build_template_payload(request),
        _ => Err(OutboundError::PayloadBuild(format!(
            "no builder for {}",
            request.message_type
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_payload_matches_wire_format() {
        let payload = build_text_payload("+5511999999999", "Olá").unwrap();
        assert_eq!(
            payload,
            json!({
                "messaging_product": "whatsapp",
                "to": "+5511999999999",
                "type": "text",
                "text": {"body": "Olá"}
            })
        );
    }

    #[test]
    fn empty_text_is_a_build_error() {
        assert!(build_text_payload("+55", "   ").is_err());
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let payload = build_text_payload("+55", &"a".repeat(5000)).unwrap();
        let body = payload["text"]["body"].as_str().unwrap();
        assert_eq!(body.chars().count(), 4096);
        assert!(body.ends_with("..."));
    }

    #[test]
    fn interactive_buttons_match_wire_format() {
        let buttons = vec![
            ButtonSpec { id: "opt_1".into(), title: "Sim".into() },
            ButtonSpec { id: "opt_2".into(), title: "Não".into() },
        ];
        let payload =
            build_interactive_buttons_payload("+5511999999999", "Confirma?", &buttons, None, None)
                .unwrap();
        assert_eq!(payload["type"], "interactive");
        assert_eq!(payload["interactive"]["type"], "button");
        assert_eq!(payload["interactive"]["body"]["text"], "Confirma?");
        assert_eq!(
            payload["interactive"]["action"]["buttons"][0],
            json!({"type": "reply", "reply": {"id": "opt_1", "title": "Sim"}})
        );
    }

    #[test]
    fn interactive_header_and_footer_are_capped() {
        let buttons = vec![ButtonSpec { id: "a".into(), title: "Ok".into() }];
        let payload = build_interactive_buttons_payload(
            "+55",
            "corpo",
            &buttons,
            Some(&"h".repeat(100)),
            Some(&"f".repeat(100)),
        )
        .unwrap();
        assert_eq!(
            payload["interactive"]["header"]["text"]
                .as_str()
                .unwrap()
                .chars()
                .count(),
            60
        );
        assert_eq!(
            payload["interactive"]["footer"]["text"]
                .as_str()
                .unwrap()
                .chars()
                .count(),
            60
        );
    }

    #[test]
    fn too_many_buttons_is_a_build_error() {
        let buttons: Vec<ButtonSpec> = (0..4)
            .map(|i| ButtonSpec { id: format!("b{i}"), title: "x".into() })
            .collect();
        assert!(build_interactive_buttons_payload("+55", "corpo", &buttons, None, None).is_err());
    }

    #[test]
    fn location_request_action_has_name_and_no_buttons() {
        let mut request = OutboundMessageRequest::text("+5511999999999", "Onde você está?", "k");
        request.message_type = OutboundMessageType::Interactive;
        request.interactive_type = Some(InteractiveType::LocationRequestMessage);
        let payload = build_full_payload(&request).unwrap();
        assert_eq!(
            payload["interactive"]["action"],
            json!({"name": "send_location"})
        );
        assert!(payload["interactive"]["action"].get("buttons").is_none());
        assert_eq!(
            payload["interactive"]["type"],
            "location_request_message"
        );
    }

    #[test]
    fn flow_action_carries_all_parameters() {
        let mut request = OutboundMessageRequest::text("+5511999999999", "Preencha", "k");
        request.message_type = OutboundMessageType::Interactive;
        request.interactive_type = Some(InteractiveType::Flow);
        request.flow_id = Some("f1".into());
        request.flow_message_version = Some("3".into());
        request.flow_token = Some("tok".into());
        request.flow_cta = Some("Começar".into());
        request.flow_action = Some("navigate".into());

        let payload = build_full_payload(&request).unwrap();
        let params = &payload["interactive"]["action"]["parameters"];
        assert_eq!(payload["interactive"]["action"]["name"], "flow");
        assert_eq!(params["flow_id"], "f1");
        assert_eq!(params["flow_message_version"], "3");
        assert_eq!(params["flow_token"], "tok");
        assert_eq!(params["flow_cta"], "Começar");
        assert_eq!(params["flow_action"], "navigate");
    }

    #[test]
    fn reaction_payload_matches_wire_format() {
        let payload = build_reaction_payload("+55", "wamid.1", Some("🎉")).unwrap();
        assert_eq!(
            payload,
            json!({
                "messaging_product": "whatsapp",
                "to": "+55",
                "type": "reaction",
                "reaction": {"message_id": "wamid.1", "emoji": "🎉"}
            })
        );
    }

    #[test]
    fn invalid_emoji_defaults_to_thumbs_up() {
        let payload = build_reaction_payload("+55", "wamid.1", Some("not an emoji")).unwrap();
        assert_eq!(payload["reaction"]["emoji"], "👍");
    }

    #[test]
    fn sticker_id_vs_link() {
        let by_id = build_sticker_payload("+55", "media-123").unwrap();
        assert_eq!(by_id["sticker"], json!({"id": "media-123"}));

        let by_link = build_sticker_payload("+55", "https://cdn.example/s.webp").unwrap();
        assert_eq!(by_link["sticker"], json!({"link": "https://cdn.example/s.webp"}));
    }

    #[test]
    fn media_payload_uses_id_over_link() {
        let mut request = OutboundMessageRequest::text("+55", "legenda", "k");
        request.message_type = OutboundMessageType::Image;
        request.media_id = Some("media-1".into());
        request.media_url = Some("https://ignored".into());
        let payload = build_full_payload(&request).unwrap();
        assert_eq!(payload["image"]["id"], "media-1");
        assert!(payload["image"].get("link").is_none());
        assert_eq!(payload["image"]["caption"], "legenda");
    }

    #[test]
    fn document_payload_carries_filename() {
        let mut request = OutboundMessageRequest::text("+55", "", "k");
        request.text = None;
        request.message_type = OutboundMessageType::Document;
        request.media_id = Some("doc-1".into());
        request.media_filename = Some("contrato.pdf".into());
        let payload = build_full_payload(&request).unwrap();
        assert_eq!(payload["document"]["filename"], "contrato.pdf");
    }

    #[test]
    fn template_payload_defaults_language() {
        let mut request = OutboundMessageRequest::text("+55", "", "k");
        request.text = None;
        request.message_type = OutboundMessageType::Template;
        request.template_name = Some("welcome".into());
        let payload = build_full_payload(&request).unwrap();
        assert_eq!(payload["template"]["name"], "welcome");
        assert_eq!(payload["template"]["language"]["code"], "pt_BR");
    }

    #[test]
    fn contacts_json_is_embedded_verbatim() {
        let mut request = OutboundMessageRequest::text("+55", "", "k");
        request.text = None;
        request.message_type = OutboundMessageType::Contacts;
        request.contacts_json = Some(r#"[{"name":{"formatted_name":"Ana"}}]"#.into());
        let payload = build_full_payload(&request).unwrap();
        assert_eq!(payload["contacts"][0]["name"]["formatted_name"], "Ana");
    }
}
