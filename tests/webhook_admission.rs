//! Admission contract: verification handshake, signature enforcement and
//! replay dedupe, exercised over a live gateway.

mod support;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{signature_header, spawn_gateway, text_webhook_payload, wait_for_requests};
use zapgate::Settings;

const SECRET: &str = "admission-secret";

async fn provider_mock() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v19.0/555000111222/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({"messages": [{"id": "wamid.out"}]}),
        ))
        .mount(&server)
        .await;
    server
}

fn settings(provider: &MockServer) -> Settings {
    let mut settings = Settings::for_development();
    settings.webhook_secret = Some(SECRET.into());
    settings.verify_token = Some("verify-me".into());
    settings.phone_number_id = Some("555000111222".into());
    settings.access_token = Some("token".into());
    settings.whatsapp_api_base_url = provider.uri();
    settings.llm.enabled = false;
    settings
}

#[tokio::test]
async fn verification_handshake_echoes_challenge() {
    let provider = provider_mock().await;
    let base_url = spawn_gateway(settings(&provider)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!(
            "{base_url}/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "12345");

    let response = client
        .get(format!(
            "{base_url}/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn replayed_webhook_sends_exactly_once() {
    let provider = provider_mock().await;
    let base_url = spawn_gateway(settings(&provider)).await;
    let client = reqwest::Client::new();

    let body = text_webhook_payload("wamid.replay1", "5511999999999", "Olá").to_string();
    let signature = signature_header(SECRET, body.as_bytes());

    let first: serde_json::Value = client
        .post(format!("{base_url}/webhooks/whatsapp"))
        .header("X-Hub-Signature-256", &signature)
        .body(body.clone())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["ok"], true);
    assert_eq!(first["enqueued"], true);
    assert_eq!(first["inbound_event_id"], "wamid.replay1");
    assert_eq!(first["signature_validated"], true);

    let second: serde_json::Value = client
        .post(format!("{base_url}/webhooks/whatsapp"))
        .header("X-Hub-Signature-256", &signature)
        .body(body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["enqueued"], false);

    // exactly one provider send for the two deliveries
    wait_for_requests(&provider, 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(provider.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn tampered_body_is_rejected_without_side_effects() {
    let provider = provider_mock().await;
    let base_url = spawn_gateway(settings(&provider)).await;
    let client = reqwest::Client::new();

    let original = text_webhook_payload("wamid.tamper", "5511999999999", "Olá").to_string();
    let signature = signature_header(SECRET, original.as_bytes());
    let tampered = original.replace("Olá", "Oi!");

    let response = client
        .post(format!("{base_url}/webhooks/whatsapp"))
        .header("X-Hub-Signature-256", &signature)
        .body(tampered)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // replaying the original after the rejection still enqueues: the
    // rejected request must not have marked dedupe
    let response: serde_json::Value = client
        .post(format!("{base_url}/webhooks/whatsapp"))
        .header("X-Hub-Signature-256", &signature)
        .body(original)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["enqueued"], true);
}

#[tokio::test]
async fn missing_signature_is_unauthorized() {
    let provider = provider_mock().await;
    let base_url = spawn_gateway(settings(&provider)).await;

    let body = text_webhook_payload("wamid.nosig", "5511999999999", "Olá").to_string();
    let response = reqwest::Client::new()
        .post(format!("{base_url}/webhooks/whatsapp"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert!(provider.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_json_is_bad_request() {
    let provider = provider_mock().await;
    let base_url = spawn_gateway(settings(&provider)).await;

    let body = b"{not json".to_vec();
    let signature = signature_header(SECRET, &body);
    let response = reqwest::Client::new()
        .post(format!("{base_url}/webhooks/whatsapp"))
        .header("X-Hub-Signature-256", signature)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn status_update_payload_is_acknowledged() {
    let provider = provider_mock().await;
    let base_url = spawn_gateway(settings(&provider)).await;

    let body = serde_json::json!({
        "entry": [{"changes": [{"value": {"statuses": [{"id": "wamid.s", "status": "delivered"}]}}]}]
    })
    .to_string();
    let signature = signature_header(SECRET, body.as_bytes());

    let response: serde_json::Value = reqwest::Client::new()
        .post(format!("{base_url}/webhooks/whatsapp"))
        .header("X-Hub-Signature-256", signature)
        .body(body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["ok"], true);
    assert!(
        response["inbound_event_id"]
            .as_str()
            .unwrap()
            .starts_with("payload:")
    );
}
