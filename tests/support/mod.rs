//! Shared helpers for integration tests: a gateway spawned on an ephemeral
//! port and webhook signature computation.
#![allow(dead_code)]

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use zapgate::Settings;
use zapgate::gateway::run_gateway_with_listener;

pub fn signature_header(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Spawn the full gateway (admission + worker) on an ephemeral port and wait
/// for /health. The task dies with the test process.
pub async fn spawn_gateway(settings: Settings) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_gateway_with_listener(listener, settings));

    let base_url = format!("http://{addr}");
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if let Ok(response) = client.get(format!("{base_url}/health")).send().await {
            if response.status().is_success() {
                return base_url;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("gateway did not become healthy at {base_url}");
}

/// Poll a wiremock server until it observed `expected` requests (or time out).
pub async fn wait_for_requests(server: &wiremock::MockServer, expected: usize) {
    for _ in 0..100 {
        let received = server
            .received_requests()
            .await
            .map_or(0, |requests| requests.len());
        if received >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let received = server
        .received_requests()
        .await
        .map_or(0, |requests| requests.len());
    panic!("expected {expected} provider requests, observed {received}");
}

pub fn text_webhook_payload(message_id: &str, from: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "entry-1",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "555000111222"},
                    "messages": [{
                        "id": message_id,
                        "from": from,
                        "timestamp": "1700000000",
                        "type": "text",
                        "text": {"body": text}
                    }]
                }
            }]
        }]
    })
}
