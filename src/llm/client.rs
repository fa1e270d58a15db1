//! Chat-completions client used by all pipeline stages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

const MAX_API_ERROR_CHARS: usize = 200;

/// Scrub bearer tokens and api keys from provider error text, then truncate.
pub fn sanitize_api_error(input: &str) -> String {
    let mut scrubbed = input.to_string();
    for marker in ["Bearer ", "api_key=", "\"api_key\":\"", "access_token="] {
        while let Some(start) = scrubbed.find(marker) {
            let content_start = start + marker.len();
            let end = scrubbed[content_start..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
                .map_or(scrubbed.len(), |rel| content_start + rel);
            if end == content_start {
                break;
            }
            scrubbed.replace_range(start..end, "[REDACTED]");
        }
    }

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }
    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &scrubbed[..end])
}

/// Stateless request/response capability every stage talks to.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
        model: &str,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiChatClient {
    base_url: String,
    /// Pre-computed `"Bearer <key>"` header value.
    cached_auth_header: Option<String>,
    client: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        OpenAiChatClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            cached_auth_header: api_key.map(|k| format!("Bearer {k}")),
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
        model: &str,
    ) -> Result<String, LlmError> {
        let auth_header = self
            .cached_auth_header
            .as_ref()
            .ok_or_else(|| LlmError::Request("LLM API key not set".into()))?;

        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system_prompt {
            messages.push(Message {
                role: "system",
                content: sys.to_string(),
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt.to_string(),
        });

        let request = ChatRequest {
            model: model.to_string(),
            messages,
            temperature: 0.2,
            max_tokens: 400,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", auth_header)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Request(sanitize_api_error(&e.to_string())))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!(
                "LLM API error ({status}): {}",
                sanitize_api_error(&body)
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("no choices in LLM response".into()))
    }
}
