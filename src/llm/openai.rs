//! OpenAI-compatible provider over the `/chat/completions` endpoint.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::error::LlmError;

const PROVIDER: &str = "openai";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const MAX_ERROR_BODY_CHARS: usize = 256;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct OpenAiMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiResponse {
    pub choices: Vec<OpenAiChoice>,
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiChoice {
    pub message: OpenAiResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiResponseMessage {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

// ── Provider ────────────────────────────────────────────────────────

/// Chat-completions client for OpenAI and API-compatible servers.
pub struct OpenAiProvider {
    model: String,
    api_key: SecretString,
    endpoint: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(model: impl Into<String>, api_key: SecretString, base_url: &str) -> Self {
        Self {
            model: model.into(),
            api_key,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn build_request(model: &str, request: &CompletionRequest) -> OpenAiRequest {
    OpenAiRequest {
        model: model.to_string(),
        messages: request
            .messages
            .iter()
            .map(|m: &ChatMessage| OpenAiMessage {
                role: m.role.as_str(),
                content: m.content.clone(),
            })
            .collect(),
        temperature: request.temperature,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    }
}

pub fn parse_response(body: &str) -> Result<CompletionResponse, LlmError> {
    let resp: OpenAiResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: "missing choices[0]".into(),
        })?;

    let finish_reason = match choice.finish_reason.as_deref() {
        Some("stop") | None => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
    };

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        finish_reason,
        input_tokens: resp
            .usage
            .as_ref()
            .and_then(|u| u.prompt_tokens)
            .unwrap_or(0),
        output_tokens: resp
            .usage
            .as_ref()
            .and_then(|u| u.completion_tokens)
            .unwrap_or(0),
    })
}

/// Map a non-success status to an error, keeping a short body excerpt.
pub fn check_status(status: u16, body: &str) -> Result<(), LlmError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(LlmError::AuthFailed {
            provider: PROVIDER.into(),
        }),
        429 => Err(LlmError::RateLimited {
            provider: PROVIDER.into(),
        }),
        _ => {
            let excerpt: String = body
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            Err(LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("HTTP {status}: {excerpt}"),
            })
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let api_request = build_request(&self.model, &request);

        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header(
                "authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&api_request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        })?;
        check_status(status, &body)?;

        let parsed = parse_response(&body)?;
        debug!(
            model = %self.model,
            input_tokens = parsed.input_tokens,
            output_tokens = parsed.output_tokens,
            "Completion received"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_roles_and_defaults() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("classify"),
            ChatMessage::user("hello"),
        ])
        .with_temperature(0.0);

        let wire = serde_json::to_value(build_request("gpt-4o-mini", &request)).unwrap();
        assert_eq!(wire["model"], "gpt-4o-mini");
        assert_eq!(wire["messages"][0]["role"], "system");
        assert_eq!(wire["messages"][1]["content"], "hello");
        assert_eq!(wire["temperature"], 0.0);
        assert_eq!(wire["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn parses_first_choice_and_usage() {
        let body = r#"{
            "choices": [{"message": {"content": "{\"route\":\"concert\"}"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 9}
        }"#;
        let resp = parse_response(body).unwrap();
        assert_eq!(resp.content, r#"{"route":"concert"}"#);
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.input_tokens, 120);
        assert_eq!(resp.output_tokens, 9);
    }

    #[test]
    fn empty_choices_is_invalid() {
        let err = parse_response(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[test]
    fn status_mapping() {
        assert!(check_status(200, "").is_ok());
        assert!(matches!(
            check_status(401, ""),
            Err(LlmError::AuthFailed { .. })
        ));
        assert!(matches!(
            check_status(429, ""),
            Err(LlmError::RateLimited { .. })
        ));
        match check_status(500, "upstream\n  exploded") {
            Err(LlmError::RequestFailed { reason, .. }) => {
                assert_eq!(reason, "HTTP 500: upstream exploded")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn endpoint_joins_base_url() {
        let provider = OpenAiProvider::new(
            "gpt-4o-mini",
            SecretString::from("sk-test"),
            "http://localhost:8080/v1/",
        );
        assert_eq!(provider.endpoint(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(provider.model_name(), "gpt-4o-mini");
    }
}
