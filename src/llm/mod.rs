//! LLM integration for MailMaestro.
//!
//! The model is one optional collaborator of the classifier and the
//! extractors. It is reached through the `LlmProvider` trait so tests can
//! swap in a scripted provider.

pub mod openai;
pub mod provider;
pub mod triage;

pub use openai::OpenAiProvider;
pub use provider::*;
pub use triage::{ExtractionKind, LlmClassificationPolicy, LlmExtractor};

use std::sync::Arc;

use secrecy::SecretString;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    /// Read LLM settings from the environment. `None` when no key is set.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())?;
        Some(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("MAILMAESTRO_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into()),
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    tracing::info!(
        model = %config.model,
        base_url = %config.base_url,
        "Using OpenAI-compatible provider"
    );
    Arc::new(OpenAiProvider::new(
        &config.model,
        config.api_key.clone(),
        &config.base_url,
    ))
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_keeps_model_name() {
        let config = LlmConfig {
            api_key: SecretString::from("sk-test"),
            model: "gpt-4o".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        };
        assert_eq!(create_provider(&config).model_name(), "gpt-4o");
    }

    #[test]
    fn json_from_fenced_block() {
        let raw = "Sure!\n```json\n{\"route\": \"concert\"}\n```";
        assert_eq!(extract_json_object(raw), "{\"route\": \"concert\"}");
    }

    #[test]
    fn json_from_surrounding_prose() {
        let raw = "Here you go: {\"items\": []} hope that helps";
        assert_eq!(extract_json_object(raw), "{\"items\": []}");
    }

    #[test]
    fn bare_json_untouched() {
        assert_eq!(extract_json_object("  {\"a\":1}  "), "{\"a\":1}");
    }
}
