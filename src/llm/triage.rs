//! Model-backed classification policy and extractors.
//!
//! Both send a tight prompt built from the immutable context and parse a
//! single JSON object back. Neither ever sees the gateway or the
//! orchestrator; they only read the context.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::classifier::{ClassificationPolicy, PolicyVerdict, Route};
use crate::config::TriageConfig;
use crate::context::EmailContext;
use crate::error::{ExtractionError, LlmError};
use crate::pipeline::extract::Extractor;
use crate::pipeline::types::{EventDetails, ItemPayload, RecruiterDetails};

/// Max tokens for classification (kept tight, runs on every email).
const CLASSIFY_MAX_TOKENS: u32 = 256;

/// Max tokens for extraction; an email can list a whole tour.
const EXTRACT_MAX_TOKENS: u32 = 1500;

/// Temperature for classification and extraction.
const TRIAGE_TEMPERATURE: f32 = 0.0;

/// Body characters sent to the model.
const BODY_PREVIEW_CHARS: usize = 4000;

/// Prompt settings shared by the policy and the extractors.
#[derive(Debug, Clone)]
struct PromptSettings {
    locale: String,
    template_version: String,
}

impl PromptSettings {
    fn from_config(config: &TriageConfig) -> Self {
        Self {
            locale: config.locale.clone(),
            template_version: config.template_version.clone(),
        }
    }

    fn header(&self) -> String {
        format!(
            "[template {} | locale {}]\n",
            self.template_version, self.locale
        )
    }
}

fn build_email_prompt(context: &EmailContext) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("From: {}\n", context.sender()));
    prompt.push_str(&format!("Subject: {}\n", context.subject()));
    prompt.push_str(&format!("Received: {}\n", context.current_time()));
    if !context.image_data_urls().is_empty() {
        prompt.push_str(&format!(
            "Attached images: {}\n",
            context.image_data_urls().len()
        ));
    }
    let body: String = context.body().chars().take(BODY_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("\nBody:\n{body}"));
    prompt
}

// ── Classification ──────────────────────────────────────────────────

/// Classification policy that asks the model for a route.
pub struct LlmClassificationPolicy {
    llm: Arc<dyn LlmProvider>,
    settings: PromptSettings,
}

impl LlmClassificationPolicy {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &TriageConfig) -> Self {
        Self {
            llm,
            settings: PromptSettings::from_config(config),
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = self.settings.header();
        prompt.push_str(
            "You are an email triage engine. Classify the email into exactly one route.\n\n\
             Routes:\n\
             - \"recruiter\": a recruiter or hiring manager reaching out about a job.\n\
             - \"concert\": announces concerts, shows, tours or ticket sales.\n\
             - \"transactional\": receipts, invoices, shipping or account notices.\n\
             - \"other\": anything else.\n\n\
             Respond with ONLY a JSON object:\n\
             {\"route\": \"...\", \"confidence\": 0.0, \"rationale\": \"...\"}\n\n\
             Rules:\n\
             - confidence is between 0.0 and 1.0\n\
             - rationale is one short sentence\n\
             - When unsure, choose \"other\"",
        );
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    route: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    rationale: String,
}

fn parse_classification_response(provider: &str, raw: &str) -> Result<PolicyVerdict, LlmError> {
    let json = extract_json_object(raw);
    let response: ClassificationResponse =
        serde_json::from_str(&json).map_err(|e| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("JSON parse error: {e}"),
        })?;

    let route = response
        .route
        .trim()
        .to_lowercase()
        .parse::<Route>()
        .map_err(|reason| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        })?;

    Ok(PolicyVerdict {
        route,
        confidence: response.confidence.clamp(0.0, 1.0),
        rationale: if response.rationale.is_empty() {
            format!("model chose {route}")
        } else {
            response.rationale
        },
    })
}

#[async_trait]
impl ClassificationPolicy for LlmClassificationPolicy {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn classify(&self, context: &EmailContext) -> Result<PolicyVerdict, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(build_email_prompt(context)),
        ])
        .with_temperature(TRIAGE_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let verdict = parse_classification_response(self.llm.model_name(), &response.content)
            .inspect_err(|e| {
                warn!(
                    email_id = %context.id(),
                    raw_response = %response.content,
                    error = %e,
                    "Failed to parse classification response"
                );
            })?;

        debug!(
            email_id = %context.id(),
            route = %verdict.route,
            confidence = verdict.confidence,
            "Model classification"
        );
        Ok(verdict)
    }
}

// ── Extraction ──────────────────────────────────────────────────────

/// Which item shape an `LlmExtractor` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionKind {
    Events,
    Recruiter,
}

/// Extractor that asks the model for a JSON item list.
pub struct LlmExtractor {
    llm: Arc<dyn LlmProvider>,
    kind: ExtractionKind,
    settings: PromptSettings,
    name: String,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmProvider>, kind: ExtractionKind, config: &TriageConfig) -> Self {
        let name = match kind {
            ExtractionKind::Events => "llm-events",
            ExtractionKind::Recruiter => "llm-recruiter",
        };
        Self {
            llm,
            kind,
            settings: PromptSettings::from_config(config),
            name: name.to_string(),
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = self.settings.header();
        match self.kind {
            ExtractionKind::Events => prompt.push_str(
                "Extract every distinct event (concert, show, festival date) announced in the email.\n\n\
                 Respond with ONLY a JSON object:\n\
                 {\"items\": [{\"event_name\": \"...\", \"summary\": \"...\", \"date_time\": \"...\", \
                 \"venue_address\": \"...\", \"presale_info\": \"...\", \"ticket_link\": \"...\", \
                 \"additional_notes\": \"...\"}]}\n\n\
                 Rules:\n\
                 - One entry per date; a tour with three dates is three items\n\
                 - Copy dates as written; do not invent a date that is not in the email\n\
                 - Omit fields that are not present\n\
                 - Return {\"items\": []} when nothing qualifies",
            ),
            ExtractionKind::Recruiter => prompt.push_str(
                "Extract the recruiter outreach in the email.\n\n\
                 Respond with ONLY a JSON object:\n\
                 {\"items\": [{\"name\": \"...\", \"company\": \"...\", \"role\": \"...\"}]}\n\n\
                 Rules:\n\
                 - name is the recruiter's name\n\
                 - Omit fields that are not present",
            ),
        }
        prompt
    }
}

#[derive(Debug, Deserialize)]
struct ItemsResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

fn parse_items_response(
    kind: ExtractionKind,
    raw: &str,
) -> Result<Vec<ItemPayload>, ExtractionError> {
    let json = extract_json_object(raw);
    let response: ItemsResponse = serde_json::from_str(&json)
        .map_err(|e| ExtractionError::InvalidOutput(format!("JSON parse error: {e}")))?;

    response
        .items
        .into_iter()
        .map(|value| {
            let payload = match kind {
                ExtractionKind::Events => {
                    serde_json::from_value::<EventDetails>(value).map(ItemPayload::Event)
                }
                ExtractionKind::Recruiter => {
                    serde_json::from_value::<RecruiterDetails>(value).map(ItemPayload::Recruiter)
                }
            };
            payload.map_err(|e| ExtractionError::InvalidOutput(e.to_string()))
        })
        .collect()
}

#[async_trait]
impl Extractor for LlmExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, context: &EmailContext) -> Result<Vec<ItemPayload>, ExtractionError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(build_email_prompt(context)),
        ])
        .with_temperature(TRIAGE_TEMPERATURE)
        .with_max_tokens(EXTRACT_MAX_TOKENS);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| ExtractionError::Failed {
                extractor: self.name.clone(),
                reason: e.to_string(),
            })?;

        let items = parse_items_response(self.kind, &response.content)?;
        debug!(
            email_id = %context.id(),
            extractor = %self.name,
            count = items.len(),
            "Model extraction"
        );
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::context::test_support::context;
    use crate::llm::{CompletionResponse, FinishReason};

    /// Provider that replays a canned reply and records the prompts it saw.
    struct ScriptedProvider {
        reply: Result<String, ()>,
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.prompts.lock().unwrap().push(request);
            match &self.reply {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    finish_reason: FinishReason::Stop,
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Err(()) => Err(LlmError::RateLimited {
                    provider: "scripted".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn policy_parses_route_and_clamps_confidence() {
        let llm = ScriptedProvider::replying(
            "```json\n{\"route\": \"Concert\", \"confidence\": 1.7, \"rationale\": \"tour dates\"}\n```",
        );
        let policy = LlmClassificationPolicy::new(llm.clone(), &TriageConfig::default());

        let verdict = policy
            .classify(&context("m-1", "Tour", "dates inside"))
            .await
            .unwrap();
        assert_eq!(verdict.route, Route::Concert);
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.rationale, "tour dates");

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].messages[0].content.contains("[template v1 | locale en]"));
        assert!(prompts[0].messages[1].content.contains("Subject: Tour"));
    }

    #[tokio::test]
    async fn policy_rejects_unknown_route() {
        let llm = ScriptedProvider::replying(r#"{"route": "spam", "confidence": 0.9}"#);
        let policy = LlmClassificationPolicy::new(llm, &TriageConfig::default());
        let err = policy
            .classify(&context("m-2", "Hi", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn event_extractor_reads_items() {
        let llm = ScriptedProvider::replying(
            r#"{"items": [
                {"event_name": "Radiohead", "date_time": "July 14 2026 8pm", "venue_address": "MSG"},
                {"event_name": "Radiohead", "date_time": "July 15 2026 8pm"}
            ]}"#,
        );
        let extractor = LlmExtractor::new(llm, ExtractionKind::Events, &TriageConfig::default());

        let items = extractor
            .extract(&context("m-3", "Tour", "body"))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        match &items[0] {
            ItemPayload::Event(details) => {
                assert_eq!(details.venue_address.as_deref(), Some("MSG"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn extractor_maps_provider_failure_to_retryable() {
        let extractor = LlmExtractor::new(
            ScriptedProvider::failing(),
            ExtractionKind::Recruiter,
            &TriageConfig::default(),
        );
        let err = extractor
            .extract(&context("m-4", "Role", "body"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn garbage_output_is_not_retryable() {
        let llm = ScriptedProvider::replying("I could not find anything.");
        let extractor = LlmExtractor::new(llm, ExtractionKind::Events, &TriageConfig::default());
        let err = extractor
            .extract(&context("m-5", "Hi", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidOutput(_)));
        assert!(!err.is_retryable());
    }
}
