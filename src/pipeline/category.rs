//! Category pipelines and the route → pipeline registry.
//!
//! A pipeline only ever holds a `ToolGateway`. It calls `extract` once, then
//! drives every discovered item through `validate → schedule` on its own,
//! so one item's failure never touches another.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use crate::classifier::Route;
use crate::config::TriageConfig;
use crate::context::RawEmailContext;
use crate::error::{ProtocolError, ToolError};
use crate::llm::{ExtractionKind, LlmExtractor, LlmProvider};
use crate::pipeline::extract::{Extractor, RuleEventExtractor, RuleRecruiterExtractor};
use crate::pipeline::gateway::ToolGateway;
use crate::pipeline::types::{ItemOutcome, PipelineRun, RawItem, RejectionReason, Validation};
use crate::pipeline::validate::{EventValidator, RecruiterValidator, Validator};

type ItemFuture<'a> = Pin<Box<dyn Future<Output = Result<ItemOutcome, ProtocolError>> + Send + 'a>>;

/// A delegated workflow for one category of email.
#[async_trait]
pub trait CategoryPipeline: Send + Sync {
    /// Name used for audit records and as the pipeline's entry point.
    fn name(&self) -> &str;

    /// Extraction function bound into this pipeline's gateway.
    fn extractor(&self) -> Arc<dyn Extractor>;

    /// Validation function bound into this pipeline's gateway.
    fn validator(&self) -> Arc<dyn Validator>;

    /// Drive one email through the gateway.
    async fn run(&self, gateway: &ToolGateway) -> PipelineRun;
}

/// The standard per-item state machine over any extractor/validator pair.
pub struct ItemPipeline {
    name: String,
    extractor: Arc<dyn Extractor>,
    validator: Arc<dyn Validator>,
    max_concurrent_items: usize,
}

impl ItemPipeline {
    pub fn new(
        name: impl Into<String>,
        extractor: Arc<dyn Extractor>,
        validator: Arc<dyn Validator>,
        max_concurrent_items: usize,
    ) -> Self {
        Self {
            name: name.into(),
            extractor,
            validator,
            max_concurrent_items: max_concurrent_items.max(1),
        }
    }

    /// Event pipeline with rule-based extraction.
    pub fn events(config: &TriageConfig) -> Self {
        Self::new(
            "events",
            Arc::new(RuleEventExtractor::new()),
            Arc::new(EventValidator::new()),
            config.max_concurrent_items,
        )
    }

    /// Recruiter pipeline with rule-based extraction.
    pub fn recruiter(config: &TriageConfig) -> Self {
        Self::new(
            "recruiter",
            Arc::new(RuleRecruiterExtractor::new()),
            Arc::new(RecruiterValidator::new()),
            config.max_concurrent_items,
        )
    }

    /// Event pipeline with model-backed extraction.
    pub fn llm_events(llm: Arc<dyn LlmProvider>, config: &TriageConfig) -> Self {
        Self::new(
            "events",
            Arc::new(LlmExtractor::new(llm, ExtractionKind::Events, config)),
            Arc::new(EventValidator::new()),
            config.max_concurrent_items,
        )
    }

    /// Recruiter pipeline with model-backed extraction.
    pub fn llm_recruiter(llm: Arc<dyn LlmProvider>, config: &TriageConfig) -> Self {
        Self::new(
            "recruiter",
            Arc::new(LlmExtractor::new(llm, ExtractionKind::Recruiter, config)),
            Arc::new(RecruiterValidator::new()),
            config.max_concurrent_items,
        )
    }

    /// `validate → schedule` for one item.
    ///
    /// Returns `Err` only for a scope violation, which ends the whole run.
    async fn drive_item(
        &self,
        gateway: &ToolGateway,
        envelope: &RawEmailContext,
        item: &RawItem,
    ) -> Result<ItemOutcome, ProtocolError> {
        let validated = match gateway.validate(envelope, item).await {
            Ok(Validation::Valid(validated)) => validated,
            Ok(Validation::Rejected { reason }) => {
                info!(
                    email_id = gateway.email_id(),
                    pipeline = %self.name,
                    item_id = %item.id,
                    reason = %reason,
                    "Item rejected"
                );
                return Ok(ItemOutcome::rejected(&item.id, &reason));
            }
            Err(e) => return self.item_failure(gateway, &item.id, e),
        };

        match gateway.schedule(envelope, &validated).await {
            Ok(record) => Ok(ItemOutcome::scheduled(&item.id, record)),
            Err(e) => self.item_failure(gateway, &item.id, e),
        }
    }

    fn item_failure(
        &self,
        gateway: &ToolGateway,
        item_id: &str,
        err: ToolError,
    ) -> Result<ItemOutcome, ProtocolError> {
        match err {
            ToolError::Protocol(scope @ ProtocolError::Scope { .. }) => Err(scope),
            ToolError::Protocol(violation @ ProtocolError::Order { .. }) => {
                warn!(
                    email_id = gateway.email_id(),
                    pipeline = %self.name,
                    item_id,
                    error = %violation,
                    "Protocol order violation, item rejected"
                );
                Ok(ItemOutcome::rejected(
                    item_id,
                    &RejectionReason::Protocol(violation.to_string()),
                ))
            }
            other => {
                warn!(
                    email_id = gateway.email_id(),
                    pipeline = %self.name,
                    item_id,
                    error = %other,
                    "Item failed, left unscheduled"
                );
                Ok(ItemOutcome::failed(item_id, other.to_string()))
            }
        }
    }
}

#[async_trait]
impl CategoryPipeline for ItemPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn extractor(&self) -> Arc<dyn Extractor> {
        self.extractor.clone()
    }

    fn validator(&self) -> Arc<dyn Validator> {
        self.validator.clone()
    }

    async fn run(&self, gateway: &ToolGateway) -> PipelineRun {
        let envelope = gateway.envelope();
        let mut run = PipelineRun {
            pipeline: self.name.clone(),
            items: Vec::new(),
            aborted: None,
        };

        let items = match gateway.extract(&envelope).await {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    email_id = gateway.email_id(),
                    pipeline = %self.name,
                    error = %e,
                    "Extraction failed, run aborted"
                );
                run.aborted = Some(e.to_string());
                return run;
            }
        };

        if items.is_empty() {
            info!(
                email_id = gateway.email_id(),
                pipeline = %self.name,
                "No items extracted"
            );
            return run;
        }

        // Built eagerly and boxed: a lazily mapped stream does not satisfy
        // the `Send` bound of the async-trait future.
        let futures: Vec<ItemFuture<'_>> = items
            .iter()
            .map(|item| Box::pin(self.drive_item(gateway, &envelope, item)) as ItemFuture<'_>)
            .collect();
        let mut outcomes =
            futures::stream::iter(futures).buffer_unordered(self.max_concurrent_items.max(1));

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(outcome) => run.items.push(outcome),
                Err(violation) => {
                    // Remaining in-flight items are dropped unscheduled.
                    warn!(
                        email_id = gateway.email_id(),
                        pipeline = %self.name,
                        error = %violation,
                        "Scope violation, run aborted"
                    );
                    run.aborted = Some(violation.to_string());
                    break;
                }
            }
        }

        info!(
            email_id = gateway.email_id(),
            pipeline = %self.name,
            items = run.items.len(),
            aborted = run.aborted.is_some(),
            "Pipeline run complete"
        );
        run
    }
}

/// Route → pipelines lookup.
#[derive(Default)]
pub struct PipelineRegistry {
    routes: HashMap<Route, Vec<Arc<dyn CategoryPipeline>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule-based pipelines: recruiter mail to `recruiter`, concerts and
    /// the fallback route to `events`.
    pub fn with_defaults(config: &TriageConfig) -> Self {
        let events: Arc<dyn CategoryPipeline> = Arc::new(ItemPipeline::events(config));
        let recruiter: Arc<dyn CategoryPipeline> = Arc::new(ItemPipeline::recruiter(config));
        Self::with_pipelines(events, recruiter)
    }

    /// Same routing with model-backed extraction.
    pub fn with_llm(llm: Arc<dyn LlmProvider>, config: &TriageConfig) -> Self {
        let events: Arc<dyn CategoryPipeline> =
            Arc::new(ItemPipeline::llm_events(llm.clone(), config));
        let recruiter: Arc<dyn CategoryPipeline> =
            Arc::new(ItemPipeline::llm_recruiter(llm, config));
        Self::with_pipelines(events, recruiter)
    }

    fn with_pipelines(
        events: Arc<dyn CategoryPipeline>,
        recruiter: Arc<dyn CategoryPipeline>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Route::Recruiter, recruiter);
        registry.register(Route::Concert, events.clone());
        registry.register(Route::Other, events);
        registry
    }

    pub fn register(&mut self, route: Route, pipeline: Arc<dyn CategoryPipeline>) {
        self.routes.entry(route).or_default().push(pipeline);
    }

    pub fn pipelines_for(&self, route: Route) -> &[Arc<dyn CategoryPipeline>] {
        self.routes.get(&route).map(Vec::as_slice).unwrap_or(&[])
    }
}
