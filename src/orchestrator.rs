//! Orchestrator: classify, dispatch, record.
//!
//! Flow per email:
//! 1. Validate the context (malformed → `ContextError`, nothing recorded)
//! 2. Classify and write the classification audit entry
//! 3. Dispatch to the `DirectHandler` or to every pipeline registered for
//!    the route, each with its own `ToolGateway`
//! 4. Record one audit entry per terminal item (and per aborted run)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::audit::AuditTrail;
use crate::classifier::{Classifier, Route, RouteDecision, RulesEngine};
use crate::config::TriageConfig;
use crate::context::EmailContext;
use crate::error::{Error, PipelineError};
use crate::llm::{LlmClassificationPolicy, LlmProvider};
use crate::pipeline::{
    CategoryPipeline, DirectHandler, DirectOutcome, PipelineRegistry, PipelineRun, RetryPolicy,
    ToolGateway,
};
use crate::scheduler::{ReminderBackend, Scheduler};
use crate::store::Database;

/// Everything that happened to one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailOutcome {
    pub email_id: String,
    pub decision: RouteDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct: Option<DirectOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<PipelineRun>,
}

impl EmailOutcome {
    pub fn route(&self) -> Route {
        self.decision.route()
    }
}

/// Top-level coordinator for email triage.
pub struct Orchestrator {
    config: TriageConfig,
    classifier: Classifier,
    registry: PipelineRegistry,
    direct: DirectHandler,
    scheduler: Arc<Scheduler>,
    audit: Arc<AuditTrail>,
    retry: RetryPolicy,
}

impl Orchestrator {
    /// Rule-based orchestrator over the given store and reminder backend.
    pub fn new(
        db: Arc<dyn Database>,
        backend: Arc<dyn ReminderBackend>,
        config: TriageConfig,
    ) -> Self {
        let audit = Arc::new(AuditTrail::new(Arc::clone(&db)));
        let scheduler = Arc::new(Scheduler::new(db, backend, &config));
        Self {
            classifier: Classifier::new(RulesEngine::default_rules(), Arc::clone(&audit), &config),
            registry: PipelineRegistry::with_defaults(&config),
            direct: DirectHandler::new(Arc::clone(&audit)),
            retry: RetryPolicy::from_config(&config),
            scheduler,
            audit,
            config,
        }
    }

    /// Use the model for classification fallback and for extraction.
    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        let policy = LlmClassificationPolicy::new(Arc::clone(&llm), &self.config);
        self.classifier = self.classifier.with_policy(Arc::new(policy));
        self.registry = PipelineRegistry::with_llm(llm, &self.config);
        self
    }

    pub fn with_registry(mut self, registry: PipelineRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    /// Process one raw JSON context.
    ///
    /// A malformed context fails here, before anything is recorded.
    pub async fn process_raw(&self, value: serde_json::Value) -> Result<EmailOutcome, Error> {
        let context = EmailContext::from_value(value)?;
        Ok(self.process(context).await?)
    }

    /// Process one email end to end.
    pub async fn process(&self, context: EmailContext) -> Result<EmailOutcome, PipelineError> {
        info!(
            email_id = %context.id(),
            sender = %context.sender(),
            thread_id = %context.thread_id(),
            "Processing email"
        );

        let decision = self.classifier.classify(&context).await?;
        let route = decision.route();

        if !route.is_delegated() {
            let direct = self.direct.handle(&context, &decision).await?;
            return Ok(EmailOutcome {
                email_id: context.id().to_string(),
                decision,
                direct: Some(direct),
                runs: Vec::new(),
            });
        }

        let pipelines = self.registry.pipelines_for(route);
        if pipelines.is_empty() {
            error!(email_id = %context.id(), route = route.name(), "No pipeline registered");
            return Err(PipelineError::NoPipeline(route.name().to_string()));
        }

        // Shared read-only from here on.
        let context = Arc::new(context);
        let runs = futures::future::join_all(
            pipelines
                .iter()
                .map(|pipeline| self.run_pipeline(Arc::clone(&context), route, pipeline.as_ref())),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        Ok(EmailOutcome {
            email_id: context.id().to_string(),
            decision,
            direct: None,
            runs,
        })
    }

    async fn run_pipeline(
        &self,
        context: Arc<EmailContext>,
        route: Route,
        pipeline: &dyn CategoryPipeline,
    ) -> Result<PipelineRun, PipelineError> {
        let gateway = ToolGateway::new(
            Arc::clone(&context),
            pipeline.name(),
            pipeline.extractor(),
            pipeline.validator(),
            Arc::clone(&self.scheduler),
            self.retry.clone(),
        );

        let run = pipeline.run(&gateway).await;

        for outcome in &run.items {
            self.audit
                .record_item(context.id(), route, pipeline.name(), outcome)
                .await?;
        }
        if let Some(reason) = &run.aborted {
            self.audit
                .record_aborted(context.id(), route, pipeline.name(), reason)
                .await?;
        }
        Ok(run)
    }

    /// Process many raw contexts. Each email is isolated: one failure never
    /// affects another, and results come back in input order.
    pub async fn process_batch(
        &self,
        values: Vec<serde_json::Value>,
    ) -> Vec<Result<EmailOutcome, Error>> {
        let count = values.len();
        info!(count, "Processing email batch");

        let mut results = Vec::with_capacity(count);
        for value in values {
            let result = self.process_raw(value).await;
            if let Err(e) = &result {
                error!(error = %e, "Failed to process email in batch");
            }
            results.push(result);
        }

        info!(
            processed = results.iter().filter(|r| r.is_ok()).count(),
            total = count,
            "Batch processing complete"
        );
        results
    }
}
