//! Tool gateway: the only capability a category pipeline holds.
//!
//! Exposes exactly three tools: `extract`, `validate`, `schedule`. Every call
//! carries the email context envelope, which must match the original byte
//! for byte. A per-run ledger tracks each item so that `validate` only sees
//! items `extract` produced and `schedule` only sees items that passed
//! `validate`.
//!
//! The gateway holds no reference to the orchestrator or to any pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::context::{EmailContext, RawEmailContext};
use crate::error::{ExtractionError, ProtocolError, ToolError};
use crate::pipeline::extract::Extractor;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::types::{ItemState, RawItem, RejectionReason, ValidatedItem, Validation};
use crate::pipeline::validate::Validator;
use crate::scheduler::{ScheduleRecord, Scheduler};

/// The closed tool set.
pub const TOOL_NAMES: [&str; 3] = ["extract", "validate", "schedule"];

/// Names that would re-enter the orchestrator or a pipeline.
const ENTRY_POINTS: &[&str] = &[
    "process",
    "process_email",
    "process_raw",
    "process_batch",
    "classify",
    "dispatch",
    "orchestrator",
    "orchestrate",
    "run",
    "run_pipeline",
    "pipeline",
];

/// A named tool call, as an agent would emit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(alias = "tool")]
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Parse agent output into a tool call.
///
/// Anything that is not a JSON tool call object is a scope violation.
pub fn parse_tool_call(raw: &str) -> Result<ToolCall, ProtocolError> {
    serde_json::from_str::<ToolCall>(raw.trim()).map_err(|e| ProtocolError::Scope {
        name: "<free text>".into(),
        reason: format!("agent output is not a structured tool call: {e}"),
    })
}

#[derive(Debug, Deserialize)]
struct ExtractArgs {
    context: RawEmailContext,
}

#[derive(Debug, Deserialize)]
struct ValidateArgs {
    context: RawEmailContext,
    item: RawItem,
}

#[derive(Debug, Deserialize)]
struct ScheduleArgs {
    context: RawEmailContext,
    item: ValidatedItem,
}

/// Where an item stands within this run.
#[derive(Debug, Clone)]
enum Stage {
    Extracted(RawItem),
    Validating,
    Validated(ValidatedItem),
    Rejected(RejectionReason),
    Scheduling,
    Scheduled(ScheduleRecord),
}

impl Stage {
    fn label(&self) -> &'static str {
        match self {
            Self::Extracted(_) => "extracted",
            Self::Validating => "being validated",
            Self::Validated(_) => "validated",
            Self::Rejected(_) => "rejected",
            Self::Scheduling => "being scheduled",
            Self::Scheduled(_) => "scheduled",
        }
    }

    fn state(&self) -> ItemState {
        match self {
            Self::Extracted(_) | Self::Validating => ItemState::Extracted,
            Self::Validated(_) | Self::Scheduling => ItemState::Validated,
            Self::Rejected(_) => ItemState::Rejected,
            Self::Scheduled(_) => ItemState::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractStage {
    NotCalled,
    Running,
    Done,
}

#[derive(Debug)]
struct Ledger {
    extract: ExtractStage,
    items: HashMap<String, Stage>,
}

impl Ledger {
    /// Move an item to `next`, refusing anything the item state machine
    /// does not allow. In-flight markers and reverts keep the same state.
    fn advance(&mut self, tool: &str, item_id: &str, next: Stage) -> Result<(), ProtocolError> {
        let current = self
            .items
            .get(item_id)
            .map_or(ItemState::Start, Stage::state);
        let target = next.state();
        if current != target && !current.can_transition_to(target) {
            return Err(order(
                tool,
                item_id,
                format!("item cannot move from {} to {}", current.as_str(), target.as_str()),
            ));
        }
        self.items.insert(item_id.to_string(), next);
        Ok(())
    }
}

fn order(tool: &str, item_id: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Order {
        tool: tool.to_string(),
        item_id: item_id.to_string(),
        reason: reason.into(),
    }
}

/// Per-run tool capability over one email.
pub struct ToolGateway {
    context: Arc<EmailContext>,
    pipeline: String,
    extractor: Arc<dyn Extractor>,
    validator: Arc<dyn Validator>,
    scheduler: Arc<Scheduler>,
    retry: RetryPolicy,
    ledger: Mutex<Ledger>,
}

impl ToolGateway {
    pub fn new(
        context: Arc<EmailContext>,
        pipeline: impl Into<String>,
        extractor: Arc<dyn Extractor>,
        validator: Arc<dyn Validator>,
        scheduler: Arc<Scheduler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            context,
            pipeline: pipeline.into(),
            extractor,
            validator,
            scheduler,
            retry,
            ledger: Mutex::new(Ledger {
                extract: ExtractStage::NotCalled,
                items: HashMap::new(),
            }),
        }
    }

    /// The envelope to present with every call.
    pub fn envelope(&self) -> RawEmailContext {
        self.context.to_envelope()
    }

    pub fn email_id(&self) -> &str {
        self.context.id()
    }

    /// Current state of an item in this run, if the gateway has seen it.
    pub fn item_state(&self, item_id: &str) -> Option<ItemState> {
        self.ledger().items.get(item_id).map(Stage::state)
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_integrity(
        &self,
        tool: &str,
        presented: &RawEmailContext,
    ) -> Result<(), ProtocolError> {
        self.context.verify_unchanged(presented).map_err(|field| {
            warn!(
                email_id = %self.context.id(),
                pipeline = %self.pipeline,
                tool,
                field,
                "Context integrity violation, call rejected"
            );
            ProtocolError::ContextIntegrity {
                field,
                tool: tool.to_string(),
            }
        })
    }

    /// Discover items in the email. Allowed once per run.
    pub async fn extract(&self, envelope: &RawEmailContext) -> Result<Vec<RawItem>, ToolError> {
        self.check_integrity("extract", envelope)?;
        {
            let mut ledger = self.ledger();
            if ledger.extract != ExtractStage::NotCalled {
                return Err(order("extract", "*", "extract already called in this run").into());
            }
            ledger.extract = ExtractStage::Running;
        }

        let result = self
            .retry
            .run("extract", || self.extractor.extract(&self.context))
            .await;

        let mut ledger = self.ledger();
        let payloads = match result {
            Ok(payloads) => payloads,
            Err(e) => {
                ledger.extract = ExtractStage::NotCalled;
                return Err(e.into());
            }
        };
        ledger.extract = ExtractStage::Done;

        let mut items = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let item = RawItem::new(payload);
            if ledger.items.contains_key(&item.id) {
                debug!(item_id = %item.id, "Duplicate item in extraction output, collapsed");
                continue;
            }
            ledger.advance("extract", &item.id, Stage::Extracted(item.clone()))?;
            items.push(item);
        }

        debug!(
            email_id = %self.context.id(),
            pipeline = %self.pipeline,
            extractor = self.extractor.name(),
            count = items.len(),
            "Items extracted"
        );
        Ok(items)
    }

    /// Check one extracted item.
    pub async fn validate(
        &self,
        envelope: &RawEmailContext,
        item: &RawItem,
    ) -> Result<Validation, ToolError> {
        self.check_integrity("validate", envelope)?;
        {
            let mut ledger = self.ledger();
            match ledger.items.get(&item.id) {
                Some(Stage::Extracted(stored)) if stored == item => {
                    ledger.advance("validate", &item.id, Stage::Validating)?;
                }
                Some(Stage::Extracted(_)) => {
                    return Err(
                        order("validate", &item.id, "item differs from what extract produced")
                            .into(),
                    );
                }
                Some(other) => {
                    return Err(
                        order("validate", &item.id, format!("item is already {}", other.label()))
                            .into(),
                    );
                }
                None => {
                    return Err(
                        order("validate", &item.id, "item was not produced by extract").into(),
                    );
                }
            }
        }

        let result = self
            .retry
            .run("validate", || self.validator.validate(&self.context, item))
            .await;

        let mut ledger = self.ledger();
        match result {
            Ok(Validation::Valid(mut validated)) => {
                validated.item_id = item.id.clone();
                ledger.advance("validate", &item.id, Stage::Validated(validated.clone()))?;
                Ok(Validation::Valid(validated))
            }
            Ok(Validation::Rejected { reason }) => {
                ledger.advance("validate", &item.id, Stage::Rejected(reason.clone()))?;
                Ok(Validation::Rejected { reason })
            }
            Err(e) => {
                ledger.advance("validate", &item.id, Stage::Extracted(item.clone()))?;
                Err(e.into())
            }
        }
    }

    /// Schedule one validated item. Idempotent per item and per identity key.
    pub async fn schedule(
        &self,
        envelope: &RawEmailContext,
        item: &ValidatedItem,
    ) -> Result<ScheduleRecord, ToolError> {
        self.check_integrity("schedule", envelope)?;
        {
            let mut ledger = self.ledger();
            let id = item.item_id.as_str();
            match ledger.items.get(id) {
                Some(Stage::Validated(stored)) if stored == item => {
                    ledger.advance("schedule", id, Stage::Scheduling)?;
                }
                Some(Stage::Validated(_)) => {
                    return Err(order("schedule", id, "item differs from validated output").into());
                }
                Some(Stage::Scheduled(record)) => {
                    debug!(item_id = id, key = %record.key, "Item already scheduled in this run");
                    return Ok(record.clone());
                }
                Some(Stage::Extracted(_)) | Some(Stage::Validating) => {
                    return Err(order("schedule", id, "item has not passed validate").into());
                }
                Some(Stage::Rejected(reason)) => {
                    return Err(
                        order("schedule", id, format!("item was rejected: {reason}")).into(),
                    );
                }
                Some(Stage::Scheduling) => {
                    return Err(order("schedule", id, "item is already being scheduled").into());
                }
                None => {
                    return Err(order("schedule", id, "item was not produced by extract").into());
                }
            }
        }

        let result = self
            .retry
            .run("schedule", || self.scheduler.schedule(&self.context, item))
            .await;

        let mut ledger = self.ledger();
        match result {
            Ok(record) => {
                ledger.advance("schedule", &item.item_id, Stage::Scheduled(record.clone()))?;
                Ok(record)
            }
            Err(e) => {
                ledger.advance("schedule", &item.item_id, Stage::Validated(item.clone()))?;
                Err(e.into())
            }
        }
    }

    /// Dispatch a named call with JSON arguments.
    pub async fn invoke(&self, call: ToolCall) -> Result<Value, ToolError> {
        match call.name.as_str() {
            "extract" => {
                let args: ExtractArgs = parse_args(&call)?;
                let items = self.extract(&args.context).await?;
                Ok(json!({ "items": items }))
            }
            "validate" => {
                let args: ValidateArgs = parse_args(&call)?;
                let validation = self.validate(&args.context, &args.item).await?;
                to_json(&validation)
            }
            "schedule" => {
                let args: ScheduleArgs = parse_args(&call)?;
                let record = self.schedule(&args.context, &args.item).await?;
                to_json(&record)
            }
            name => {
                let reason = if ENTRY_POINTS.contains(&name) || name == self.pipeline {
                    "re-entering the orchestrator or a pipeline is not permitted".to_string()
                } else {
                    format!("permitted tools are {}", TOOL_NAMES.join(", "))
                };
                warn!(
                    email_id = %self.context.id(),
                    pipeline = %self.pipeline,
                    tool = name,
                    "Scope violation"
                );
                Err(ProtocolError::Scope {
                    name: name.to_string(),
                    reason,
                }
                .into())
            }
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T, ProtocolError> {
    serde_json::from_value(call.arguments.clone()).map_err(|e| ProtocolError::Scope {
        name: call.name.clone(),
        reason: format!("malformed arguments: {e}"),
    })
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value)
        .map_err(|e| ExtractionError::InvalidOutput(e.to_string()).into())
}
