//! Classifier: maps an `EmailContext` to exactly one `Route`.
//!
//! Flow:
//! 1. Rules engine (fast, deterministic) → may short-circuit
//! 2. Optional classification policy (e.g. LLM-backed) → verdict + confidence
//! 3. Threshold check → low-confidence direct handling becomes delegation
//!
//! The decision is written to the audit trail before it is returned, and a
//! retry of the same email id returns the decision that was recorded first.

pub mod rules;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditLogEntry, AuditTrail};
use crate::config::TriageConfig;
use crate::context::EmailContext;
use crate::error::{LlmError, PipelineError};

pub use rules::{RuleField, RuleMatch, RulesEngine};

/// Category decision for one email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Recruiter,
    Concert,
    Transactional,
    /// Fallback for mail that matched no category.
    Other,
}

impl Route {
    pub const ALL: [Route; 4] = [
        Route::Recruiter,
        Route::Concert,
        Route::Transactional,
        Route::Other,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Recruiter => "recruiter",
            Self::Concert => "concert",
            Self::Transactional => "transactional",
            Self::Other => "other",
        }
    }

    /// Whether this route goes to a specialized pipeline rather than direct handling.
    pub fn is_delegated(&self) -> bool {
        !matches!(self, Self::Transactional)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recruiter" => Ok(Self::Recruiter),
            "concert" => Ok(Self::Concert),
            "transactional" => Ok(Self::Transactional),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown route: '{other}'")),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionSource {
    Rule { field: String },
    Policy { policy: String },
    Fallback,
    /// Replayed from an earlier classification of the same email id.
    Recorded,
}

/// The route decision for one email. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    route: Route,
    confidence: f32,
    rationale: String,
    source: DecisionSource,
}

impl RouteDecision {
    pub fn route(&self) -> Route {
        self.route
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    pub fn source(&self) -> &DecisionSource {
        &self.source
    }

    fn from_recorded(entry: &AuditLogEntry) -> Self {
        Self {
            route: entry.route,
            confidence: entry.confidence.unwrap_or(0.0),
            rationale: entry.rationale.clone().unwrap_or_default(),
            source: DecisionSource::Recorded,
        }
    }
}

/// Verdict returned by an external classification policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub route: Route,
    pub confidence: f32,
    pub rationale: String,
}

/// External classification function consulted when no rule matches.
///
/// Its non-determinism stays behind this boundary; the classifier around it
/// applies the threshold and audit discipline deterministically.
#[async_trait]
pub trait ClassificationPolicy: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, context: &EmailContext) -> Result<PolicyVerdict, LlmError>;
}

/// Rules-first classifier with an optional policy and a delegation threshold.
pub struct Classifier {
    rules: RulesEngine,
    policy: Option<Arc<dyn ClassificationPolicy>>,
    threshold: f32,
    audit: Arc<AuditTrail>,
}

impl Classifier {
    pub fn new(rules: RulesEngine, audit: Arc<AuditTrail>, config: &TriageConfig) -> Self {
        Self {
            rules,
            policy: None,
            threshold: config.delegation_threshold,
            audit,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ClassificationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Classify and record the decision.
    ///
    /// Exactly one classification entry exists per email id afterwards. When
    /// one already existed, its decision is returned instead of the fresh one.
    pub async fn classify(&self, context: &EmailContext) -> Result<RouteDecision, PipelineError> {
        let decision = self.decide(context).await;
        let (entry, created) = self.audit.record_classification(context, &decision).await?;

        if created {
            info!(
                email_id = %context.id(),
                route = decision.route.name(),
                confidence = decision.confidence,
                rationale = %decision.rationale,
                "Email classified"
            );
            Ok(decision)
        } else {
            debug!(
                email_id = %context.id(),
                route = entry.route.name(),
                "Classification already recorded, replaying"
            );
            Ok(RouteDecision::from_recorded(&entry))
        }
    }

    /// Compute a decision without side effects.
    pub async fn decide(&self, context: &EmailContext) -> RouteDecision {
        if let Some(matched) = self.rules.evaluate(context) {
            return RouteDecision {
                route: matched.route,
                confidence: 1.0,
                rationale: format!("rule: {}", matched.reason),
                source: DecisionSource::Rule {
                    field: format!("{:?}", matched.field).to_lowercase(),
                },
            };
        }

        let Some(policy) = &self.policy else {
            return fallback("no rule matched; delegating by default");
        };

        match policy.classify(context).await {
            Ok(verdict) => self.apply_threshold(policy.name(), verdict),
            Err(e) => {
                warn!(
                    email_id = %context.id(),
                    policy = policy.name(),
                    error = %e,
                    "Classification policy failed, delegating by default"
                );
                fallback(&format!("policy {} failed; delegating by default", policy.name()))
            }
        }
    }

    /// Low-confidence direct handling is converted into delegation.
    fn apply_threshold(&self, policy: &str, verdict: PolicyVerdict) -> RouteDecision {
        let confidence = verdict.confidence.clamp(0.0, 1.0);
        let source = DecisionSource::Policy {
            policy: policy.to_string(),
        };

        if !verdict.route.is_delegated() && confidence < self.threshold {
            return RouteDecision {
                route: Route::Other,
                confidence,
                rationale: format!(
                    "policy suggested {} at confidence {confidence:.2} below threshold {:.2}; delegating ({})",
                    verdict.route, self.threshold, verdict.rationale
                ),
                source,
            };
        }

        RouteDecision {
            route: verdict.route,
            confidence,
            rationale: verdict.rationale,
            source,
        }
    }
}

fn fallback(rationale: &str) -> RouteDecision {
    RouteDecision {
        route: Route::Other,
        confidence: 0.0,
        rationale: rationale.to_string(),
        source: DecisionSource::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;
    use crate::store::LibSqlBackend;

    struct FixedPolicy {
        verdict: Option<PolicyVerdict>,
    }

    #[async_trait]
    impl ClassificationPolicy for FixedPolicy {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn classify(&self, _context: &EmailContext) -> Result<PolicyVerdict, LlmError> {
            self.verdict.clone().ok_or(LlmError::RequestFailed {
                provider: "fixed".into(),
                reason: "unavailable".into(),
            })
        }
    }

    async fn audit() -> Arc<AuditTrail> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Arc::new(AuditTrail::new(db))
    }

    fn policy(route: Route, confidence: f32) -> Arc<dyn ClassificationPolicy> {
        Arc::new(FixedPolicy {
            verdict: Some(PolicyVerdict {
                route,
                confidence,
                rationale: "fixed verdict".into(),
            }),
        })
    }

    #[test]
    fn route_parse_and_display() {
        for route in Route::ALL {
            assert_eq!(route.name().parse::<Route>().unwrap(), route);
        }
        assert!("spam".parse::<Route>().is_err());
        assert!(!Route::Transactional.is_delegated());
        assert!(Route::Other.is_delegated());
    }

    #[tokio::test]
    async fn rule_match_skips_policy() {
        let classifier = Classifier::new(
            RulesEngine::default_rules(),
            audit().await,
            &TriageConfig::default(),
        )
        .with_policy(policy(Route::Transactional, 1.0));

        let decision = classifier
            .decide(&context("c-1", "Interview", "We're hiring engineers"))
            .await;
        assert_eq!(decision.route(), Route::Recruiter);
        assert!((decision.confidence() - 1.0).abs() < f32::EPSILON);
        assert!(matches!(decision.source(), DecisionSource::Rule { .. }));
    }

    #[tokio::test]
    async fn no_rule_no_policy_delegates() {
        let classifier =
            Classifier::new(RulesEngine::empty(), audit().await, &TriageConfig::default());
        let decision = classifier.decide(&context("c-2", "Hi", "Lunch?")).await;
        assert_eq!(decision.route(), Route::Other);
        assert!(decision.route().is_delegated());
        assert_eq!(decision.source(), &DecisionSource::Fallback);
    }

    #[tokio::test]
    async fn low_confidence_direct_handling_is_delegated() {
        let classifier =
            Classifier::new(RulesEngine::empty(), audit().await, &TriageConfig::default())
                .with_policy(policy(Route::Transactional, 0.3));
        let decision = classifier.decide(&context("c-3", "Hi", "Something")).await;
        assert_eq!(decision.route(), Route::Other);
        assert!(decision.rationale().contains("below threshold"));
    }

    #[tokio::test]
    async fn confident_direct_handling_is_kept() {
        let classifier =
            Classifier::new(RulesEngine::empty(), audit().await, &TriageConfig::default())
                .with_policy(policy(Route::Transactional, 0.95));
        let decision = classifier.decide(&context("c-4", "Hi", "Something")).await;
        assert_eq!(decision.route(), Route::Transactional);
    }

    #[tokio::test]
    async fn failing_policy_falls_back() {
        let classifier =
            Classifier::new(RulesEngine::empty(), audit().await, &TriageConfig::default())
                .with_policy(Arc::new(FixedPolicy { verdict: None }));
        let decision = classifier.decide(&context("c-5", "Hi", "Something")).await;
        assert_eq!(decision.route(), Route::Other);
        assert_eq!(decision.source(), &DecisionSource::Fallback);
    }

    #[tokio::test]
    async fn classify_records_once_and_replays() {
        let audit = audit().await;
        let first = Classifier::new(RulesEngine::empty(), audit.clone(), &TriageConfig::default())
            .with_policy(policy(Route::Concert, 0.9));
        let ctx = context("c-6", "Hi", "Something");

        let decision = first.classify(&ctx).await.unwrap();
        assert_eq!(decision.route(), Route::Concert);

        // A retry with a policy that now disagrees still yields the recorded route.
        let second = Classifier::new(RulesEngine::empty(), audit.clone(), &TriageConfig::default())
            .with_policy(policy(Route::Recruiter, 0.9));
        let replay = second.classify(&ctx).await.unwrap();
        assert_eq!(replay.route(), Route::Concert);
        assert_eq!(replay.source(), &DecisionSource::Recorded);

        assert_eq!(audit.entries_for("c-6").await.unwrap().len(), 1);
    }
}
