//! Direct handling for transactional mail: no delegation, no gateway.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditTrail;
use crate::classifier::RouteDecision;
use crate::context::EmailContext;
use crate::error::DatabaseError;

/// Label applied to directly handled mail.
pub const TRANSACTIONAL_LABEL: &str = "Transactional";

static KINDS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("security", r"(?i)\b(password|reset|verification code|2fa|sign-?in|login)\b"),
        ("shipping", r"(?i)\b(shipped|shipping|delivery|delivered|tracking)\b"),
        ("receipt", r"(?i)\b(receipt|invoice|order|payment|charged|refund)\b"),
        ("alert", r"(?i)\b(alert|notification|statement)\b"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// What the direct handler did with an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectOutcome {
    pub label: String,
    /// Finer-grained kind, e.g. `receipt` or `shipping`.
    pub kind: String,
}

/// Fast path for `Transactional` mail.
pub struct DirectHandler {
    audit: Arc<AuditTrail>,
}

impl DirectHandler {
    pub fn new(audit: Arc<AuditTrail>) -> Self {
        Self { audit }
    }

    /// Sub-classify a transactional email from its subject and body.
    pub fn kind_of(context: &EmailContext) -> &'static str {
        KINDS
            .iter()
            .find(|(_, re)| re.is_match(context.subject()) || re.is_match(context.body()))
            .map(|(kind, _)| *kind)
            .unwrap_or("other")
    }

    /// Handle the email and write its single terminal audit entry.
    pub async fn handle(
        &self,
        context: &EmailContext,
        decision: &RouteDecision,
    ) -> Result<DirectOutcome, DatabaseError> {
        let kind = Self::kind_of(context);
        let rationale = format!(
            "labeled {TRANSACTIONAL_LABEL} ({kind}); {}",
            decision.rationale()
        );
        self.audit
            .record_direct(context.id(), decision.route(), &rationale)
            .await?;

        info!(email_id = %context.id(), kind, "Handled transactional email directly");
        Ok(DirectOutcome {
            label: TRANSACTIONAL_LABEL.to_string(),
            kind: kind.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditKind;
    use crate::classifier::{Classifier, RulesEngine};
    use crate::config::TriageConfig;
    use crate::context::test_support::context;
    use crate::store::LibSqlBackend;

    #[test]
    fn sub_kinds() {
        assert_eq!(
            DirectHandler::kind_of(&context("d-1", "Your receipt from Acme", "Total $12")),
            "receipt"
        );
        assert_eq!(
            DirectHandler::kind_of(&context("d-2", "Reset your password", "Click here")),
            "security"
        );
        assert_eq!(DirectHandler::kind_of(&context("d-3", "Hello", "there")), "other");
    }

    #[tokio::test]
    async fn writes_one_direct_entry() {
        let audit = Arc::new(AuditTrail::new(Arc::new(
            LibSqlBackend::new_memory().await.unwrap(),
        )));
        let classifier =
            Classifier::new(RulesEngine::default_rules(), audit.clone(), &TriageConfig::default());
        let ctx = context("d-4", "Your order has shipped", "Tracking number 123");
        let decision = classifier.decide(&ctx).await;

        let handler = DirectHandler::new(audit.clone());
        let outcome = handler.handle(&ctx, &decision).await.unwrap();
        handler.handle(&ctx, &decision).await.unwrap();

        assert_eq!(outcome.label, "Transactional");
        assert_eq!(outcome.kind, "shipping");
        let entries = audit.entries_for("d-4").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, AuditKind::DirectHandled);
    }
}
