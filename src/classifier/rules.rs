//! Deterministic routing rules.
//!
//! Runs before any model-backed policy and short-circuits it:
//! - recruiting/hiring content → Recruiter
//! - event/ticket/concert content → Concert
//! - receipts, confirmations, resets, alerts → Transactional
//!
//! Categories are evaluated in that fixed order regardless of the order in
//! which rules were added, so precedence cannot drift with configuration.

use regex::Regex;
use tracing::debug;

use crate::classifier::Route;
use crate::context::EmailContext;

/// Categories that have rules, in precedence order.
pub const RULE_PRECEDENCE: [Route; 3] = [Route::Recruiter, Route::Concert, Route::Transactional];

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// A single routing rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    /// Category this rule routes to.
    pub route: Route,
    /// Compiled regex for matching.
    pub regex: Regex,
    /// Fields the regex is tried against.
    pub fields: Vec<RuleField>,
    /// Why this rule triggers; becomes the decision rationale.
    pub reason: String,
}

/// Outcome of a rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub route: Route,
    pub field: RuleField,
    pub reason: String,
}

/// Regex routing rules evaluated in category precedence order.
pub struct RulesEngine {
    rules: Vec<RoutingRule>,
}

impl RulesEngine {
    /// Create a rules engine with the default category patterns.
    pub fn default_rules() -> Self {
        let mut engine = Self::empty();
        let content = [RuleField::Subject, RuleField::Body];

        engine.push(
            Route::Recruiter,
            r"(?i)\b(recruit(er|ers|ing|ment)?|hiring|headhunt\w*|talent acquisition|job (opportunity|opening|offer)|open (role|position)|career opportunit\w+|your (resume|cv)|interview)\b",
            &content,
            "recruiting/hiring content",
        );
        engine.push(
            Route::Concert,
            r"(?i)\b(concerts?|tour dates?|on tour|world tour|tickets?|pre-?sale|on[- ]sale|live (at|in)|festival|gig|doors open|headlin\w+)\b",
            &content,
            "event/ticket content",
        );
        engine.push(
            Route::Transactional,
            r"(?i)\b(receipt|order (confirmation|number|#)|your order|has shipped|tracking number|invoice|payment (received|confirmed|failed)|password reset|reset your password|verification code|verify your (email|account)|security alert|sign-in attempt|login alert|confirm your (email|account|subscription)|booking confirmation)\b",
            &content,
            "transactional content",
        );
        engine.push(
            Route::Transactional,
            r"(?i)\b(no[-_.]?reply|billing|receipts?|alerts?)@",
            &[RuleField::Sender],
            "automated transactional sender",
        );

        engine
    }

    /// Create an empty rules engine (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule.
    ///
    /// Precedence is by category, so a custom Transactional rule can never
    /// outrank a Recruiter rule.
    pub fn add_rule(
        &mut self,
        route: Route,
        pattern: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(RoutingRule {
            route,
            regex: Regex::new(pattern)?,
            fields: vec![field],
            reason: reason.into(),
        });
        Ok(())
    }

    fn push(&mut self, route: Route, pattern: &str, fields: &[RuleField], reason: &str) {
        // Built-in patterns are literals; a failure here is a programming error.
        if let Ok(regex) = Regex::new(pattern) {
            self.rules.push(RoutingRule {
                route,
                regex,
                fields: fields.to_vec(),
                reason: reason.into(),
            });
        }
    }

    /// Number of loaded rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a context against all rules.
    ///
    /// Returns `None` when no rule matches (fall through to the policy).
    pub fn evaluate(&self, context: &EmailContext) -> Option<RuleMatch> {
        for route in RULE_PRECEDENCE {
            for rule in self.rules.iter().filter(|r| r.route == route) {
                for field in &rule.fields {
                    let value = match field {
                        RuleField::Sender => context.sender(),
                        RuleField::Subject => context.subject(),
                        RuleField::Body => context.body(),
                    };
                    if rule.regex.is_match(value) {
                        debug!(
                            email_id = %context.id(),
                            route = route.name(),
                            field = ?field,
                            reason = %rule.reason,
                            "Email matched routing rule"
                        );
                        return Some(RuleMatch {
                            route,
                            field: *field,
                            reason: rule.reason.clone(),
                        });
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;

    fn route_of(engine: &RulesEngine, subject: &str, body: &str) -> Option<Route> {
        engine.evaluate(&context("t-1", subject, body)).map(|m| m.route)
    }

    #[test]
    fn default_rules_loaded() {
        assert!(RulesEngine::default_rules().len() >= 4);
        assert!(RulesEngine::empty().is_empty());
    }

    #[test]
    fn routes_recruiting_email() {
        let engine = RulesEngine::default_rules();
        assert_eq!(
            route_of(&engine, "Exciting opportunity", "We're hiring a senior engineer."),
            Some(Route::Recruiter)
        );
    }

    #[test]
    fn routes_concert_email() {
        let engine = RulesEngine::default_rules();
        assert_eq!(
            route_of(&engine, "Just announced", "Presale starts Friday for the world tour."),
            Some(Route::Concert)
        );
    }

    #[test]
    fn routes_transactional_email() {
        let engine = RulesEngine::default_rules();
        assert_eq!(
            route_of(&engine, "Password reset", "Click below to reset your password."),
            Some(Route::Transactional)
        );
        assert_eq!(
            route_of(&engine, "Thanks!", "Here is your receipt for March."),
            Some(Route::Transactional)
        );
    }

    #[test]
    fn transactional_sender_rule() {
        let engine = RulesEngine::default_rules();
        let mut raw = crate::context::test_support::raw_context("t-2", "Update", "Hi there");
        raw.sender = Some("noreply@bank.example".into());
        let ctx = EmailContext::try_from(raw).unwrap();
        let matched = engine.evaluate(&ctx).unwrap();
        assert_eq!(matched.route, Route::Transactional);
        assert_eq!(matched.field, RuleField::Sender);
    }

    #[test]
    fn recruiting_beats_event_content() {
        let engine = RulesEngine::default_rules();
        assert_eq!(
            route_of(
                &engine,
                "Hiring for our festival team",
                "We are recruiting stage crew for the summer concert tour."
            ),
            Some(Route::Recruiter)
        );
    }

    #[test]
    fn event_beats_transactional_content() {
        let engine = RulesEngine::default_rules();
        assert_eq!(
            route_of(&engine, "Your order confirmation", "2 tickets for the concert."),
            Some(Route::Concert)
        );
    }

    #[test]
    fn unmatched_email_falls_through() {
        let engine = RulesEngine::default_rules();
        assert_eq!(route_of(&engine, "Lunch?", "Want to grab lunch tomorrow?"), None);
    }

    #[test]
    fn custom_rule_cannot_jump_precedence() {
        let mut engine = RulesEngine::empty();
        engine
            .add_rule(Route::Transactional, r"(?i)lunch", RuleField::Body, "custom")
            .unwrap();
        engine
            .add_rule(Route::Recruiter, r"(?i)lunch", RuleField::Body, "custom recruiter")
            .unwrap();
        assert_eq!(
            route_of(&engine, "Hi", "lunch chat about a role"),
            Some(Route::Recruiter)
        );
    }

    #[test]
    fn empty_rules_match_nothing() {
        let engine = RulesEngine::empty();
        assert_eq!(route_of(&engine, "Your receipt", "Invoice attached"), None);
    }
}
