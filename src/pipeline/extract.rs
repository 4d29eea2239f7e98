//! Extractors: pull structured items out of an email body.
//!
//! The `Extractor` trait is the typed boundary around whatever does the
//! pulling (an LLM in production, regexes here). Extractors read the
//! context; they never modify it.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::context::EmailContext;
use crate::error::ExtractionError;
use crate::pipeline::types::{EventDetails, ItemPayload, RecruiterDetails};

/// External extraction function.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, context: &EmailContext) -> Result<Vec<ItemPayload>, ExtractionError>;
}

static LABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(date|when|time|venue|where|location|address|tickets?|link|presale|pre-sale|notes?|summary)\s*:\s*(.+)$",
    )
    .expect("valid regex")
});

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>")]+"#).expect("valid regex"));

static DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{4}-\d{1,2}-\d{1,2}(?:[ T]\d{1,2}:\d{2})?|\d{1,2}/\d{1,2}/\d{4}|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:,?\s+\d{4})?(?:,?\s+(?:at\s+)?\d{1,2}(?::\d{2})?\s*(?:am|pm)?)?)\b",
    )
    .expect("valid regex")
});

static PRESALE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bpre-?sale\b").expect("valid regex"));

/// Rule-based event extractor.
///
/// The body is split into blank-line separated blocks. A block is an event
/// when it carries at least one labeled field (`Date:`, `Venue:`, ...) or a
/// recognizable date. Its first unlabeled line is the event name.
#[derive(Debug, Default)]
pub struct RuleEventExtractor;

impl RuleEventExtractor {
    pub fn new() -> Self {
        Self
    }

    fn parse_block(block: &str) -> Option<EventDetails> {
        let mut details = EventDetails::default();
        let mut has_field = false;
        let mut notes = Vec::new();

        for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(caps) = LABELED.captures(line) {
                has_field = true;
                let value = caps[2].trim().to_string();
                match caps[1].to_ascii_lowercase().as_str() {
                    "date" | "when" | "time" => details.date_time = Some(value),
                    "venue" | "where" | "location" | "address" => {
                        details.venue_address = Some(value)
                    }
                    "ticket" | "tickets" | "link" => {
                        let link = URL.find(&value).map(|m| m.as_str().to_string());
                        details.ticket_link = link.or(Some(value));
                    }
                    "presale" | "pre-sale" => details.presale_info = Some(value),
                    "summary" => details.summary = Some(value),
                    _ => notes.push(value),
                }
                continue;
            }

            if details.event_name.is_none() {
                details.event_name = Some(line.trim_end_matches(':').trim().to_string());
            } else if PRESALE.is_match(line) && details.presale_info.is_none() {
                details.presale_info = Some(line.to_string());
            } else {
                notes.push(line.to_string());
            }

            if details.ticket_link.is_none()
                && let Some(url) = URL.find(line)
            {
                details.ticket_link = Some(url.as_str().to_string());
            }
        }

        if details.date_time.is_none()
            && let Some(found) = DATE_TOKEN.find(block)
        {
            details.date_time = Some(found.as_str().to_string());
            has_field = true;
        }

        if !has_field {
            return None;
        }
        if !notes.is_empty() {
            details.additional_notes = Some(notes.join("\n"));
        }
        Some(details)
    }
}

#[async_trait]
impl Extractor for RuleEventExtractor {
    fn name(&self) -> &str {
        "rule-events"
    }

    async fn extract(&self, context: &EmailContext) -> Result<Vec<ItemPayload>, ExtractionError> {
        let body = context.body().replace("\r\n", "\n");
        Ok(body
            .split("\n\n")
            .filter_map(Self::parse_block)
            .map(ItemPayload::Event)
            .collect())
    }
}

static LABELED_ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:role|position|title|job)\s*:\s*(.+?)\s*$").expect("valid regex")
});

static LABELED_COMPANY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:company|employer|client)\s*:\s*(.+?)\s*$").expect("valid regex")
});

static ROLE_AT_COMPANY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?i:for|as|about|is)\s+(?:(?i:an?|the|our)\s+)?(?P<role>[A-Za-z][\w/&+\- ]{2,60}?)\s+(?:(?i:role|position|opening|job)\s+)?(?i:at|with)\s+(?P<company>[A-Z][\w&\-]*(?:\s+[A-Z][\w&\-]*)*)",
    )
    .expect("valid regex")
});

/// Rule-based recruiter extractor. Always yields exactly one item: the email
/// itself is the recruiting approach, and missing fields surface at
/// validation.
#[derive(Debug, Default)]
pub struct RuleRecruiterExtractor;

impl RuleRecruiterExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for RuleRecruiterExtractor {
    fn name(&self) -> &str {
        "rule-recruiter"
    }

    async fn extract(&self, context: &EmailContext) -> Result<Vec<ItemPayload>, ExtractionError> {
        let text = format!("{}\n{}", context.subject(), context.body());

        let mut role = LABELED_ROLE.captures(&text).map(|c| c[1].to_string());
        let mut company = LABELED_COMPANY.captures(&text).map(|c| c[1].to_string());

        if let Some(caps) = ROLE_AT_COMPANY.captures(&text) {
            if role.is_none() {
                role = Some(caps["role"].trim().to_string());
            }
            if company.is_none() {
                company = Some(caps["company"].trim().to_string());
            }
        }

        Ok(vec![ItemPayload::Recruiter(RecruiterDetails {
            name: sender_name(context.sender()),
            company: company.map(|c| c.trim_end_matches(['.', ',', ';']).to_string()),
            role,
        })])
    }
}

/// Display name from `Name <addr>`, if any.
pub fn sender_name(sender: &str) -> Option<String> {
    let (name, _) = sender.split_once('<')?;
    let name = name.trim().trim_matches('"').trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::context;

    fn events(body: &str) -> Vec<EventDetails> {
        body.split("\n\n")
            .filter_map(RuleEventExtractor::parse_block)
            .collect()
    }

    #[test]
    fn labeled_block_becomes_event() {
        let found = events(
            "Radiohead: Live\nDate: 2026-07-14 20:00\nVenue: Madison Square Garden\nTickets: https://t.example/rh",
        );
        assert_eq!(found.len(), 1);
        let event = &found[0];
        assert_eq!(event.event_name.as_deref(), Some("Radiohead: Live"));
        assert_eq!(event.date_time.as_deref(), Some("2026-07-14 20:00"));
        assert_eq!(event.venue_address.as_deref(), Some("Madison Square Garden"));
        assert_eq!(event.ticket_link.as_deref(), Some("https://t.example/rh"));
    }

    #[test]
    fn intro_block_without_fields_is_skipped() {
        let found = events("Hi friend,\nsome shows you might like.\n\nArcade Fire\nVenue: Brooklyn Steel");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_name.as_deref(), Some("Arcade Fire"));
        assert_eq!(found[0].date_time, None);
    }

    #[test]
    fn inline_date_is_picked_up() {
        let found = events("The National at Forest Hills on July 20, 2026 at 8pm\nPresale starts Tuesday");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].date_time.as_deref(), Some("July 20, 2026 at 8pm"));
        assert_eq!(found[0].presale_info.as_deref(), Some("Presale starts Tuesday"));
    }

    #[tokio::test]
    async fn extractor_reads_context_body() {
        let ctx = context(
            "e-1",
            "Tour dates",
            "Show one\nDate: 2026-07-01\n\nShow two\nDate: 2026-08-01",
        );
        let items = RuleEventExtractor::new().extract(&ctx).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.kind() == "event"));
    }

    #[tokio::test]
    async fn plain_mail_yields_no_events() {
        let ctx = context("e-2", "Lunch", "Want to grab lunch tomorrow?");
        assert!(RuleEventExtractor::new().extract(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recruiter_role_and_company_from_prose() {
        let ctx = context(
            "r-1",
            "Opportunity",
            "Hi! I'm reaching out about a Senior Rust Engineer role at Acme Corp. Interested?",
        );
        let items = RuleRecruiterExtractor::new().extract(&ctx).await.unwrap();
        let ItemPayload::Recruiter(details) = &items[0] else {
            panic!("expected recruiter item");
        };
        assert_eq!(details.role.as_deref(), Some("Senior Rust Engineer"));
        assert_eq!(details.company.as_deref(), Some("Acme Corp"));
        assert_eq!(details.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn recruiter_labeled_fields_win() {
        let ctx = context("r-2", "Role", "Company: Globex\nRole: Staff Engineer");
        let items = RuleRecruiterExtractor::new().extract(&ctx).await.unwrap();
        let ItemPayload::Recruiter(details) = &items[0] else {
            panic!("expected recruiter item");
        };
        assert_eq!(details.company.as_deref(), Some("Globex"));
        assert_eq!(details.role.as_deref(), Some("Staff Engineer"));
    }

    #[test]
    fn sender_name_parsing() {
        assert_eq!(sender_name("Jane Doe <jane@x.com>").as_deref(), Some("Jane Doe"));
        assert_eq!(sender_name("\"Bob\" <b@x.com>").as_deref(), Some("Bob"));
        assert_eq!(sender_name("plain@x.com"), None);
    }
}
