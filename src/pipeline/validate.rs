//! Validators: structural and semantic checks on extracted items.
//!
//! A failing check is not an error: it yields `Validation::Rejected` with a
//! reason, and the item never reaches scheduling.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use regex::Regex;

use crate::context::EmailContext;
use crate::error::ExtractionError;
use crate::pipeline::types::{
    ItemPayload, RawItem, RejectionReason, ValidatedItem, ValidatedPayload, Validation,
};

/// External validation function.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(
        &self,
        context: &EmailContext,
        item: &RawItem,
    ) -> Result<Validation, ExtractionError>;
}

/// Start time assumed for events that only give a date.
const DEFAULT_EVENT_TIME: (u32, u32) = (20, 0);

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%B %d %Y %H:%M",
    "%B %d %Y %I:%M %p",
    "%d %B %Y %H:%M",
    "%d %B %Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d %Y", "%d %B %Y", "%m/%d/%Y"];

/// Formats without a year; parsed with the year prepended.
const YEARLESS_DATETIME_FORMATS: &[&str] = &[
    "%Y %B %d %H:%M",
    "%Y %B %d %I:%M %p",
    "%Y %d %B %H:%M",
    "%Y %d %B %I:%M %p",
];

const YEARLESS_DATE_FORMATS: &[&str] = &["%Y %B %d", "%Y %d %B"];

static ORDINAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").expect("valid regex"));

static WEEKDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)(day|nesday|rsday|urday)?\b\.?")
        .expect("valid regex")
});

/// An hour with a meridiem but no minutes. Must not follow a colon, or the
/// minutes of `7:30 pm` would be taken for an hour.
static BARE_HOUR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|[^:\d])(\d{1,2})\s*(am|pm)\b").expect("valid regex")
});

static CLOCK_MERIDIEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}:\d{2})\s*(am|pm)\b").expect("valid regex")
});

static AT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(at|@)\s+").expect("valid regex"));

static ABBREV_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z]{3,4})\.").expect("valid regex"));

/// Strip ordinals, weekdays, commas and "at", and expand `8pm` to `8:00 pm`.
fn normalize_date_text(raw: &str) -> String {
    let text = raw.trim().trim_end_matches(['.', ';']);
    let text = WEEKDAY.replace_all(text, "");
    let text = ORDINAL.replace_all(&text, "$1");
    let text = ABBREV_DOT.replace_all(&text, "$1");
    let text = AT_WORD.replace_all(&text, " ");
    let text = BARE_HOUR.replace_all(&text, "${1}${2}:00 $3");
    let text = CLOCK_MERIDIEM.replace_all(&text, "$1 $2");
    text.replace(',', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a free-form event date relative to `now`.
///
/// Naive times are read in `now`'s offset. A date without a year takes the
/// year of `now`, moved to next year if that would already be past.
pub fn parse_event_datetime(
    raw: &str,
    now: DateTime<FixedOffset>,
) -> Result<DateTime<FixedOffset>, RejectionReason> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Ok(dt);
    }

    let text = normalize_date_text(raw);
    if text.is_empty() {
        return Err(RejectionReason::MissingDate);
    }
    let tz = *now.offset();
    let default_time =
        NaiveTime::from_hms_opt(DEFAULT_EVENT_TIME.0, DEFAULT_EVENT_TIME.1, 0).unwrap_or_default();

    let localize = |naive: NaiveDateTime| tz.from_local_datetime(&naive).single();

    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, fmt)
            && let Some(dt) = localize(naive)
        {
            return Ok(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&text, fmt)
            && let Some(dt) = localize(date.and_time(default_time))
        {
            return Ok(dt);
        }
    }

    let with_year = |year: i32| -> Option<DateTime<FixedOffset>> {
        let candidate = format!("{year} {text}");
        YEARLESS_DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&candidate, fmt).ok())
            .or_else(|| {
                YEARLESS_DATE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(&candidate, fmt).ok())
                    .map(|d| d.and_time(default_time))
            })
            .and_then(localize)
    };

    match with_year(now.year()) {
        Some(dt) if dt >= now => Ok(dt),
        Some(_) => with_year(now.year() + 1)
            .ok_or_else(|| RejectionReason::UnparseableDate(raw.trim().to_string())),
        None => Err(RejectionReason::UnparseableDate(raw.trim().to_string())),
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Checks event items: name and a parseable, future date are required.
#[derive(Debug, Default)]
pub struct EventValidator;

impl EventValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn check(item: &RawItem, now: DateTime<FixedOffset>) -> Validation {
        let ItemPayload::Event(details) = &item.payload else {
            return Validation::Rejected {
                reason: RejectionReason::WrongKind(item.payload.kind().into()),
            };
        };

        let Some(name) = non_blank(&details.event_name) else {
            return Validation::Rejected {
                reason: RejectionReason::MissingName,
            };
        };
        let Some(raw_date) = non_blank(&details.date_time) else {
            return Validation::Rejected {
                reason: RejectionReason::MissingDate,
            };
        };
        let starts_at = match parse_event_datetime(&raw_date, now) {
            Ok(dt) => dt,
            Err(reason) => return Validation::Rejected { reason },
        };
        if starts_at < now {
            return Validation::Rejected {
                reason: RejectionReason::EventInPast,
            };
        }

        Validation::Valid(ValidatedItem {
            item_id: item.id.clone(),
            payload: ValidatedPayload::Event {
                name,
                starts_at,
                venue: non_blank(&details.venue_address),
                ticket_link: non_blank(&details.ticket_link),
                presale_info: non_blank(&details.presale_info),
                notes: non_blank(&details.additional_notes).or_else(|| non_blank(&details.summary)),
            },
        })
    }
}

#[async_trait]
impl Validator for EventValidator {
    fn name(&self) -> &str {
        "event-validator"
    }

    async fn validate(
        &self,
        context: &EmailContext,
        item: &RawItem,
    ) -> Result<Validation, ExtractionError> {
        Ok(Self::check(item, context.now()))
    }
}

/// Checks recruiter items: company and role are required.
#[derive(Debug, Default)]
pub struct RecruiterValidator;

impl RecruiterValidator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Validator for RecruiterValidator {
    fn name(&self) -> &str {
        "recruiter-validator"
    }

    async fn validate(
        &self,
        _context: &EmailContext,
        item: &RawItem,
    ) -> Result<Validation, ExtractionError> {
        let ItemPayload::Recruiter(details) = &item.payload else {
            return Ok(Validation::Rejected {
                reason: RejectionReason::WrongKind(item.payload.kind().into()),
            });
        };
        let Some(company) = non_blank(&details.company) else {
            return Ok(Validation::Rejected {
                reason: RejectionReason::MissingCompany,
            });
        };
        let Some(role) = non_blank(&details.role) else {
            return Ok(Validation::Rejected {
                reason: RejectionReason::MissingRole,
            });
        };
        Ok(Validation::Valid(ValidatedItem {
            item_id: item.id.clone(),
            payload: ValidatedPayload::Recruiter {
                company,
                role,
                contact: non_blank(&details.name),
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{EventDetails, RecruiterDetails};

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-06-01T09:00:00+02:00").unwrap()
    }

    fn event(name: Option<&str>, date: Option<&str>) -> RawItem {
        RawItem::new(ItemPayload::Event(EventDetails {
            event_name: name.map(String::from),
            date_time: date.map(String::from),
            venue_address: Some("  Brooklyn Steel ".into()),
            ..Default::default()
        }))
    }

    #[test]
    fn parses_common_formats() {
        let cases = [
            ("2026-07-14 20:00", "2026-07-14T20:00:00+02:00"),
            ("2026-07-14T19:30:00+00:00", "2026-07-14T19:30:00+00:00"),
            ("July 14, 2026 at 8pm", "2026-07-14T20:00:00+02:00"),
            ("Tuesday, July 14th 2026, 7:30 PM", "2026-07-14T19:30:00+02:00"),
            ("14 July 2026 21:00", "2026-07-14T21:00:00+02:00"),
            ("07/14/2026", "2026-07-14T20:00:00+02:00"),
            ("2026-07-14", "2026-07-14T20:00:00+02:00"),
        ];
        for (raw, expected) in cases {
            let parsed = parse_event_datetime(raw, now()).unwrap_or_else(|e| panic!("{raw}: {e}"));
            assert_eq!(parsed.to_rfc3339(), expected, "input {raw}");
        }
    }

    #[test]
    fn clock_time_with_meridiem_keeps_minutes() {
        let cases = [
            ("July 14, 2026 7:30 PM", "2026-07-14T19:30:00+02:00"),
            ("07/14/2026 7:30 pm", "2026-07-14T19:30:00+02:00"),
            ("July 14 2026 7:30pm", "2026-07-14T19:30:00+02:00"),
            ("14 July 2026 10:15 am", "2026-07-14T10:15:00+02:00"),
            ("July 14 2026 8pm", "2026-07-14T20:00:00+02:00"),
        ];
        for (raw, expected) in cases {
            let parsed = parse_event_datetime(raw, now()).unwrap_or_else(|e| panic!("{raw}: {e}"));
            assert_eq!(parsed.to_rfc3339(), expected, "input {raw}");
        }
    }

    #[test]
    fn yearless_date_takes_current_year() {
        let parsed = parse_event_datetime("Aug 3", now()).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-08-03T20:00:00+02:00");
    }

    #[test]
    fn yearless_past_date_rolls_forward() {
        let parsed = parse_event_datetime("March 3 at 9pm", now()).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2027-03-03T21:00:00+02:00");
    }

    #[test]
    fn garbage_date_is_unparseable() {
        assert!(matches!(
            parse_event_datetime("sometime soon", now()),
            Err(RejectionReason::UnparseableDate(_))
        ));
    }

    #[test]
    fn complete_event_validates() {
        let item = event(Some("Arcade Fire"), Some("2026-07-01 20:00"));
        let Validation::Valid(valid) = EventValidator::check(&item, now()) else {
            panic!("expected valid");
        };
        assert_eq!(valid.item_id, item.id);
        let ValidatedPayload::Event { name, venue, .. } = valid.payload else {
            panic!("expected event");
        };
        assert_eq!(name, "Arcade Fire");
        assert_eq!(venue.as_deref(), Some("Brooklyn Steel"));
    }

    #[test]
    fn missing_date_is_rejected() {
        let item = event(Some("Arcade Fire"), None);
        assert_eq!(
            EventValidator::check(&item, now()),
            Validation::Rejected {
                reason: RejectionReason::MissingDate
            }
        );
        let blank = event(Some("Arcade Fire"), Some("   "));
        assert_eq!(
            EventValidator::check(&blank, now()),
            Validation::Rejected {
                reason: RejectionReason::MissingDate
            }
        );
    }

    #[test]
    fn missing_name_is_rejected() {
        let item = event(None, Some("2026-07-01"));
        assert_eq!(
            EventValidator::check(&item, now()),
            Validation::Rejected {
                reason: RejectionReason::MissingName
            }
        );
    }

    #[test]
    fn past_event_is_rejected() {
        let item = event(Some("Old show"), Some("2026-05-01 20:00"));
        assert_eq!(
            EventValidator::check(&item, now()),
            Validation::Rejected {
                reason: RejectionReason::EventInPast
            }
        );
    }

    #[tokio::test]
    async fn recruiter_requires_company_and_role() {
        let ctx = crate::context::test_support::context("r-1", "s", "b");
        let validator = RecruiterValidator::new();

        let missing = RawItem::new(ItemPayload::Recruiter(RecruiterDetails {
            name: Some("Jane".into()),
            company: Some("Acme".into()),
            role: None,
        }));
        assert_eq!(
            validator.validate(&ctx, &missing).await.unwrap(),
            Validation::Rejected {
                reason: RejectionReason::MissingRole
            }
        );

        let complete = RawItem::new(ItemPayload::Recruiter(RecruiterDetails {
            name: Some("Jane".into()),
            company: Some("Acme".into()),
            role: Some("Engineer".into()),
        }));
        assert!(matches!(
            validator.validate(&ctx, &complete).await.unwrap(),
            Validation::Valid(_)
        ));
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected() {
        let ctx = crate::context::test_support::context("r-2", "s", "b");
        let item = event(Some("Show"), Some("2026-07-01"));
        assert!(matches!(
            RecruiterValidator::new().validate(&ctx, &item).await.unwrap(),
            Validation::Rejected {
                reason: RejectionReason::WrongKind(_)
            }
        ));
    }
}
