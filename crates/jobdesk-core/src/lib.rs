//! Core domain model for jobdesk: raw submissions, lifecycle records and review actors.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod fingerprint;

pub use fingerprint::{fingerprint, Fingerprint};

pub const CRATE_NAME: &str = "jobdesk-core";

pub const TITLE_MAX_CHARS: usize = 500;
pub const COMPANY_MAX_CHARS: usize = 200;
pub const LOCATION_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 50_000;
pub const APPLY_URL_MAX_CHARS: usize = 2_000;
pub const POSTED_DATE_MAX_CHARS: usize = 100;
pub const SALARY_MAX_CHARS: usize = 200;
pub const SOURCE_MAX_CHARS: usize = 50;
pub const SNAPSHOT_URL_MAX_CHARS: usize = 500;
pub const REASON_MAX_CHARS: usize = 500;
pub const SEARCH_MAX_CHARS: usize = 200;

/// Upper bound for batch ingestion and bulk review calls.
pub const MAX_BATCH_ITEMS: usize = 100;
pub const MAX_PER_PAGE: u32 = 100;
pub const DEFAULT_PER_PAGE: u32 = 20;

/// A job posting as submitted by a scraper or API caller.
///
/// `title` and `company` default to empty so that a missing field is reported by
/// [`RawJob::validated`] with field detail instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJob {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_snapshot_url: Option<String>,
}

impl RawJob {
    pub fn new(title: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            company: company.into(),
            ..Default::default()
        }
    }

    /// Trim the identity fields, drop blank optionals and enforce length bounds.
    pub fn validated(mut self) -> Result<Self, ValidationErrors> {
        self.title = self.title.trim().to_string();
        self.company = self.company.trim().to_string();
        for field in [
            &mut self.location,
            &mut self.description,
            &mut self.apply_url,
            &mut self.posted_date,
            &mut self.salary,
            &mut self.source,
            &mut self.raw_snapshot_url,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }

        let mut errors = ValidationErrors::default();
        errors.require("title", &self.title, TITLE_MAX_CHARS);
        errors.require("company", &self.company, COMPANY_MAX_CHARS);
        errors.bound("location", self.location.as_deref(), LOCATION_MAX_CHARS);
        errors.bound("description", self.description.as_deref(), DESCRIPTION_MAX_CHARS);
        errors.bound("apply_url", self.apply_url.as_deref(), APPLY_URL_MAX_CHARS);
        errors.bound("posted_date", self.posted_date.as_deref(), POSTED_DATE_MAX_CHARS);
        errors.bound("salary", self.salary.as_deref(), SALARY_MAX_CHARS);
        errors.bound("source", self.source.as_deref(), SOURCE_MAX_CHARS);
        errors.bound(
            "raw_snapshot_url",
            self.raw_snapshot_url.as_deref(),
            SNAPSHOT_URL_MAX_CHARS,
        );
        errors.into_result(self)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(
            Some(&self.title),
            Some(&self.company),
            self.location.as_deref(),
            self.posted_date.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLocation {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl NormalizedLocation {
    pub fn raw_only(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            lat: None,
            lon: None,
            display_name: None,
        }
    }
}

/// A validated submission with its derived fields, ready to be written to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
    #[serde(flatten)]
    pub raw: RawJob,
    pub fingerprint: Option<Fingerprint>,
    pub posted_date_parsed: Option<NaiveDate>,
    pub salary_parsed: Option<SalaryRange>,
    pub location_normalized: Option<NormalizedLocation>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub ingested_at: DateTime<Utc>,
}

/// Review outcome, attached exactly once when a record leaves pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Disposition {
    Approved {
        approved_at: DateTime<Utc>,
        approved_by: String,
    },
    Rejected {
        rejected_at: DateTime<Utc>,
        rejected_by: String,
        rejection_reason: String,
    },
}

/// A stored record in one of the lifecycle stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub job: NormalizedJob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<Disposition>,
}

impl JobRecord {
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.job.fingerprint.as_ref()
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        match &self.disposition {
            Some(Disposition::Approved { approved_at, .. }) => Some(*approved_at),
            _ => None,
        }
    }

    pub fn rejected_at(&self) -> Option<DateTime<Utc>> {
        match &self.disposition {
            Some(Disposition::Rejected { rejected_at, .. }) => Some(*rejected_at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Archive,
    Pending,
    Approved,
    Rejected,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Archive, Stage::Pending, Stage::Approved, Stage::Rejected];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Archive => "archive",
            Stage::Pending => "pending",
            Stage::Approved => "approved",
            Stage::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Viewer,
}

impl Role {
    pub fn can_review(self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn can_read(self) -> bool {
        matches!(self, Role::Admin | Role::Viewer)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// The resolved identity behind a review or read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Error, Serialize)]
#[error("validation failed: {}", render_field_errors(.fields))]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

fn render_field_errors(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::default();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    fn require(&mut self, field: &str, value: &str, max_chars: usize) {
        if value.is_empty() {
            self.push(field, "must not be empty");
        } else {
            self.bound(field, Some(value), max_chars);
        }
    }

    fn bound(&mut self, field: &str, value: Option<&str>, max_chars: usize) {
        if let Some(value) = value {
            if value.chars().count() > max_chars {
                self.push(field, format!("must be at most {max_chars} characters"));
            }
        }
    }
}

/// Check a rejection reason: trimmed, 1..=500 characters.
pub fn validate_reason(reason: &str) -> Result<String, ValidationErrors> {
    let reason = reason.trim();
    let mut errors = ValidationErrors::default();
    errors.require("reason", reason, REASON_MAX_CHARS);
    errors.into_result(reason.to_string())
}

/// Check the size of a batch or bulk call.
pub fn validate_batch_len(field: &str, len: usize) -> Result<(), ValidationErrors> {
    if len == 0 {
        Err(ValidationErrors::single(field, "must contain at least one item"))
    } else if len > MAX_BATCH_ITEMS {
        Err(ValidationErrors::single(
            field,
            format!("must contain at most {MAX_BATCH_ITEMS} items"),
        ))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if page < 1 {
            errors.push("page", "must be at least 1");
        }
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            errors.push("per_page", format!("must be between 1 and {MAX_PER_PAGE}"));
        }
        errors.into_result(Self { page, per_page })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        total.div_ceil(u64::from(self.per_page)).max(1)
    }
}

/// Filters for a stage listing. Text filters are matched as case-insensitive substrings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub page: PageRequest,
    pub text: Option<String>,
    pub source: Option<String>,
    pub location: Option<String>,
}

impl ListQuery {
    pub fn page(page: PageRequest) -> Self {
        Self {
            page,
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Search text, trimmed and capped at [`SEARCH_MAX_CHARS`]; `None` when blank.
    pub fn search_text(&self) -> Option<String> {
        clip_search(self.text.as_deref())
    }

    pub fn location_text(&self) -> Option<String> {
        clip_search(self.location.as_deref())
    }

    pub fn source_filter(&self) -> Option<&str> {
        self.source.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

fn clip_search(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    Some(value.chars().take(SEARCH_MAX_CHARS).collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u64,
    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(request: PageRequest, total: u64, data: Vec<T>) -> Self {
        Self {
            page: request.page(),
            per_page: request.per_page(),
            total,
            total_pages: request.total_pages(total),
            data,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            page: self.page,
            per_page: self.per_page,
            total: self.total,
            total_pages: self.total_pages,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_trims_identity_and_reports_each_field() {
        let job = RawJob {
            title: "  Backend Engineer ".into(),
            company: " Acme ".into(),
            location: Some("   ".into()),
            ..Default::default()
        }
        .validated()
        .expect("valid");
        assert_eq!(job.title, "Backend Engineer");
        assert_eq!(job.company, "Acme");
        assert_eq!(job.location, None);

        let err = RawJob {
            title: "   ".into(),
            company: "x".repeat(COMPANY_MAX_CHARS + 1),
            source: Some("s".repeat(SOURCE_MAX_CHARS + 1)),
            ..Default::default()
        }
        .validated()
        .unwrap_err();
        let fields = err.fields.iter().map(|f| f.field.as_str()).collect::<Vec<_>>();
        assert_eq!(fields, vec!["title", "company", "source"]);
        assert!(err.to_string().contains("title: must not be empty"));
    }

    #[test]
    fn length_bounds_count_characters_not_bytes() {
        let job = RawJob::new("é".repeat(TITLE_MAX_CHARS), "Acme").validated();
        assert!(job.is_ok());
    }

    #[test]
    fn missing_identity_fields_deserialize_as_empty() {
        let raw: RawJob = serde_json::from_str(r#"{"location": "Paris"}"#).expect("json");
        let err = raw.validated().unwrap_err();
        assert_eq!(err.fields.len(), 2);
    }

    #[test]
    fn pagination_math() {
        let page = PageRequest::new(2, 20).expect("page");
        assert_eq!(page.offset(), 20);
        assert_eq!(page.total_pages(45), 3);
        assert_eq!(page.total_pages(0), 1);
        assert_eq!(page.total_pages(40), 2);

        let err = PageRequest::new(0, 101).unwrap_err();
        assert_eq!(err.fields.len(), 2);
    }

    #[test]
    fn search_text_is_clipped_and_blank_is_none() {
        let q = ListQuery::default().with_text("a".repeat(500)).with_source("  ");
        assert_eq!(q.search_text().map(|s| s.len()), Some(SEARCH_MAX_CHARS));
        assert_eq!(q.source_filter(), None);
        assert_eq!(ListQuery::default().with_text("   ").search_text(), None);
    }

    #[test]
    fn reason_and_batch_bounds() {
        assert_eq!(validate_reason("  spam ").as_deref(), Ok("spam"));
        assert!(validate_reason(" ").is_err());
        assert!(validate_reason(&"r".repeat(REASON_MAX_CHARS + 1)).is_err());
        assert!(validate_batch_len("jobs", 0).is_err());
        assert!(validate_batch_len("jobs", MAX_BATCH_ITEMS).is_ok());
        assert!(validate_batch_len("jobs", MAX_BATCH_ITEMS + 1).is_err());
    }

    #[test]
    fn disposition_serializes_with_decision_tag() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let value = serde_json::to_value(Disposition::Rejected {
            rejected_at: at,
            rejected_by: "ops".into(),
            rejection_reason: "spam".into(),
        })
        .expect("json");
        assert_eq!(value["decision"], "rejected");
        assert_eq!(value["rejection_reason"], "spam");
    }

    #[test]
    fn roles() {
        assert!(Role::Admin.can_review());
        assert!(!Role::Viewer.can_review());
        assert!(Role::Viewer.can_read());
        assert_eq!("ADMIN".parse::<Role>(), Ok(Role::Admin));
        assert!("owner".parse::<Role>().is_err());
    }
}
