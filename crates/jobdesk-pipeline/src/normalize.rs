//! Field normalizer: free-text date, salary and location into structured sub-records, plus
//! keyword tags. Every step degrades to "absent" instead of failing the submission.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveDate, Utc};
use jobdesk_core::{NormalizedJob, NormalizedLocation, RawJob, SalaryRange};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const DEFAULT_GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Date-parse capability: free text to a calendar date, or `None`.
pub trait DateParser: Send + Sync {
    fn parse_date(&self, text: &str, now: DateTime<Utc>) -> Option<NaiveDate>;
}

/// Best-effort parser for the date shapes job boards actually print.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuzzyDateParser;

const MONTHS: &str = "jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec";

struct DatePatterns {
    relative: Regex,
    year_first: Regex,
    month_first: Regex,
    day_dotted: Regex,
    day_month_name: Regex,
    month_name_day: Regex,
}

fn date_patterns() -> &'static DatePatterns {
    static PATTERNS: OnceLock<DatePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |pattern: &str| Regex::new(pattern).expect("date pattern compiles");
        DatePatterns {
            relative: compile(r"(\d+)\+?\s*(hour|hr|day|week|wk|month|mo)s?\s+ago"),
            year_first: compile(r"\b(\d{4})[-/](\d{1,2})[-/](\d{1,2})\b"),
            month_first: compile(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b"),
            day_dotted: compile(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b"),
            day_month_name: compile(&format!(
                r"\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTHS})[a-z]*\.?,?\s+(\d{{4}})\b"
            )),
            month_name_day: compile(&format!(
                r"\b({MONTHS})[a-z]*\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"
            )),
        }
    })
}

fn month_number(name: &str) -> Option<u32> {
    let index = MONTHS.split('|').position(|m| name.starts_with(m))?;
    u32::try_from(index + 1).ok()
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

impl FuzzyDateParser {
    fn relative(text: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
        let today = now.date_naive();
        if ["just posted", "just now", "today"]
            .iter()
            .any(|phrase| text.contains(phrase))
        {
            return Some(today);
        }
        if text.contains("yesterday") {
            return today.pred_opt();
        }

        let caps = date_patterns().relative.captures(text)?;
        let amount: u32 = caps[1].parse().ok()?;
        let amount_i64 = i64::from(amount);
        match &caps[2] {
            "hour" | "hr" => now
                .checked_sub_signed(ChronoDuration::try_hours(amount_i64)?)
                .map(|ts| ts.date_naive()),
            "day" => today.checked_sub_signed(ChronoDuration::try_days(amount_i64)?),
            "week" | "wk" => today.checked_sub_signed(ChronoDuration::try_weeks(amount_i64)?),
            _ => today.checked_sub_months(Months::new(amount)),
        }
    }

    fn absolute(text: &str) -> Option<NaiveDate> {
        let patterns = date_patterns();
        if let Some(c) = patterns.year_first.captures(text) {
            if let Some(date) = ymd(&c[1], &c[2], &c[3]) {
                return Some(date);
            }
        }
        if let Some(c) = patterns.month_first.captures(text) {
            if let Some(date) = ymd(&c[3], &c[1], &c[2]) {
                return Some(date);
            }
        }
        if let Some(c) = patterns.day_dotted.captures(text) {
            if let Some(date) = ymd(&c[3], &c[2], &c[1]) {
                return Some(date);
            }
        }
        if let Some(c) = patterns.month_name_day.captures(text) {
            let month = month_number(&c[1])?;
            if let Some(date) = ymd(&c[3], &month.to_string(), &c[2]) {
                return Some(date);
            }
        }
        if let Some(c) = patterns.day_month_name.captures(text) {
            let month = month_number(&c[2])?;
            return ymd(&c[3], &month.to_string(), &c[1]);
        }
        None
    }
}

impl DateParser for FuzzyDateParser {
    fn parse_date(&self, text: &str, now: DateTime<Utc>) -> Option<NaiveDate> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(&text.to_uppercase()) {
            return Some(ts.date_naive());
        }
        Self::absolute(&text).or_else(|| Self::relative(&text, now))
    }
}

fn salary_digits() -> &'static Regex {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new("[0-9]{2,7}").expect("salary pattern compiles"))
}

/// Extract a salary range from free text: thousands separators are dropped, then every run of
/// 2 to 7 ASCII digits counts as a figure.
pub fn parse_salary(text: &str) -> Option<SalaryRange> {
    let cleaned = text.replace(',', "");
    let figures = salary_digits()
        .find_iter(&cleaned)
        .filter_map(|m| m.as_str().parse::<i64>().ok())
        .collect::<Vec<_>>();
    let min = figures.iter().copied().min()?;
    let max = figures.iter().copied().max()?;
    Some(SalaryRange { min, max })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocoder returned unusable coordinates for {query}: {detail}")]
    BadResponse { query: String, detail: String },
}

/// Geocode capability. `Ok(None)` means the provider had no match.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<GeoPoint>, GeocodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGeocoder;

#[async_trait]
impl Geocoder for NoopGeocoder {
    async fn geocode(&self, _query: &str) -> Result<Option<GeoPoint>, GeocodeError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    lat: String,
    lon: String,
    display_name: String,
}

/// OpenStreetMap Nominatim search API.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub const DEFAULT_URL: &'static str = "https://nominatim.openstreetmap.org";

    pub fn new(
        base_url: impl Into<String>,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    #[instrument(skip(self))]
    async fn geocode(&self, query: &str) -> Result<Option<GeoPoint>, GeocodeError> {
        let response: Vec<NominatimResponse> = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", "1"),
                ("accept-language", "en"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(hit) = response.into_iter().next() else {
            return Ok(None);
        };
        let coordinate = |value: &str| {
            value.parse::<f64>().map_err(|err| GeocodeError::BadResponse {
                query: query.to_string(),
                detail: format!("{value}: {err}"),
            })
        };
        Ok(Some(GeoPoint {
            lat: coordinate(&hit.lat)?,
            lon: coordinate(&hit.lon)?,
            display_name: hit.display_name,
        }))
    }
}

/// Which submission fields a tag rule looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagScope {
    Title,
    #[default]
    TitleAndCompany,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub contains_any: Vec<String>,
    #[serde(default)]
    pub scope: TagScope,
}

impl TagRule {
    fn matches(&self, title: &str, company: &str) -> bool {
        self.contains_any.iter().any(|needle| {
            let needle = needle.to_lowercase();
            contains_word(title, &needle)
                || (self.scope == TagScope::TitleAndCompany && contains_word(company, &needle))
        })
    }
}

/// `needle` occurs in `haystack` with no letter or digit directly on either side.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

/// Keyword rule table, matched case-insensitively on whole words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRules {
    rules: Vec<TagRule>,
}

impl Default for TagRules {
    fn default() -> Self {
        let rule = |tag: &str, needles: &[&str], scope: TagScope| TagRule {
            tag: tag.to_string(),
            contains_any: needles.iter().map(|n| n.to_string()).collect(),
            scope,
        };
        use TagScope::{Title, TitleAndCompany};
        Self {
            rules: vec![
                rule("seniority:senior", &["senior", "lead"], Title),
                rule("seniority:intern", &["intern", "internship"], Title),
                rule("skill:python", &["python", "django"], TitleAndCompany),
                rule("skill:rust", &["rust"], TitleAndCompany),
                rule(
                    "skill:javascript",
                    &["javascript", "typescript", "react", "node.js"],
                    TitleAndCompany,
                ),
                rule("skill:go", &["golang"], TitleAndCompany),
            ],
        }
    }
}

impl TagRules {
    pub fn new(rules: Vec<TagRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TagRule] {
        &self.rules
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: TagRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(file.rules))
    }

    /// `rules/tags.yaml` under the workspace root when present, the built-in table otherwise.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("tags.yaml");
        if path.exists() {
            Self::from_yaml_file(&path)
        } else {
            debug!(path = %path.display(), "no tag rules file; using built-in rules");
            Ok(Self::default())
        }
    }

    pub fn tags_for(&self, raw: &RawJob) -> BTreeSet<String> {
        let title = raw.title.to_lowercase();
        let company = raw.company.to_lowercase();
        let mut tags = self
            .rules
            .iter()
            .filter(|rule| rule.matches(&title, &company))
            .map(|rule| rule.tag.clone())
            .collect::<BTreeSet<_>>();
        if let Some(source) = raw.source.as_deref().filter(|s| !s.is_empty()) {
            tags.insert(format!("source:{source}"));
        }
        tags
    }
}

/// Applies the date, salary, location and tag steps to a validated submission.
#[derive(Clone)]
pub struct Normalizer {
    dates: Arc<dyn DateParser>,
    geocoder: Arc<dyn Geocoder>,
    geocode_timeout: Duration,
    tags: TagRules,
}

impl Normalizer {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self {
            dates: Arc::new(FuzzyDateParser),
            geocoder,
            geocode_timeout: DEFAULT_GEOCODE_TIMEOUT,
            tags: TagRules::default(),
        }
    }

    pub fn with_date_parser(mut self, dates: Arc<dyn DateParser>) -> Self {
        self.dates = dates;
        self
    }

    pub fn with_geocode_timeout(mut self, timeout: Duration) -> Self {
        self.geocode_timeout = timeout;
        self
    }

    pub fn with_tag_rules(mut self, tags: TagRules) -> Self {
        self.tags = tags;
        self
    }

    /// Derive every normalized field. The fingerprint comes from the values as submitted.
    pub async fn normalize(&self, raw: RawJob, now: DateTime<Utc>) -> NormalizedJob {
        let posted_date_parsed = raw
            .posted_date
            .as_deref()
            .and_then(|text| self.dates.parse_date(text, now));
        let salary_parsed = raw.salary.as_deref().and_then(parse_salary);
        let location_normalized = match raw.location.as_deref() {
            Some(location) if !location.trim().is_empty() => {
                Some(self.normalize_location(location).await)
            }
            _ => None,
        };
        let tags = self.tags.tags_for(&raw);

        NormalizedJob {
            fingerprint: Some(raw.fingerprint()),
            raw,
            posted_date_parsed,
            salary_parsed,
            location_normalized,
            tags,
            ingested_at: now,
        }
    }

    pub async fn normalize_location(&self, raw: &str) -> NormalizedLocation {
        let lookup = tokio::time::timeout(self.geocode_timeout, self.geocoder.geocode(raw)).await;
        match lookup {
            Ok(Ok(Some(point))) => NormalizedLocation {
                raw: raw.to_string(),
                lat: Some(point.lat),
                lon: Some(point.lon),
                display_name: Some(point.display_name),
            },
            Ok(Ok(None)) => {
                debug!(location = raw, "geocoder had no match");
                NormalizedLocation::raw_only(raw)
            }
            Ok(Err(err)) => {
                warn!(location = raw, error = %err, "geocoding failed; keeping raw location");
                NormalizedLocation::raw_only(raw)
            }
            Err(_) => {
                warn!(
                    location = raw,
                    timeout_ms = self.geocode_timeout.as_millis() as u64,
                    "geocoding timed out; keeping raw location"
                );
                NormalizedLocation::raw_only(raw)
            }
        }
    }
}
