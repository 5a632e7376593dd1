//! Core domain model for tournament source ingestion and entity resolution.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};
use uuid::Uuid;

pub mod facts;
pub mod states;
pub mod url;

pub use facts::{CandidateFact, FactDecision, FactKind, FactPayload};
pub use crate::url::{normalize, CanonicalUrl};

pub const CRATE_NAME: &str = "tourney-core";

/// Slugs longer than this are truncated at a character boundary.
pub const SLUG_MAX_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("invalid url {input:?}: {reason}")]
    InvalidUrl { input: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Extractor family a source is parsed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    TableListing,
    VenueCalendar,
    StateDirectory,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::TableListing => "table_listing",
            SourceType::VenueCalendar => "venue_calendar",
            SourceType::StateDirectory => "state_directory",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table_listing" => Ok(SourceType::TableListing),
            "venue_calendar" => Ok(SourceType::VenueCalendar),
            "state_directory" => Ok(SourceType::StateDirectory),
            _ => Err(ParseEnumError::new("source type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Success,
    Partial,
    Failed,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStatus::Success => "success",
            SweepStatus::Partial => "partial",
            SweepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SweepStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SweepStatus::Success),
            "partial" => Ok(SweepStatus::Partial),
            "failed" => Ok(SweepStatus::Failed),
            _ => Err(ParseEnumError::new("sweep status", s)),
        }
    }
}

/// One registered crawl source. Doubles as that source's crawl history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: Uuid,
    pub canonical_url: String,
    pub source_type: SourceType,
    pub sport: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub last_swept_at: Option<DateTime<Utc>>,
    pub last_sweep_status: Option<SweepStatus>,
    pub last_sweep_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload; `canonical_url` must already be normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub canonical_url: String,
    pub source_type: SourceType,
    pub sport: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub notes: Option<String>,
    pub is_active: bool,
}

/// Extractor output for one scraped event occurrence. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CandidateEventRecord {
    pub name: String,
    pub date_text: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub venue: Option<String>,
    pub source_url: String,
    pub raw_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentStatus {
    Draft,
    Published,
    Stale,
    Archived,
}

impl TournamentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TournamentStatus::Draft => "draft",
            TournamentStatus::Published => "published",
            TournamentStatus::Stale => "stale",
            TournamentStatus::Archived => "archived",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TournamentStatus::Draft => 0,
            TournamentStatus::Published => 1,
            TournamentStatus::Stale => 2,
            TournamentStatus::Archived => 3,
        }
    }

    /// Status only moves forward along draft → published → stale → archived.
    pub fn can_transition_to(&self, next: TournamentStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for TournamentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TournamentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(TournamentStatus::Draft),
            "published" => Ok(TournamentStatus::Published),
            "stale" => Ok(TournamentStatus::Stale),
            "archived" => Ok(TournamentStatus::Archived),
            _ => Err(ParseEnumError::new("tournament status", s)),
        }
    }
}

/// The resolved, durable event record keyed by `slug`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub sport: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub summary: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: TournamentStatus,
    pub source_url: String,
    pub official_url: Option<String>,
    pub confidence: f64,
    pub is_canonical: bool,
    pub canonical_entity_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Which crawl source observed a tournament, keyed by `(source, source_event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentSourceLink {
    pub tournament_id: Uuid,
    pub source: String,
    pub source_event_id: String,
    pub source_url: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Snapshot appended whenever an upsert changes a mutable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentRevision {
    pub id: Uuid,
    pub tournament_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub snapshot: serde_json::Value,
}

/// Insert-or-update payload for one slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentUpsert {
    pub slug: String,
    pub name: String,
    pub sport: String,
    pub state: Option<String>,
    pub city: Option<String>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub summary: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub source_url: String,
    pub confidence: f64,
    pub default_status: TournamentStatus,
    pub source: String,
    pub source_event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub slug: String,
    pub inserted: bool,
    /// A mutable field differed from the stored row.
    pub changed: bool,
}

/// A scored guess at an entity's official web presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlCandidate {
    pub entity_id: Uuid,
    pub candidate_url: String,
    pub score: f64,
    pub matched_fields: Vec<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub http_status: Option<u16>,
    pub final_url: Option<String>,
    pub content_type: Option<String>,
    pub auto_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Tournament,
    Venue,
    Assignor,
}

impl ReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewKind::Tournament => "tournament",
            ReviewKind::Venue => "venue",
            ReviewKind::Assignor => "assignor",
        }
    }

    /// Assignor aggregates are kept per sport; the rest per entity.
    pub fn segmented_by_sport(&self) -> bool {
        matches!(self, ReviewKind::Assignor)
    }
}

impl std::fmt::Display for ReviewKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReviewKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tournament" => Ok(ReviewKind::Tournament),
            "venue" => Ok(ReviewKind::Venue),
            "assignor" => Ok(ReviewKind::Assignor),
            _ => Err(ParseEnumError::new("review kind", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            _ => Err(ParseEnumError::new("review status", s)),
        }
    }
}

/// Raw review row written by the review subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: Uuid,
    pub kind: ReviewKind,
    pub entity_id: Uuid,
    pub sport: Option<String>,
    pub status: ReviewStatus,
    pub overall_score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateKey {
    pub kind: ReviewKind,
    pub entity_id: Uuid,
    pub sport: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreAggregate {
    pub key: AggregateKey,
    pub percent_score: i32,
    pub review_count: i64,
    pub summary_text: String,
}

/// Domain that failed DNS resolution; revisited after a cool-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadDomain {
    pub domain: String,
    pub failure_count: i32,
    pub first_failed_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Lower-case, accents folded, `&` → `and`, non-alphanumeric runs → `-`,
/// trimmed, capped.
pub fn slugify(input: &str) -> String {
    let joined = input
        .to_lowercase()
        .replace('&', " and ")
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if joined.len() <= SLUG_MAX_LEN {
        return joined;
    }
    joined[..SLUG_MAX_LEN].trim_end_matches('-').to_string()
}

/// Natural key for a tournament. Optionally disambiguated by start year.
pub fn tournament_slug(
    name: &str,
    city: Option<&str>,
    state: Option<&str>,
    start_year: Option<i32>,
) -> String {
    let year = start_year.map(|y| y.to_string()).unwrap_or_default();
    let parts = [name, city.unwrap_or_default(), state.unwrap_or_default(), year.as_str()];
    slugify(&parts.join(" "))
}

pub fn start_year(record: &CandidateEventRecord) -> Option<i32> {
    record.start_date.map(|d| d.year())
}
