//! Site extractor contracts and the built-in extractor families.
//!
//! Extractors are pure: HTML in, candidate records out. Malformed markup
//! degrades to fewer records; only a broken built-in selector is an error.

use std::collections::BTreeSet;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tourney_core::states::{state_code, US_STATES};
use tourney_core::{CandidateEventRecord, SourceRecord, SourceType};
use tracing::debug;

pub mod calendar;
pub mod dates;
pub mod directory;
pub mod table;

pub use calendar::VenueCalendarExtractor;
pub use dates::{parse_date_range, DateContext};
pub use directory::StateDirectoryExtractor;
pub use table::TableListingExtractor;

pub const CRATE_NAME: &str = "tourney-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid built-in selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        reason: e.to_string(),
    })
}

/// Whitespace-collapsed text content of an element.
pub(crate) fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn first_text(el: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    el.select(sel)
        .map(|e| element_text(&e))
        .find(|t| !t.is_empty())
}

pub(crate) fn first_heading(document: &Html, sel: &Selector) -> Option<String> {
    document
        .select(sel)
        .map(|e| element_text(&e))
        .find(|t| !t.is_empty())
}

/// Which states a source may yield records for, plus per-source defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractScope {
    /// Empty means every state is in scope.
    states: BTreeSet<String>,
    pub default_state: Option<String>,
    pub default_city: Option<String>,
}

impl ExtractScope {
    pub fn all() -> Self {
        Self::default()
    }

    /// Codes or full names; unknown entries are ignored.
    pub fn states<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            states: states
                .into_iter()
                .filter_map(|s| state_code(s.as_ref()))
                .map(str::to_string)
                .collect(),
            ..Self::default()
        }
    }

    /// Scope a registered source: its own state when set, defaults from its location.
    pub fn for_source(source: &SourceRecord) -> Self {
        let code = source.state.as_deref().and_then(state_code);
        let mut scope = match code {
            Some(code) => Self::states([code]),
            None => Self::all(),
        };
        scope.default_state = code.map(str::to_string);
        scope.default_city = source.city.clone();
        scope
    }

    pub fn with_default_state(mut self, state: Option<&str>) -> Self {
        self.default_state = state.and_then(state_code).map(str::to_string);
        self
    }

    pub fn with_default_city(mut self, city: Option<&str>) -> Self {
        self.default_city = city.map(str::to_string);
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.is_unrestricted() || self.states.contains(code)
    }

    /// Apply defaults and acceptance rules. `None` means the record is dropped.
    pub fn accept(&self, mut record: CandidateEventRecord) -> Option<CandidateEventRecord> {
        record.name = record.name.split_whitespace().collect::<Vec<_>>().join(" ");
        if record.name.is_empty() {
            return None;
        }

        let state = match record.state.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(state_code(raw)?.to_string()),
            None => self.default_state.clone(),
        };
        record.state = state;
        record.city = record
            .city
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .or_else(|| self.default_city.clone());
        record.venue = record.venue.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        match record.state.as_deref() {
            Some(code) if !self.contains(code) => None,
            Some(_) => Some(record),
            None if record.city.is_some() && self.is_unrestricted() => Some(record),
            None => None,
        }
    }
}

/// State mentioned in free text, preferring the longest full-name match.
pub fn state_in_text(text: &str) -> Option<&'static str> {
    let lower = format!(" {} ", text.to_lowercase().replace(|c: char| !c.is_alphanumeric(), " "));
    US_STATES
        .iter()
        .filter(|(_, name)| lower.contains(&format!(" {} ", name.to_lowercase())))
        .max_by_key(|(_, name)| name.len())
        .map(|(code, _)| *code)
        .or_else(|| {
            let trimmed = text.trim();
            (trimmed.len() == 2).then(|| state_code(trimmed)).flatten()
        })
}

/// Split "Seattle, WA" style location text into city and state.
pub fn split_location(text: &str) -> (Option<String>, Option<String>) {
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }
    if let Some((city, rest)) = text.rsplit_once(',') {
        let state_part = rest.split_whitespace().next().unwrap_or_default();
        if let Some(code) = state_code(state_part).or_else(|| state_code(rest)) {
            let city = city.trim();
            return ((!city.is_empty()).then(|| city.to_string()), Some(code.to_string()));
        }
        return (Some(text.to_string()), None);
    }
    match state_code(text) {
        Some(code) => (None, Some(code.to_string())),
        None => (Some(text.to_string()), None),
    }
}

pub trait SiteExtractor: Send + Sync {
    fn source_type(&self) -> SourceType;

    fn extract(
        &self,
        html: &str,
        source_url: &str,
    ) -> Result<Vec<CandidateEventRecord>, AdapterError>;

    /// Follow-up pages to fetch and extract as a separate pass.
    fn discover(&self, _html: &str, _index_url: &str) -> Result<Vec<String>, AdapterError> {
        Ok(Vec::new())
    }
}

pub fn extractor_for(source_type: SourceType, scope: ExtractScope) -> Box<dyn SiteExtractor> {
    match source_type {
        SourceType::TableListing => Box::new(TableListingExtractor::new(scope)),
        SourceType::VenueCalendar => Box::new(VenueCalendarExtractor::new(scope)),
        SourceType::StateDirectory => Box::new(StateDirectoryExtractor::new(scope)),
    }
}

pub(crate) fn accept_all(
    scope: &ExtractScope,
    records: Vec<CandidateEventRecord>,
    source_url: &str,
) -> Vec<CandidateEventRecord> {
    let seen = records.len();
    let accepted = records
        .into_iter()
        .filter_map(|r| scope.accept(r))
        .collect::<Vec<_>>();
    if accepted.len() < seen {
        debug!(source_url, seen, accepted = accepted.len(), "dropped incomplete or out-of-scope rows");
    }
    accepted
}
