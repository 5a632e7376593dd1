//! Candidate facts proposed by enrichment and their content signatures.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FactKind {
    Contact,
    Venue,
    Date,
    CompRate,
    CompHotel,
    CompCash,
}

impl FactKind {
    pub const ALL: [FactKind; 6] = [
        FactKind::Contact,
        FactKind::Venue,
        FactKind::Date,
        FactKind::CompRate,
        FactKind::CompHotel,
        FactKind::CompCash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::Contact => "contact",
            FactKind::Venue => "venue",
            FactKind::Date => "date",
            FactKind::CompRate => "comp-rate",
            FactKind::CompHotel => "comp-hotel",
            FactKind::CompCash => "comp-cash",
        }
    }
}

impl std::fmt::Display for FactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FactKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FactKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("fact kind", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactFact {
    pub role: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VenueFact {
    pub venue_name: Option<String>,
    pub address_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateFact {
    pub date_text: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompFact {
    pub rate_text: Option<String>,
    pub travel_housing_text: Option<String>,
}

/// Fields of a proposed fact, one variant per [`FactKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FactPayload {
    Contact(ContactFact),
    Venue(VenueFact),
    Date(DateFact),
    CompRate(CompFact),
    CompHotel(CompFact),
    CompCash(CompFact),
}

/// Trim, lower-case and collapse internal whitespace.
pub fn normalize_text(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_email(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

pub fn normalize_phone(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

fn format_date(value: Option<NaiveDate>) -> String {
    value.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default()
}

impl FactPayload {
    pub fn kind(&self) -> FactKind {
        match self {
            FactPayload::Contact(_) => FactKind::Contact,
            FactPayload::Venue(_) => FactKind::Venue,
            FactPayload::Date(_) => FactKind::Date,
            FactPayload::CompRate(_) => FactKind::CompRate,
            FactPayload::CompHotel(_) => FactKind::CompHotel,
            FactPayload::CompCash(_) => FactKind::CompCash,
        }
    }

    /// Normalized field tuple the signature is computed from.
    pub fn signature_parts(&self) -> Vec<String> {
        match self {
            FactPayload::Contact(c) => vec![
                normalize_text(c.role.as_deref()),
                normalize_text(c.name.as_deref()),
                normalize_email(c.email.as_deref()),
                normalize_phone(c.phone.as_deref()),
            ],
            FactPayload::Venue(v) => vec![
                normalize_text(v.venue_name.as_deref()),
                normalize_text(v.address_text.as_deref()),
            ],
            FactPayload::Date(d) => vec![
                normalize_text(d.date_text.as_deref()),
                format_date(d.start_date),
                format_date(d.end_date),
            ],
            FactPayload::CompRate(c) | FactPayload::CompHotel(c) | FactPayload::CompCash(c) => vec![
                normalize_text(c.rate_text.as_deref()),
                normalize_text(c.travel_housing_text.as_deref()),
            ],
        }
    }

    /// SHA-256 hex over the normalized tuple, each part length-prefixed so
    /// field boundaries cannot shift.
    pub fn content_signature(&self) -> String {
        let mut hasher = Sha256::new();
        for part in self.signature_parts() {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// True when every normalized field is empty; such proposals carry no content.
    pub fn is_blank(&self) -> bool {
        self.signature_parts().iter().all(String::is_empty)
    }
}

/// A persisted proposal awaiting human accept/reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub kind: FactKind,
    pub payload: FactPayload,
    pub content_signature: String,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CandidateFact {
    pub fn is_pending(&self) -> bool {
        self.accepted_at.is_none() && self.rejected_at.is_none()
    }
}

/// Reviewer verdict applied to a duplicate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactDecision {
    Accept,
    Reject,
}
