//! Persistence capability for sources, tournaments and enrichment tables.
//!
//! Every method is a single atomic operation against the backing store so
//! concurrent runs on the same natural key converge instead of duplicating.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tourney_core::{
    CandidateFact, DeadDomain, FactDecision, FactKind, FactPayload, NewSource,
    Review, ReviewKind, ScoreAggregate, SourceRecord, SweepStatus, Tournament,
    TournamentRevision, TournamentSourceLink, TournamentStatus, TournamentUpsert, UpsertOutcome,
    UrlCandidate,
};
use uuid::Uuid;

/// Turns every review of one kind into the complete aggregate set for it.
pub type AggregateBuilder = fn(&[Review]) -> Vec<ScoreAggregate>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateRebuild {
    pub reviews: usize,
    pub upserted: usize,
    pub deleted: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            what,
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait TournamentStore: Send + Sync {
    /// Insert or update by `canonical_url`; never creates a second row.
    async fn upsert_source(&self, source: NewSource) -> Result<SourceRecord, StoreError>;
    async fn source_by_url(&self, canonical_url: &str) -> Result<Option<SourceRecord>, StoreError>;
    async fn list_sources(&self, active_only: bool) -> Result<Vec<SourceRecord>, StoreError>;
    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<SourceRecord, StoreError>;
    async fn record_sweep(
        &self,
        id: Uuid,
        status: SweepStatus,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Insert or update by slug. Absent incoming values keep stored ones.
    async fn upsert_tournament(&self, input: TournamentUpsert) -> Result<UpsertOutcome, StoreError>;
    async fn tournament(&self, id: Uuid) -> Result<Option<Tournament>, StoreError>;
    async fn tournament_by_slug(&self, slug: &str) -> Result<Option<Tournament>, StoreError>;
    async fn tournaments_missing_official_url(
        &self,
        limit: usize,
    ) -> Result<Vec<Tournament>, StoreError>;
    /// Returns false when an official URL was already present.
    async fn set_official_url_if_empty(&self, id: Uuid, url: &str) -> Result<bool, StoreError>;
    /// Compare-and-set on status; false when the stored status was not `from`.
    async fn set_status(
        &self,
        id: Uuid,
        from: TournamentStatus,
        to: TournamentStatus,
    ) -> Result<bool, StoreError>;
    async fn link_series(&self, child: Uuid, parent: Uuid) -> Result<Tournament, StoreError>;
    async fn source_links(&self, id: Uuid) -> Result<Vec<TournamentSourceLink>, StoreError>;
    async fn revisions(&self, id: Uuid) -> Result<Vec<TournamentRevision>, StoreError>;

    /// Upsert by `(entity_id, candidate_url)`; `auto_applied` is never cleared.
    async fn upsert_url_candidate(&self, candidate: &UrlCandidate) -> Result<(), StoreError>;
    async fn url_candidates(&self, entity_id: Uuid) -> Result<Vec<UrlCandidate>, StoreError>;

    /// Inserts unless a fact with the same `(entity, kind, signature)` exists.
    async fn insert_fact_if_new(
        &self,
        entity_id: Uuid,
        payload: &FactPayload,
    ) -> Result<Option<CandidateFact>, StoreError>;
    async fn fact(&self, id: Uuid) -> Result<Option<CandidateFact>, StoreError>;
    async fn facts_for_entity(
        &self,
        entity_id: Uuid,
        kind: Option<FactKind>,
    ) -> Result<Vec<CandidateFact>, StoreError>;
    async fn facts_with_signature(
        &self,
        entity_id: Uuid,
        kind: FactKind,
        signature: &str,
    ) -> Result<Vec<CandidateFact>, StoreError>;
    async fn delete_facts(&self, ids: &[Uuid]) -> Result<u64, StoreError>;
    async fn decide_facts(
        &self,
        ids: &[Uuid],
        decision: FactDecision,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn aggregates(&self, kind: ReviewKind) -> Result<Vec<ScoreAggregate>, StoreError>;
    /// Read the reviews of `kind`, upsert `build(reviews)` and delete every
    /// other aggregate of that kind, holding a per-kind lock that every
    /// process sharing the store observes.
    async fn rebuild_aggregates(
        &self,
        kind: ReviewKind,
        build: AggregateBuilder,
    ) -> Result<AggregateRebuild, StoreError>;

    async fn dead_domain(&self, domain: &str) -> Result<Option<DeadDomain>, StoreError>;
    async fn dead_domains(&self) -> Result<Vec<DeadDomain>, StoreError>;
    async fn record_dns_failure(
        &self,
        domain: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<DeadDomain, StoreError>;
    async fn clear_dead_domain(&self, domain: &str) -> Result<bool, StoreError>;
}
