//! Resolves extracted records onto canonical tournaments by slug.

use std::sync::Arc;

use thiserror::Error;
use tourney_core::{
    start_year, tournament_slug, CandidateEventRecord, Tournament, TournamentStatus,
    TournamentUpsert, UpsertOutcome,
};
use tourney_storage::{StoreError, TournamentStore};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("tournament not found: {0}")]
    NotFound(Uuid),
    #[error("status cannot move from {from} to {to}")]
    InvalidTransition {
        from: TournamentStatus,
        to: TournamentStatus,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ResolveError::Conflict(msg),
            other => ResolveError::Store(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub default_status: TournamentStatus,
    pub year_in_slug: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_status: TournamentStatus::Draft,
            year_in_slug: false,
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Completeness of an extracted record, used as the stored confidence.
pub fn record_confidence(record: &CandidateEventRecord) -> f64 {
    let mut score = 0.4;
    if record.start_date.is_some() {
        score += 0.2;
    }
    if present(&record.venue).is_some() {
        score += 0.15;
    }
    if present(&record.city).is_some() {
        score += 0.15;
    }
    if present(&record.state).is_some() {
        score += 0.1;
    }
    (score * 100.0_f64).round() / 100.0
}

#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn TournamentStore>,
    config: ResolverConfig,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn TournamentStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    pub fn slug_for(&self, record: &CandidateEventRecord) -> String {
        let year = if self.config.year_in_slug {
            start_year(record)
        } else {
            None
        };
        tournament_slug(
            &record.name,
            present(&record.city),
            present(&record.state),
            year,
        )
    }

    fn validate(record: &CandidateEventRecord, sport: &str) -> Result<(), ResolveError> {
        if record.name.trim().is_empty() {
            return Err(ResolveError::InvalidRecord("missing name".into()));
        }
        if present(&record.state).is_none() && present(&record.city).is_none() {
            return Err(ResolveError::InvalidRecord(format!(
                "{:?} has neither state nor city",
                record.name
            )));
        }
        if record.source_url.trim().is_empty() {
            return Err(ResolveError::InvalidRecord(format!(
                "{:?} has no source url",
                record.name
            )));
        }
        if sport.trim().is_empty() {
            return Err(ResolveError::InvalidRecord("missing sport".into()));
        }
        Ok(())
    }

    /// Insert or refresh the tournament this record describes. Distinct slugs
    /// are never merged; a record without new information only bumps
    /// `last_seen_at`.
    pub async fn upsert_from_source(
        &self,
        record: &CandidateEventRecord,
        sport: &str,
        source: &str,
        source_event_id: &str,
    ) -> Result<UpsertOutcome, ResolveError> {
        Self::validate(record, sport)?;
        let slug = self.slug_for(record);
        if slug.is_empty() {
            return Err(ResolveError::InvalidRecord(format!(
                "{:?} produces an empty slug",
                record.name
            )));
        }

        let outcome = self
            .store
            .upsert_tournament(TournamentUpsert {
                slug,
                name: record.name.trim().to_string(),
                sport: sport.trim().to_lowercase(),
                state: present(&record.state).map(str::to_string),
                city: present(&record.city).map(str::to_string),
                venue: present(&record.venue).map(str::to_string),
                address: None,
                summary: None,
                start_date: record.start_date,
                end_date: record.end_date,
                source_url: record.source_url.clone(),
                confidence: record_confidence(record),
                default_status: self.config.default_status,
                source: source.to_string(),
                source_event_id: source_event_id.to_string(),
            })
            .await?;
        debug!(
            slug = %outcome.slug,
            inserted = outcome.inserted,
            changed = outcome.changed,
            "tournament resolved"
        );
        Ok(outcome)
    }

    /// Mark `child` as a later occurrence of the canonical `parent`.
    pub async fn link_series(&self, child: Uuid, parent: Uuid) -> Result<Tournament, ResolveError> {
        if child == parent {
            return Err(ResolveError::Conflict(
                "a tournament cannot be its own series parent".into(),
            ));
        }
        match self.store.link_series(child, parent).await {
            Ok(row) => Ok(row),
            Err(StoreError::NotFound { id, .. }) => {
                Err(ResolveError::NotFound(id.parse().unwrap_or(child)))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn transition_status(
        &self,
        id: Uuid,
        to: TournamentStatus,
    ) -> Result<Tournament, ResolveError> {
        let current = self
            .store
            .tournament(id)
            .await?
            .ok_or(ResolveError::NotFound(id))?;
        if !current.status.can_transition_to(to) {
            return Err(ResolveError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        if !self.store.set_status(id, current.status, to).await? {
            return Err(ResolveError::Conflict(format!(
                "status of {id} changed concurrently"
            )));
        }
        self.store
            .tournament(id)
            .await?
            .ok_or(ResolveError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tourney_storage::MemoryStore;

    fn winter_cup() -> CandidateEventRecord {
        CandidateEventRecord {
            name: "Winter Cup".into(),
            date_text: Some("12-14".into()),
            start_date: NaiveDate::from_ymd_opt(2025, 12, 12),
            end_date: NaiveDate::from_ymd_opt(2025, 12, 14),
            city: Some("Seattle".into()),
            state: Some("WA".into()),
            venue: Some("Starfire".into()),
            source_url: "https://wasoccer.org/events".into(),
            ..Default::default()
        }
    }

    fn resolver(store: Arc<MemoryStore>) -> EntityResolver {
        EntityResolver::new(store, ResolverConfig::default())
    }

    #[tokio::test]
    async fn resolving_the_same_record_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let first = resolver
            .upsert_from_source(&winter_cup(), "soccer", "wasoccer.org", "winter-cup")
            .await
            .unwrap();
        assert!(first.inserted);
        let before = store.tournament(first.id).await.unwrap().unwrap();

        let second = resolver
            .upsert_from_source(&winter_cup(), "soccer", "wasoccer.org", "winter-cup")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.inserted);
        assert!(!second.changed);

        let after = store.tournament(first.id).await.unwrap().unwrap();
        assert_eq!(store.tournament_count().await, 1);
        assert_eq!(after.updated_at, before.updated_at);
        assert!(after.last_seen_at >= before.last_seen_at);
        assert_eq!(store.revisions(first.id).await.unwrap().len(), 1);
        assert_eq!(after.status, TournamentStatus::Draft);
    }

    #[tokio::test]
    async fn sparse_resweep_keeps_dates_and_venue() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let first = resolver
            .upsert_from_source(&winter_cup(), "soccer", "wasoccer.org", "winter-cup")
            .await
            .unwrap();

        let sparse = CandidateEventRecord {
            date_text: Some("TBA".into()),
            start_date: None,
            end_date: None,
            venue: None,
            ..winter_cup()
        };
        resolver
            .upsert_from_source(&sparse, "soccer", "other.org", "wc")
            .await
            .unwrap();

        let row = store.tournament(first.id).await.unwrap().unwrap();
        assert_eq!(row.start_date, NaiveDate::from_ymd_opt(2025, 12, 12));
        assert_eq!(row.venue.as_deref(), Some("Starfire"));
        assert_eq!(row.confidence, record_confidence(&winter_cup()));
        assert_eq!(store.source_links(first.id).await.unwrap().len(), 2);

        for _ in 0..3 {
            let full = resolver
                .upsert_from_source(&winter_cup(), "soccer", "wasoccer.org", "winter-cup")
                .await
                .unwrap();
            let thin = resolver
                .upsert_from_source(&sparse, "soccer", "other.org", "wc")
                .await
                .unwrap();
            assert!(!full.changed && !thin.changed);
        }
        let row = store.tournament(first.id).await.unwrap().unwrap();
        assert_eq!(row.confidence, record_confidence(&winter_cup()));
        assert_eq!(store.revisions(first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_records_are_rejected_without_writing() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let nameless = CandidateEventRecord { name: " ".into(), ..winter_cup() };
        let nowhere = CandidateEventRecord { city: None, state: None, ..winter_cup() };
        let unsourced = CandidateEventRecord { source_url: String::new(), ..winter_cup() };
        for record in [nameless, nowhere, unsourced] {
            let err = resolver
                .upsert_from_source(&record, "soccer", "s", "e")
                .await
                .unwrap_err();
            assert!(matches!(err, ResolveError::InvalidRecord(_)), "{err}");
        }
        assert_eq!(store.tournament_count().await, 0);
    }

    #[tokio::test]
    async fn year_policy_keeps_editions_apart() {
        let store = Arc::new(MemoryStore::new());
        let resolver = EntityResolver::new(
            store.clone(),
            ResolverConfig {
                default_status: TournamentStatus::Published,
                year_in_slug: true,
            },
        );
        let next_year = CandidateEventRecord {
            start_date: NaiveDate::from_ymd_opt(2026, 12, 11),
            end_date: NaiveDate::from_ymd_opt(2026, 12, 13),
            ..winter_cup()
        };
        let a = resolver.upsert_from_source(&winter_cup(), "soccer", "s", "a").await.unwrap();
        let b = resolver.upsert_from_source(&next_year, "soccer", "s", "b").await.unwrap();
        assert_eq!(a.slug, "winter-cup-seattle-wa-2025");
        assert_eq!(b.slug, "winter-cup-seattle-wa-2026");
        let row = store.tournament(a.id).await.unwrap().unwrap();
        assert_eq!(row.status, TournamentStatus::Published);
    }

    #[tokio::test]
    async fn series_link_survives_resweep_and_rejects_bad_parents() {
        let store = Arc::new(MemoryStore::new());
        let resolver = EntityResolver::new(
            store.clone(),
            ResolverConfig { year_in_slug: true, ..Default::default() },
        );
        let parent = resolver.upsert_from_source(&winter_cup(), "soccer", "s", "a").await.unwrap();
        let later = CandidateEventRecord {
            start_date: NaiveDate::from_ymd_opt(2026, 12, 11),
            ..winter_cup()
        };
        let child = resolver.upsert_from_source(&later, "soccer", "s", "b").await.unwrap();

        assert!(matches!(
            resolver.link_series(parent.id, parent.id).await,
            Err(ResolveError::Conflict(_))
        ));
        let linked = resolver.link_series(child.id, parent.id).await.unwrap();
        assert!(!linked.is_canonical);
        assert_eq!(linked.canonical_entity_id, Some(parent.id));

        assert!(matches!(
            resolver.link_series(parent.id, child.id).await,
            Err(ResolveError::Conflict(_))
        ));

        resolver.upsert_from_source(&later, "soccer", "s", "b").await.unwrap();
        let row = store.tournament(child.id).await.unwrap().unwrap();
        assert_eq!(row.canonical_entity_id, Some(parent.id));
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let t = resolver.upsert_from_source(&winter_cup(), "soccer", "s", "a").await.unwrap();

        let published = resolver.transition_status(t.id, TournamentStatus::Published).await.unwrap();
        assert_eq!(published.status, TournamentStatus::Published);
        let err = resolver.transition_status(t.id, TournamentStatus::Draft).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidTransition { .. }));
        assert!(matches!(
            resolver.transition_status(Uuid::new_v4(), TournamentStatus::Stale).await,
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn confidence_grows_with_completeness() {
        let full = record_confidence(&winter_cup());
        let bare = record_confidence(&CandidateEventRecord {
            start_date: None,
            venue: None,
            city: None,
            ..winter_cup()
        });
        assert_eq!(full, 1.0);
        assert!(bare < full);
    }
}
