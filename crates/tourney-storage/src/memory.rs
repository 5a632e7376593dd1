//! In-process store for tests and dry runs. One lock guards all tables so
//! every trait method is atomic, matching the Postgres backend's guarantees.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tourney_core::{
    AggregateKey, CandidateFact, DeadDomain, FactDecision, FactKind, FactPayload, NewSource,
    Review, ReviewKind, ScoreAggregate, SourceRecord, SweepStatus, Tournament,
    TournamentRevision, TournamentSourceLink, TournamentStatus, TournamentUpsert, UpsertOutcome,
    UrlCandidate,
};
use uuid::Uuid;

use crate::store::{AggregateBuilder, AggregateRebuild, StoreError, TournamentStore};

#[derive(Debug, Default)]
struct Tables {
    sources: HashMap<Uuid, SourceRecord>,
    tournaments: HashMap<Uuid, Tournament>,
    slugs: HashMap<String, Uuid>,
    links: HashMap<(String, String), TournamentSourceLink>,
    revisions: Vec<TournamentRevision>,
    candidates: Vec<UrlCandidate>,
    facts: Vec<CandidateFact>,
    reviews: Vec<Review>,
    aggregates: BTreeMap<AggregateKey, ScoreAggregate>,
    dead_domains: HashMap<String, DeadDomain>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reviews are written by an external subsystem; tests seed them here.
    pub async fn insert_review(&self, review: Review) {
        self.tables.lock().await.reviews.push(review);
    }

    pub async fn insert_aggregate(&self, aggregate: ScoreAggregate) {
        self.tables.lock().await.aggregates.insert(aggregate.key.clone(), aggregate);
    }

    /// Raw insert that skips the signature check, as racing proposers can.
    pub async fn insert_fact(&self, fact: CandidateFact) {
        self.tables.lock().await.facts.push(fact);
    }

    pub async fn tournament_count(&self) -> usize {
        self.tables.lock().await.tournaments.len()
    }

    pub async fn fact_count(&self) -> usize {
        self.tables.lock().await.facts.len()
    }
}

/// Apply an upsert to a stored row; returns whether any mutable field moved.
fn merge_into(row: &mut Tournament, input: &TournamentUpsert) -> bool {
    fn keep<T: Clone + PartialEq>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
        match incoming {
            Some(value) if slot.as_ref() != Some(value) => {
                *slot = Some(value.clone());
                true
            }
            _ => false,
        }
    }

    let mut changed = false;
    changed |= keep(&mut row.venue, &input.venue);
    changed |= keep(&mut row.address, &input.address);
    changed |= keep(&mut row.summary, &input.summary);
    changed |= keep(&mut row.start_date, &input.start_date);
    changed |= keep(&mut row.end_date, &input.end_date);
    if row.source_url != input.source_url {
        row.source_url = input.source_url.clone();
        changed = true;
    }
    // Confidence only rises; a sparse re-crawl never lowers it.
    if input.confidence > row.confidence {
        row.confidence = input.confidence;
        changed = true;
    }
    changed
}

fn snapshot(row: &Tournament, at: DateTime<Utc>) -> Result<TournamentRevision, StoreError> {
    Ok(TournamentRevision {
        id: Uuid::new_v4(),
        tournament_id: row.id,
        recorded_at: at,
        snapshot: serde_json::to_value(row).map_err(|e| StoreError::Decode(e.to_string()))?,
    })
}

#[async_trait]
impl TournamentStore for MemoryStore {
    async fn upsert_source(&self, source: NewSource) -> Result<SourceRecord, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .sources
            .values_mut()
            .find(|s| s.canonical_url == source.canonical_url)
        {
            existing.source_type = source.source_type;
            existing.sport = source.sport;
            existing.state = source.state;
            existing.city = source.city;
            existing.notes = source.notes;
            existing.is_active = source.is_active;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let record = SourceRecord {
            id: Uuid::new_v4(),
            canonical_url: source.canonical_url,
            source_type: source.source_type,
            sport: source.sport,
            state: source.state,
            city: source.city,
            notes: source.notes,
            is_active: source.is_active,
            last_swept_at: None,
            last_sweep_status: None,
            last_sweep_summary: None,
            created_at: now,
            updated_at: now,
        };
        tables.sources.insert(record.id, record.clone());
        Ok(record)
    }

    async fn source_by_url(&self, canonical_url: &str) -> Result<Option<SourceRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sources
            .values()
            .find(|s| s.canonical_url == canonical_url)
            .cloned())
    }

    async fn list_sources(&self, active_only: bool) -> Result<Vec<SourceRecord>, StoreError> {
        let tables = self.tables.lock().await;
        let mut sources = tables
            .sources
            .values()
            .filter(|s| !active_only || s.is_active)
            .cloned()
            .collect::<Vec<_>>();
        sources.sort_by(|a, b| a.canonical_url.cmp(&b.canonical_url));
        Ok(sources)
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<SourceRecord, StoreError> {
        let mut tables = self.tables.lock().await;
        let source = tables
            .sources
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("source", id))?;
        source.is_active = active;
        source.updated_at = Utc::now();
        Ok(source.clone())
    }

    async fn record_sweep(
        &self,
        id: Uuid,
        status: SweepStatus,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let source = tables
            .sources
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("source", id))?;
        source.last_swept_at = Some(at);
        source.last_sweep_status = Some(status);
        source.last_sweep_summary = Some(summary.to_string());
        source.updated_at = at;
        Ok(())
    }

    async fn upsert_tournament(&self, input: TournamentUpsert) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;

        let (id, inserted, changed) = match tables.slugs.get(&input.slug).copied() {
            Some(id) => {
                let row = tables
                    .tournaments
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::Decode(format!("slug index points at missing {id}")))?;
                let changed = merge_into(row, &input);
                row.last_seen_at = now;
                if changed {
                    row.updated_at = now;
                }
                (id, false, changed)
            }
            None => {
                let row = Tournament {
                    id: Uuid::new_v4(),
                    name: input.name.clone(),
                    slug: input.slug.clone(),
                    sport: input.sport.clone(),
                    state: input.state.clone(),
                    city: input.city.clone(),
                    venue: input.venue.clone(),
                    address: input.address.clone(),
                    summary: input.summary.clone(),
                    start_date: input.start_date,
                    end_date: input.end_date,
                    status: input.default_status,
                    source_url: input.source_url.clone(),
                    official_url: None,
                    confidence: input.confidence,
                    is_canonical: true,
                    canonical_entity_id: None,
                    created_at: now,
                    updated_at: now,
                    last_seen_at: now,
                };
                let id = row.id;
                tables.slugs.insert(row.slug.clone(), id);
                tables.tournaments.insert(id, row);
                (id, true, true)
            }
        };

        if changed {
            let revision = match tables.tournaments.get(&id) {
                Some(row) => snapshot(row, now)?,
                None => return Err(StoreError::not_found("tournament", id)),
            };
            tables.revisions.push(revision);
        }

        let link_key = (input.source.clone(), input.source_event_id.clone());
        tables
            .links
            .entry(link_key)
            .and_modify(|link| {
                link.tournament_id = id;
                link.source_url = input.source_url.clone();
                link.last_seen_at = now;
            })
            .or_insert_with(|| TournamentSourceLink {
                tournament_id: id,
                source: input.source.clone(),
                source_event_id: input.source_event_id.clone(),
                source_url: input.source_url.clone(),
                first_seen_at: now,
                last_seen_at: now,
            });

        Ok(UpsertOutcome {
            id,
            slug: input.slug,
            inserted,
            changed,
        })
    }

    async fn tournament(&self, id: Uuid) -> Result<Option<Tournament>, StoreError> {
        Ok(self.tables.lock().await.tournaments.get(&id).cloned())
    }

    async fn tournament_by_slug(&self, slug: &str) -> Result<Option<Tournament>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .slugs
            .get(slug)
            .and_then(|id| tables.tournaments.get(id))
            .cloned())
    }

    async fn tournaments_missing_official_url(
        &self,
        limit: usize,
    ) -> Result<Vec<Tournament>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .tournaments
            .values()
            .filter(|t| t.official_url.as_deref().map_or(true, str::is_empty))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.slug.cmp(&b.slug)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn set_official_url_if_empty(&self, id: Uuid, url: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .tournaments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("tournament", id))?;
        if row.official_url.as_deref().is_some_and(|u| !u.is_empty()) {
            return Ok(false);
        }
        row.official_url = Some(url.to_string());
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: TournamentStatus,
        to: TournamentStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .tournaments
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("tournament", id))?;
        if row.status != from {
            return Ok(false);
        }
        row.status = to;
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn link_series(&self, child: Uuid, parent: Uuid) -> Result<Tournament, StoreError> {
        if child == parent {
            return Err(StoreError::Conflict("a tournament cannot be its own series parent".into()));
        }
        let mut tables = self.tables.lock().await;
        let parent_row = tables
            .tournaments
            .get(&parent)
            .ok_or_else(|| StoreError::not_found("tournament", parent))?;
        if !parent_row.is_canonical {
            return Err(StoreError::Conflict(format!("{parent} is not a canonical tournament")));
        }
        if tables
            .tournaments
            .values()
            .any(|t| t.canonical_entity_id == Some(child))
        {
            return Err(StoreError::Conflict(format!("{child} is already a series parent")));
        }
        let row = tables
            .tournaments
            .get_mut(&child)
            .ok_or_else(|| StoreError::not_found("tournament", child))?;
        row.is_canonical = false;
        row.canonical_entity_id = Some(parent);
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn source_links(&self, id: Uuid) -> Result<Vec<TournamentSourceLink>, StoreError> {
        let tables = self.tables.lock().await;
        let mut links = tables
            .links
            .values()
            .filter(|l| l.tournament_id == id)
            .cloned()
            .collect::<Vec<_>>();
        links.sort_by(|a, b| a.source.cmp(&b.source).then(a.source_event_id.cmp(&b.source_event_id)));
        Ok(links)
    }

    async fn revisions(&self, id: Uuid) -> Result<Vec<TournamentRevision>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .revisions
            .iter()
            .filter(|r| r.tournament_id == id)
            .cloned()
            .collect())
    }

    async fn upsert_url_candidate(&self, candidate: &UrlCandidate) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.candidates.iter_mut().find(|c| {
            c.entity_id == candidate.entity_id && c.candidate_url == candidate.candidate_url
        }) {
            Some(existing) => {
                let applied = existing.auto_applied || candidate.auto_applied;
                *existing = candidate.clone();
                existing.auto_applied = applied;
            }
            None => tables.candidates.push(candidate.clone()),
        }
        Ok(())
    }

    async fn url_candidates(&self, entity_id: Uuid) -> Result<Vec<UrlCandidate>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .candidates
            .iter()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(rows)
    }

    async fn insert_fact_if_new(
        &self,
        entity_id: Uuid,
        payload: &FactPayload,
    ) -> Result<Option<CandidateFact>, StoreError> {
        let kind = payload.kind();
        let signature = payload.content_signature();
        let mut tables = self.tables.lock().await;
        if tables.facts.iter().any(|f| {
            f.entity_id == entity_id && f.kind == kind && f.content_signature == signature
        }) {
            return Ok(None);
        }
        let fact = CandidateFact {
            id: Uuid::new_v4(),
            entity_id,
            kind,
            payload: payload.clone(),
            content_signature: signature,
            accepted_at: None,
            rejected_at: None,
            created_at: Utc::now(),
        };
        tables.facts.push(fact.clone());
        Ok(Some(fact))
    }

    async fn fact(&self, id: Uuid) -> Result<Option<CandidateFact>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.facts.iter().find(|f| f.id == id).cloned())
    }

    async fn facts_for_entity(
        &self,
        entity_id: Uuid,
        kind: Option<FactKind>,
    ) -> Result<Vec<CandidateFact>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .facts
            .iter()
            .filter(|f| f.entity_id == entity_id && kind.map_or(true, |k| f.kind == k))
            .cloned()
            .collect())
    }

    async fn facts_with_signature(
        &self,
        entity_id: Uuid,
        kind: FactKind,
        signature: &str,
    ) -> Result<Vec<CandidateFact>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .facts
            .iter()
            .filter(|f| f.entity_id == entity_id && f.kind == kind && f.content_signature == signature)
            .cloned()
            .collect())
    }

    async fn delete_facts(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.facts.len();
        tables.facts.retain(|f| !ids.contains(&f.id));
        Ok((before - tables.facts.len()) as u64)
    }

    async fn decide_facts(
        &self,
        ids: &[Uuid],
        decision: FactDecision,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut touched = 0;
        for fact in tables.facts.iter_mut().filter(|f| ids.contains(&f.id)) {
            match decision {
                FactDecision::Accept => {
                    fact.accepted_at = Some(at);
                    fact.rejected_at = None;
                }
                FactDecision::Reject => {
                    fact.rejected_at = Some(at);
                    fact.accepted_at = None;
                }
            }
            touched += 1;
        }
        Ok(touched)
    }

    async fn aggregates(&self, kind: ReviewKind) -> Result<Vec<ScoreAggregate>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .aggregates
            .values()
            .filter(|a| a.key.kind == kind)
            .cloned()
            .collect())
    }

    async fn rebuild_aggregates(
        &self,
        kind: ReviewKind,
        build: AggregateBuilder,
    ) -> Result<AggregateRebuild, StoreError> {
        let mut tables = self.tables.lock().await;
        let reviews = tables
            .reviews
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect::<Vec<_>>();
        let fresh = build(&reviews);

        let before = tables.aggregates.len();
        tables
            .aggregates
            .retain(|key, _| key.kind != kind || fresh.iter().any(|a| &a.key == key));
        let deleted = before - tables.aggregates.len();
        for aggregate in &fresh {
            tables.aggregates.insert(aggregate.key.clone(), aggregate.clone());
        }
        Ok(AggregateRebuild {
            reviews: reviews.len(),
            upserted: fresh.len(),
            deleted,
        })
    }

    async fn dead_domain(&self, domain: &str) -> Result<Option<DeadDomain>, StoreError> {
        Ok(self.tables.lock().await.dead_domains.get(domain).cloned())
    }

    async fn dead_domains(&self) -> Result<Vec<DeadDomain>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows = tables.dead_domains.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(rows)
    }

    async fn record_dns_failure(
        &self,
        domain: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<DeadDomain, StoreError> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .dead_domains
            .entry(domain.to_string())
            .and_modify(|d| {
                d.failure_count += 1;
                d.last_checked_at = at;
                d.last_error = Some(error.to_string());
            })
            .or_insert_with(|| DeadDomain {
                domain: domain.to_string(),
                failure_count: 1,
                first_failed_at: at,
                last_checked_at: at,
                last_error: Some(error.to_string()),
            });
        Ok(entry.clone())
    }

    async fn clear_dead_domain(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.dead_domains.remove(domain).is_some())
    }
}
