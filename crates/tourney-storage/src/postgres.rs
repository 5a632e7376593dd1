//! Postgres backend. Natural-key writes use `INSERT ... ON CONFLICT` so
//! overlapping runs converge on one row per key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tourney_core::{
    AggregateKey, CandidateFact, DeadDomain, FactDecision, FactKind, FactPayload, NewSource,
    Review, ReviewKind, ScoreAggregate, SourceRecord, SweepStatus, Tournament,
    TournamentRevision, TournamentSourceLink, TournamentStatus, TournamentUpsert, UpsertOutcome,
    UrlCandidate,
};
use tracing::debug;
use uuid::Uuid;

use crate::store::{AggregateBuilder, AggregateRebuild, StoreError, TournamentStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| StoreError::Decode(e.to_string()))
}

fn source_from_row(row: &PgRow) -> Result<SourceRecord, StoreError> {
    let source_type: String = row.try_get("source_type")?;
    let status: Option<String> = row.try_get("last_sweep_status")?;
    Ok(SourceRecord {
        id: row.try_get("id")?,
        canonical_url: row.try_get("canonical_url")?,
        source_type: parse(&source_type)?,
        sport: row.try_get("sport")?,
        state: row.try_get("state")?,
        city: row.try_get("city")?,
        notes: row.try_get("notes")?,
        is_active: row.try_get("is_active")?,
        last_swept_at: row.try_get("last_swept_at")?,
        last_sweep_status: status.as_deref().map(parse::<SweepStatus>).transpose()?,
        last_sweep_summary: row.try_get("last_sweep_summary")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tournament_from_row(row: &PgRow) -> Result<Tournament, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Tournament {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        sport: row.try_get("sport")?,
        state: row.try_get("state")?,
        city: row.try_get("city")?,
        venue: row.try_get("venue")?,
        address: row.try_get("address")?,
        summary: row.try_get("summary")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        status: parse(&status)?,
        source_url: row.try_get("source_url")?,
        official_url: row.try_get("official_url")?,
        confidence: row.try_get("confidence")?,
        is_canonical: row.try_get("is_canonical")?,
        canonical_entity_id: row.try_get("canonical_entity_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<UrlCandidate, StoreError> {
    let matched: serde_json::Value = row.try_get("matched_fields")?;
    let http_status: Option<i32> = row.try_get("http_status")?;
    Ok(UrlCandidate {
        entity_id: row.try_get("entity_id")?,
        candidate_url: row.try_get("candidate_url")?,
        score: row.try_get("score")?,
        matched_fields: serde_json::from_value(matched)
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        title: row.try_get("title")?,
        snippet: row.try_get("snippet")?,
        http_status: http_status.and_then(|s| u16::try_from(s).ok()),
        final_url: row.try_get("final_url")?,
        content_type: row.try_get("content_type")?,
        auto_applied: row.try_get("auto_applied")?,
    })
}

fn fact_from_row(row: &PgRow) -> Result<CandidateFact, StoreError> {
    let kind: String = row.try_get("kind")?;
    let payload: serde_json::Value = row.try_get("payload")?;
    Ok(CandidateFact {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        kind: parse(&kind)?,
        payload: serde_json::from_value(payload).map_err(|e| StoreError::Decode(e.to_string()))?,
        content_signature: row.try_get("content_signature")?,
        accepted_at: row.try_get("accepted_at")?,
        rejected_at: row.try_get("rejected_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn aggregate_from_row(row: &PgRow) -> Result<ScoreAggregate, StoreError> {
    let kind: String = row.try_get("kind")?;
    let sport: String = row.try_get("sport")?;
    Ok(ScoreAggregate {
        key: AggregateKey {
            kind: parse(&kind)?,
            entity_id: row.try_get("entity_id")?,
            sport: (!sport.is_empty()).then_some(sport),
        },
        percent_score: row.try_get("percent_score")?,
        review_count: row.try_get("review_count")?,
        summary_text: row.try_get("summary_text")?,
    })
}

fn dead_domain_from_row(row: &PgRow) -> Result<DeadDomain, StoreError> {
    Ok(DeadDomain {
        domain: row.try_get("domain")?,
        failure_count: row.try_get("failure_count")?,
        first_failed_at: row.try_get("first_failed_at")?,
        last_checked_at: row.try_get("last_checked_at")?,
        last_error: row.try_get("last_error")?,
    })
}

/// Aggregates store "no sport" as the empty string so the key stays non-null.
fn sport_key(key: &AggregateKey) -> &str {
    key.sport.as_deref().unwrap_or("")
}

fn review_from_row(row: &PgRow) -> Result<Review, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Review {
        id: row.try_get("id")?,
        kind: parse(&kind)?,
        entity_id: row.try_get("entity_id")?,
        sport: row.try_get("sport")?,
        status: parse(&status)?,
        overall_score: row.try_get("overall_score")?,
    })
}

/// Advisory lock name for rebuilds of one review kind.
fn score_lock_key(kind: ReviewKind) -> String {
    format!("scores:{}", kind.as_str())
}

#[async_trait]
impl TournamentStore for PgStore {
    async fn upsert_source(&self, source: NewSource) -> Result<SourceRecord, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (id, canonical_url, source_type, sport, state, city, notes, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (canonical_url) DO UPDATE
               SET source_type = EXCLUDED.source_type,
                   sport = EXCLUDED.sport,
                   state = EXCLUDED.state,
                   city = EXCLUDED.city,
                   notes = EXCLUDED.notes,
                   is_active = EXCLUDED.is_active,
                   updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&source.canonical_url)
        .bind(source.source_type.as_str())
        .bind(&source.sport)
        .bind(&source.state)
        .bind(&source.city)
        .bind(&source.notes)
        .bind(source.is_active)
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    async fn source_by_url(&self, canonical_url: &str) -> Result<Option<SourceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM sources WHERE canonical_url = $1")
            .bind(canonical_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self, active_only: bool) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sources WHERE ($1 = FALSE OR is_active) ORDER BY canonical_url",
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<SourceRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE sources SET is_active = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("source", id))?;
        source_from_row(&row)
    }

    async fn record_sweep(
        &self,
        id: Uuid,
        status: SweepStatus,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sources
               SET last_swept_at = $2,
                   last_sweep_status = $3,
                   last_sweep_summary = $4,
                   updated_at = $2
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(status.as_str())
        .bind(summary)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("source", id));
        }
        Ok(())
    }

    async fn upsert_tournament(&self, input: TournamentUpsert) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO tournaments (
                id, name, slug, sport, state, city, venue, address, summary,
                start_date, end_date, status, source_url, confidence
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (slug) DO UPDATE
               SET venue = COALESCE(EXCLUDED.venue, tournaments.venue),
                   address = COALESCE(EXCLUDED.address, tournaments.address),
                   summary = COALESCE(EXCLUDED.summary, tournaments.summary),
                   start_date = COALESCE(EXCLUDED.start_date, tournaments.start_date),
                   end_date = COALESCE(EXCLUDED.end_date, tournaments.end_date),
                   source_url = EXCLUDED.source_url,
                   confidence = GREATEST(EXCLUDED.confidence, tournaments.confidence),
                   last_seen_at = NOW(),
                   updated_at = CASE
                       WHEN (
                           COALESCE(EXCLUDED.venue, tournaments.venue),
                           COALESCE(EXCLUDED.address, tournaments.address),
                           COALESCE(EXCLUDED.summary, tournaments.summary),
                           COALESCE(EXCLUDED.start_date, tournaments.start_date),
                           COALESCE(EXCLUDED.end_date, tournaments.end_date),
                           EXCLUDED.source_url,
                           GREATEST(EXCLUDED.confidence, tournaments.confidence)
                       ) IS DISTINCT FROM (
                           tournaments.venue,
                           tournaments.address,
                           tournaments.summary,
                           tournaments.start_date,
                           tournaments.end_date,
                           tournaments.source_url,
                           tournaments.confidence
                       )
                       THEN NOW()
                       ELSE tournaments.updated_at
                   END
            RETURNING id, slug, (xmax = 0) AS inserted, (updated_at = last_seen_at) AS changed
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.slug)
        .bind(&input.sport)
        .bind(&input.state)
        .bind(&input.city)
        .bind(&input.venue)
        .bind(&input.address)
        .bind(&input.summary)
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(input.default_status.as_str())
        .bind(&input.source_url)
        .bind(input.confidence)
        .fetch_one(&mut *tx)
        .await?;

        let outcome = UpsertOutcome {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            inserted: row.try_get("inserted")?,
            changed: row.try_get("changed")?,
        };

        if outcome.changed {
            sqlx::query(
                r#"
                INSERT INTO tournament_revisions (id, tournament_id, recorded_at, snapshot)
                SELECT $1, t.id, NOW(), to_jsonb(t) FROM tournaments t WHERE t.id = $2
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(outcome.id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO tournament_source_links (source, source_event_id, tournament_id, source_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source, source_event_id) DO UPDATE
               SET tournament_id = EXCLUDED.tournament_id,
                   source_url = EXCLUDED.source_url,
                   last_seen_at = NOW()
            "#,
        )
        .bind(&input.source)
        .bind(&input.source_event_id)
        .bind(outcome.id)
        .bind(&input.source_url)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(slug = %outcome.slug, inserted = outcome.inserted, changed = outcome.changed, "tournament upserted");
        Ok(outcome)
    }

    async fn tournament(&self, id: Uuid) -> Result<Option<Tournament>, StoreError> {
        let row = sqlx::query("SELECT * FROM tournaments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tournament_from_row).transpose()
    }

    async fn tournament_by_slug(&self, slug: &str) -> Result<Option<Tournament>, StoreError> {
        let row = sqlx::query("SELECT * FROM tournaments WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tournament_from_row).transpose()
    }

    async fn tournaments_missing_official_url(
        &self,
        limit: usize,
    ) -> Result<Vec<Tournament>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tournaments
             WHERE official_url IS NULL OR official_url = ''
             ORDER BY created_at, slug
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tournament_from_row).collect()
    }

    async fn set_official_url_if_empty(&self, id: Uuid, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tournaments
               SET official_url = $2, updated_at = NOW()
             WHERE id = $1
               AND (official_url IS NULL OR official_url = '')
            "#,
        )
        .bind(id)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: TournamentStatus,
        to: TournamentStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tournaments SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn link_series(&self, child: Uuid, parent: Uuid) -> Result<Tournament, StoreError> {
        if child == parent {
            return Err(StoreError::Conflict("a tournament cannot be its own series parent".into()));
        }
        let mut tx = self.pool.begin().await?;

        let parent_canonical: Option<bool> =
            sqlx::query_scalar("SELECT is_canonical FROM tournaments WHERE id = $1 FOR UPDATE")
                .bind(parent)
                .fetch_optional(&mut *tx)
                .await?;
        match parent_canonical {
            None => return Err(StoreError::not_found("tournament", parent)),
            Some(false) => {
                return Err(StoreError::Conflict(format!("{parent} is not a canonical tournament")))
            }
            Some(true) => {}
        }

        let dependents: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tournaments WHERE canonical_entity_id = $1")
                .bind(child)
                .fetch_one(&mut *tx)
                .await?;
        if dependents > 0 {
            return Err(StoreError::Conflict(format!("{child} is already a series parent")));
        }

        let row = sqlx::query(
            r#"
            UPDATE tournaments
               SET is_canonical = FALSE, canonical_entity_id = $2, updated_at = NOW()
             WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(child)
        .bind(parent)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("tournament", child))?;
        let linked = tournament_from_row(&row)?;
        tx.commit().await?;
        Ok(linked)
    }

    async fn source_links(&self, id: Uuid) -> Result<Vec<TournamentSourceLink>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tournament_source_links
             WHERE tournament_id = $1
             ORDER BY source, source_event_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<TournamentSourceLink, StoreError> {
                Ok(TournamentSourceLink {
                    tournament_id: row.try_get("tournament_id")?,
                    source: row.try_get("source")?,
                    source_event_id: row.try_get("source_event_id")?,
                    source_url: row.try_get("source_url")?,
                    first_seen_at: row.try_get("first_seen_at")?,
                    last_seen_at: row.try_get("last_seen_at")?,
                })
            })
            .collect()
    }

    async fn revisions(&self, id: Uuid) -> Result<Vec<TournamentRevision>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM tournament_revisions WHERE tournament_id = $1 ORDER BY recorded_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<TournamentRevision, StoreError> {
                Ok(TournamentRevision {
                    id: row.try_get("id")?,
                    tournament_id: row.try_get("tournament_id")?,
                    recorded_at: row.try_get("recorded_at")?,
                    snapshot: row.try_get("snapshot")?,
                })
            })
            .collect()
    }

    async fn upsert_url_candidate(&self, candidate: &UrlCandidate) -> Result<(), StoreError> {
        let matched = serde_json::to_value(&candidate.matched_fields)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO url_candidates (
                entity_id, candidate_url, score, matched_fields, title, snippet,
                http_status, final_url, content_type, auto_applied
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (entity_id, candidate_url) DO UPDATE
               SET score = EXCLUDED.score,
                   matched_fields = EXCLUDED.matched_fields,
                   title = EXCLUDED.title,
                   snippet = EXCLUDED.snippet,
                   http_status = EXCLUDED.http_status,
                   final_url = EXCLUDED.final_url,
                   content_type = EXCLUDED.content_type,
                   auto_applied = url_candidates.auto_applied OR EXCLUDED.auto_applied,
                   updated_at = NOW()
            "#,
        )
        .bind(candidate.entity_id)
        .bind(&candidate.candidate_url)
        .bind(candidate.score)
        .bind(matched)
        .bind(&candidate.title)
        .bind(&candidate.snippet)
        .bind(candidate.http_status.map(i32::from))
        .bind(&candidate.final_url)
        .bind(&candidate.content_type)
        .bind(candidate.auto_applied)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn url_candidates(&self, entity_id: Uuid) -> Result<Vec<UrlCandidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM url_candidates WHERE entity_id = $1 ORDER BY score DESC, candidate_url",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn insert_fact_if_new(
        &self,
        entity_id: Uuid,
        payload: &FactPayload,
    ) -> Result<Option<CandidateFact>, StoreError> {
        let kind = payload.kind();
        let body = serde_json::to_value(payload).map_err(|e| StoreError::Decode(e.to_string()))?;
        let row = sqlx::query(
            r#"
            INSERT INTO candidate_facts (id, entity_id, kind, payload, content_signature)
            SELECT $1, $2, $3, $4, $5
             WHERE NOT EXISTS (
                 SELECT 1 FROM candidate_facts
                  WHERE entity_id = $2 AND kind = $3 AND content_signature = $5
             )
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity_id)
        .bind(kind.as_str())
        .bind(body)
        .bind(payload.content_signature())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(fact_from_row).transpose()
    }

    async fn fact(&self, id: Uuid) -> Result<Option<CandidateFact>, StoreError> {
        let row = sqlx::query("SELECT * FROM candidate_facts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fact_from_row).transpose()
    }

    async fn facts_for_entity(
        &self,
        entity_id: Uuid,
        kind: Option<FactKind>,
    ) -> Result<Vec<CandidateFact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM candidate_facts
             WHERE entity_id = $1 AND ($2::text IS NULL OR kind = $2)
             ORDER BY created_at
            "#,
        )
        .bind(entity_id)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn facts_with_signature(
        &self,
        entity_id: Uuid,
        kind: FactKind,
        signature: &str,
    ) -> Result<Vec<CandidateFact>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM candidate_facts
             WHERE entity_id = $1 AND kind = $2 AND content_signature = $3
            "#,
        )
        .bind(entity_id)
        .bind(kind.as_str())
        .bind(signature)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn delete_facts(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM candidate_facts WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn decide_facts(
        &self,
        ids: &[Uuid],
        decision: FactDecision,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let sql = match decision {
            FactDecision::Accept => {
                "UPDATE candidate_facts SET accepted_at = $2, rejected_at = NULL WHERE id = ANY($1)"
            }
            FactDecision::Reject => {
                "UPDATE candidate_facts SET rejected_at = $2, accepted_at = NULL WHERE id = ANY($1)"
            }
        };
        let result = sqlx::query(sql).bind(ids).bind(at).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn aggregates(&self, kind: ReviewKind) -> Result<Vec<ScoreAggregate>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM score_aggregates WHERE kind = $1 ORDER BY entity_id, sport",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(aggregate_from_row).collect()
    }

    async fn rebuild_aggregates(
        &self,
        kind: ReviewKind,
        build: AggregateBuilder,
    ) -> Result<AggregateRebuild, StoreError> {
        let mut tx = self.pool.begin().await?;
        // Released at commit or rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(score_lock_key(kind))
            .execute(&mut *tx)
            .await?;

        let reviews = sqlx::query(
            "SELECT id, kind, entity_id, sport, status, overall_score FROM reviews WHERE kind = $1",
        )
        .bind(kind.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(review_from_row)
        .collect::<Result<Vec<_>, _>>()?;
        let fresh = build(&reviews);

        for aggregate in &fresh {
            sqlx::query(
                r#"
                INSERT INTO score_aggregates (
                    kind, entity_id, sport, percent_score, review_count, summary_text, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                ON CONFLICT (kind, entity_id, sport) DO UPDATE
                   SET percent_score = EXCLUDED.percent_score,
                       review_count = EXCLUDED.review_count,
                       summary_text = EXCLUDED.summary_text,
                       updated_at = NOW()
                "#,
            )
            .bind(aggregate.key.kind.as_str())
            .bind(aggregate.key.entity_id)
            .bind(sport_key(&aggregate.key))
            .bind(aggregate.percent_score)
            .bind(aggregate.review_count)
            .bind(&aggregate.summary_text)
            .execute(&mut *tx)
            .await?;
        }

        let existing = sqlx::query("SELECT * FROM score_aggregates WHERE kind = $1")
            .bind(kind.as_str())
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(aggregate_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let mut deleted = 0;
        for stale in existing
            .iter()
            .filter(|old| !fresh.iter().any(|new| new.key == old.key))
        {
            sqlx::query(
                "DELETE FROM score_aggregates WHERE kind = $1 AND entity_id = $2 AND sport = $3",
            )
            .bind(stale.key.kind.as_str())
            .bind(stale.key.entity_id)
            .bind(sport_key(&stale.key))
            .execute(&mut *tx)
            .await?;
            deleted += 1;
        }

        tx.commit().await?;
        Ok(AggregateRebuild {
            reviews: reviews.len(),
            upserted: fresh.len(),
            deleted,
        })
    }

    async fn dead_domain(&self, domain: &str) -> Result<Option<DeadDomain>, StoreError> {
        let row = sqlx::query("SELECT * FROM dead_domains WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dead_domain_from_row).transpose()
    }

    async fn dead_domains(&self) -> Result<Vec<DeadDomain>, StoreError> {
        let rows = sqlx::query("SELECT * FROM dead_domains ORDER BY domain")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dead_domain_from_row).collect()
    }

    async fn record_dns_failure(
        &self,
        domain: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<DeadDomain, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO dead_domains (domain, failure_count, first_failed_at, last_checked_at, last_error)
            VALUES ($1, 1, $2, $2, $3)
            ON CONFLICT (domain) DO UPDATE
               SET failure_count = dead_domains.failure_count + 1,
                   last_checked_at = EXCLUDED.last_checked_at,
                   last_error = EXCLUDED.last_error
            RETURNING *
            "#,
        )
        .bind(domain)
        .bind(at)
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        dead_domain_from_row(&row)
    }

    async fn clear_dead_domain(&self, domain: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM dead_domains WHERE domain = $1")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
