//! Candidate fact proposals collapsed by content signature.
//!
//! Duplicates share `(entity_id, kind, content_signature)`; reviewer actions
//! always apply to the whole duplicate set so no stale twin is left behind.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tourney_core::{CandidateFact, FactDecision, FactKind, FactPayload};
use tourney_storage::{StoreError, TournamentStore};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FactError {
    #[error("tournament not found: {0}")]
    EntityNotFound(Uuid),
    #[error("fact not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProposeSummary {
    pub proposed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub blank: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactActionSummary {
    pub fact_id: Uuid,
    pub affected: u64,
}

#[derive(Clone)]
pub struct FactDeduplicator {
    store: Arc<dyn TournamentStore>,
}

impl FactDeduplicator {
    pub fn new(store: Arc<dyn TournamentStore>) -> Self {
        Self { store }
    }

    /// Store new facts for an entity. In-batch repeats and signatures already
    /// on file (decided or not) are skipped.
    pub async fn propose(
        &self,
        entity_id: Uuid,
        facts: Vec<FactPayload>,
    ) -> Result<ProposeSummary, FactError> {
        if self.store.tournament(entity_id).await?.is_none() {
            return Err(FactError::EntityNotFound(entity_id));
        }

        let mut summary = ProposeSummary {
            proposed: facts.len(),
            ..Default::default()
        };
        let mut seen: HashSet<(FactKind, String)> = HashSet::new();
        for payload in facts {
            if payload.is_blank() {
                summary.blank += 1;
                continue;
            }
            if !seen.insert((payload.kind(), payload.content_signature())) {
                summary.duplicates += 1;
                continue;
            }
            match self.store.insert_fact_if_new(entity_id, &payload).await? {
                Some(_) => summary.inserted += 1,
                None => summary.duplicates += 1,
            }
        }
        info!(
            %entity_id,
            proposed = summary.proposed,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "facts proposed"
        );
        Ok(summary)
    }

    pub async fn list(
        &self,
        entity_id: Uuid,
        kind: Option<FactKind>,
    ) -> Result<Vec<CandidateFact>, FactError> {
        Ok(self.store.facts_for_entity(entity_id, kind).await?)
    }

    /// Ids of every row sharing the fact's signature, or just the fact itself.
    async fn duplicate_set(&self, fact_id: Uuid) -> Result<Vec<Uuid>, FactError> {
        let fact = self
            .store
            .fact(fact_id)
            .await?
            .ok_or(FactError::NotFound(fact_id))?;
        let mut ids = if fact.content_signature.is_empty() {
            Vec::new()
        } else {
            self.store
                .facts_with_signature(fact.entity_id, fact.kind, &fact.content_signature)
                .await?
                .into_iter()
                .map(|f| f.id)
                .collect::<Vec<_>>()
        };
        if ids.is_empty() {
            ids.push(fact_id);
        }
        debug!(%fact_id, siblings = ids.len(), "resolved duplicate set");
        Ok(ids)
    }

    pub async fn delete(&self, fact_id: Uuid) -> Result<FactActionSummary, FactError> {
        let ids = self.duplicate_set(fact_id).await?;
        let affected = self.store.delete_facts(&ids).await?;
        Ok(FactActionSummary { fact_id, affected })
    }

    pub async fn accept(&self, fact_id: Uuid) -> Result<FactActionSummary, FactError> {
        self.decide(fact_id, FactDecision::Accept).await
    }

    pub async fn reject(&self, fact_id: Uuid) -> Result<FactActionSummary, FactError> {
        self.decide(fact_id, FactDecision::Reject).await
    }

    async fn decide(
        &self,
        fact_id: Uuid,
        decision: FactDecision,
    ) -> Result<FactActionSummary, FactError> {
        let ids = self.duplicate_set(fact_id).await?;
        let affected = self.store.decide_facts(&ids, decision, Utc::now()).await?;
        Ok(FactActionSummary { fact_id, affected })
    }
}
