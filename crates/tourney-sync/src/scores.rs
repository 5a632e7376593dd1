//! Full rebuild of review score aggregates.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tourney_core::{AggregateKey, Review, ReviewKind, ReviewStatus, ScoreAggregate};
use tourney_storage::{StoreError, TournamentStore};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecomputeSummary {
    pub kind: ReviewKind,
    pub processed: usize,
    pub upserted: usize,
    pub deleted: usize,
}

pub fn summary_text(count: usize) -> String {
    if count == 1 {
        "Based on 1 verified review.".to_string()
    } else {
        format!("Based on {count} verified reviews.")
    }
}

fn qualifies(review: &Review) -> bool {
    review.status == ReviewStatus::Approved && (1.0..=5.0).contains(&review.overall_score)
}

fn group_key(review: &Review) -> AggregateKey {
    let sport = if review.kind.segmented_by_sport() {
        review
            .sport
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    } else {
        None
    };
    AggregateKey {
        kind: review.kind,
        entity_id: review.entity_id,
        sport,
    }
}

/// Aggregates are a pure function of the approved reviews for a kind.
pub fn build_aggregates(reviews: &[Review]) -> Vec<ScoreAggregate> {
    let mut groups: BTreeMap<AggregateKey, Vec<f64>> = BTreeMap::new();
    for review in reviews.iter().filter(|r| qualifies(r)) {
        groups.entry(group_key(review)).or_default().push(review.overall_score);
    }
    groups
        .into_iter()
        .map(|(key, scores)| {
            let avg = scores.iter().sum::<f64>() / scores.len() as f64;
            ScoreAggregate {
                key,
                percent_score: (avg / 5.0 * 100.0).round() as i32,
                review_count: scores.len() as i64,
                summary_text: summary_text(scores.len()),
            }
        })
        .collect()
}

pub struct ScoreAggregator {
    store: Arc<dyn TournamentStore>,
}

impl ScoreAggregator {
    pub fn new(store: Arc<dyn TournamentStore>) -> Self {
        Self { store }
    }

    /// Rebuild every aggregate of `kind`. The store serializes runs for the
    /// same kind, across processes for Postgres; different kinds proceed in
    /// parallel.
    pub async fn recompute(&self, kind: ReviewKind) -> Result<RecomputeSummary, StoreError> {
        let rebuild = self.store.rebuild_aggregates(kind, build_aggregates).await?;
        let summary = RecomputeSummary {
            kind,
            processed: rebuild.reviews,
            upserted: rebuild.upserted,
            deleted: rebuild.deleted,
        };
        info!(
            kind = %kind,
            processed = summary.processed,
            upserted = summary.upserted,
            deleted = summary.deleted,
            "score aggregates rebuilt"
        );
        Ok(summary)
    }

    pub async fn recompute_all(&self) -> Result<Vec<RecomputeSummary>, StoreError> {
        let runs = [ReviewKind::Tournament, ReviewKind::Venue, ReviewKind::Assignor]
            .map(|kind| self.recompute(kind));
        futures::future::try_join_all(runs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tourney_storage::MemoryStore;
    use uuid::Uuid;

    fn review(kind: ReviewKind, entity_id: Uuid, score: f64, status: ReviewStatus) -> Review {
        Review {
            id: Uuid::new_v4(),
            kind,
            entity_id,
            sport: None,
            status,
            overall_score: score,
        }
    }

    #[test]
    fn summary_text_is_singular_for_one() {
        assert_eq!(summary_text(1), "Based on 1 verified review.");
        assert_eq!(summary_text(3), "Based on 3 verified reviews.");
    }

    #[test]
    fn only_approved_in_range_scores_count() {
        let id = Uuid::new_v4();
        let reviews = vec![
            review(ReviewKind::Venue, id, 4.0, ReviewStatus::Approved),
            review(ReviewKind::Venue, id, 5.0, ReviewStatus::Approved),
            review(ReviewKind::Venue, id, 1.0, ReviewStatus::Pending),
            review(ReviewKind::Venue, id, 0.0, ReviewStatus::Approved),
            review(ReviewKind::Venue, id, 9.0, ReviewStatus::Approved),
        ];
        let aggregates = build_aggregates(&reviews);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].review_count, 2);
        assert_eq!(aggregates[0].percent_score, 90);
        assert_eq!(aggregates[0].summary_text, "Based on 2 verified reviews.");
    }

    #[test]
    fn assignor_scores_are_segmented_by_sport() {
        let id = Uuid::new_v4();
        let mut soccer = review(ReviewKind::Assignor, id, 5.0, ReviewStatus::Approved);
        soccer.sport = Some("Soccer".into());
        let mut lacrosse = review(ReviewKind::Assignor, id, 3.0, ReviewStatus::Approved);
        lacrosse.sport = Some("lacrosse".into());
        let aggregates = build_aggregates(&[soccer, lacrosse]);
        let sports = aggregates
            .iter()
            .map(|a| a.key.sport.clone().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(sports, vec!["lacrosse", "soccer"]);
    }

    #[test]
    fn higher_review_never_lowers_the_score() {
        let id = Uuid::new_v4();
        let mut reviews = vec![
            review(ReviewKind::Tournament, id, 3.0, ReviewStatus::Approved),
            review(ReviewKind::Tournament, id, 4.0, ReviewStatus::Approved),
        ];
        let before = build_aggregates(&reviews)[0].percent_score;
        reviews.push(review(ReviewKind::Tournament, id, 5.0, ReviewStatus::Approved));
        let after = build_aggregates(&reviews)[0].percent_score;
        assert!(after >= before);
        assert_eq!((before, after), (70, 80));
    }

    #[tokio::test]
    async fn rebuild_removes_groups_without_qualifying_reviews() {
        let store = Arc::new(MemoryStore::new());
        let kept = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        store
            .insert_review(review(ReviewKind::Tournament, kept, 4.0, ReviewStatus::Approved))
            .await;
        store
            .insert_aggregate(ScoreAggregate {
                key: AggregateKey {
                    kind: ReviewKind::Tournament,
                    entity_id: orphan,
                    sport: None,
                },
                percent_score: 100,
                review_count: 1,
                summary_text: summary_text(1),
            })
            .await;

        let aggregator = ScoreAggregator::new(store.clone());
        let summary = aggregator.recompute(ReviewKind::Tournament).await.unwrap();
        assert_eq!(
            summary,
            RecomputeSummary {
                kind: ReviewKind::Tournament,
                processed: 1,
                upserted: 1,
                deleted: 1,
            }
        );
        let rows = store.aggregates(ReviewKind::Tournament).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.entity_id, kept);
        assert_eq!(rows[0].percent_score, 80);

        let again = aggregator.recompute(ReviewKind::Tournament).await.unwrap();
        assert_eq!(again.deleted, 0);
        assert_eq!(store.aggregates(ReviewKind::Tournament).await.unwrap(), rows);
    }

    #[tokio::test]
    async fn concurrent_rebuilds_of_one_kind_converge() {
        let store = Arc::new(MemoryStore::new());
        for score in [2.0, 3.0, 5.0] {
            store
                .insert_review(review(ReviewKind::Venue, Uuid::nil(), score, ReviewStatus::Approved))
                .await;
        }
        let aggregator = Arc::new(ScoreAggregator::new(store.clone()));
        let (a, b, all) = tokio::join!(
            aggregator.recompute(ReviewKind::Venue),
            aggregator.recompute(ReviewKind::Venue),
            aggregator.recompute_all(),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(all.unwrap().len(), 3);
        let rows = store.aggregates(ReviewKind::Venue).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].percent_score, 67);
    }
}
