//! Persisted dead-domain tracking with a revisit window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tourney_core::DeadDomain;
use tourney_storage::{StoreError, TournamentStore};
use tracing::{info, warn};

/// Name resolution seam; the system resolver is used outside tests.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct SystemResolver {
    pub timeout: Duration,
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<(), String> {
        let lookup = tokio::net::lookup_host((host, 443));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(_) => Ok(()),
                None => Err(format!("dns lookup for {host} returned no addresses")),
            },
            Ok(Err(err)) => Err(format!("dns lookup failed: {err}")),
            Err(_) => Err(format!("dns lookup for {host} timed out")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevisitSummary {
    pub checked: usize,
    pub recovered: usize,
    pub still_dead: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct DomainHealth {
    store: Arc<dyn TournamentStore>,
    resolver: Arc<dyn HostResolver>,
    window: chrono::Duration,
    concurrency: usize,
    dead_after: u32,
}

impl DomainHealth {
    pub fn new(
        store: Arc<dyn TournamentStore>,
        resolver: Arc<dyn HostResolver>,
        window: chrono::Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            resolver,
            window,
            concurrency: concurrency.max(1),
            dead_after: 2,
        }
    }

    /// Consecutive resolution failures before a domain is skipped.
    pub fn with_failure_threshold(mut self, failures: u32) -> Self {
        self.dead_after = failures.max(1);
        self
    }

    fn within_window(&self, domain: &DeadDomain) -> bool {
        domain.last_checked_at + self.window > Utc::now()
    }

    /// True when the host has failed resolution repeatedly and recently
    /// enough to skip it.
    pub async fn is_dead(&self, host: &str) -> Result<bool, StoreError> {
        Ok(self.store.dead_domain(host).await?.is_some_and(|d| {
            i64::from(d.failure_count) >= i64::from(self.dead_after) && self.within_window(&d)
        }))
    }

    pub async fn record_failure(&self, host: &str, error: &str) -> Result<DeadDomain, StoreError> {
        let row = self.store.record_dns_failure(host, error, Utc::now()).await?;
        if i64::from(row.failure_count) >= i64::from(self.dead_after) {
            warn!(domain = host, failures = row.failure_count, error, "domain marked dead");
        } else {
            info!(domain = host, failures = row.failure_count, error, "domain failed to resolve");
        }
        Ok(row)
    }

    /// Re-resolve dead domains whose window has elapsed; recovered ones are cleared.
    pub async fn revisit(&self) -> Result<RevisitSummary, StoreError> {
        let dead = self.store.dead_domains().await?;
        let (due, fresh): (Vec<_>, Vec<_>) = dead.into_iter().partition(|d| !self.within_window(d));
        let mut summary = RevisitSummary {
            skipped: fresh.len(),
            ..Default::default()
        };

        let results = stream::iter(due)
            .map(|domain| async move {
                let outcome = self.resolver.resolve(&domain.domain).await;
                (domain, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        for (domain, outcome) in results {
            summary.checked += 1;
            let write = match outcome {
                Ok(()) => self.store.clear_dead_domain(&domain.domain).await.map(|_| {
                    summary.recovered += 1;
                    info!(domain = %domain.domain, "domain resolves again");
                }),
                Err(error) => self
                    .store
                    .record_dns_failure(&domain.domain, &error, Utc::now())
                    .await
                    .map(|_| summary.still_dead += 1),
            };
            if let Err(err) = write {
                summary.failed += 1;
                warn!(domain = %domain.domain, error = %err, "could not update dead domain");
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tourney_storage::MemoryStore;

    struct FakeResolver {
        live: HashSet<String>,
    }

    #[async_trait]
    impl HostResolver for FakeResolver {
        async fn resolve(&self, host: &str) -> Result<(), String> {
            if self.live.contains(host) {
                Ok(())
            } else {
                Err(format!("dns lookup failed: {host}"))
            }
        }
    }

    fn health(store: Arc<MemoryStore>, window_days: i64) -> DomainHealth {
        let resolver = FakeResolver {
            live: HashSet::from(["back.org".to_string()]),
        };
        DomainHealth::new(store, Arc::new(resolver), chrono::Duration::days(window_days), 5)
    }

    #[tokio::test]
    async fn one_failure_is_not_enough_to_mark_a_domain_dead() {
        let store = Arc::new(MemoryStore::new());
        let health = health(store.clone(), 7).with_failure_threshold(3);
        for _ in 0..2 {
            health.record_failure("flaky.org", "dns error").await.unwrap();
            assert!(!health.is_dead("flaky.org").await.unwrap());
        }
        health.record_failure("flaky.org", "dns error").await.unwrap();
        assert!(health.is_dead("flaky.org").await.unwrap());
    }

    #[tokio::test]
    async fn recent_failures_are_dead_until_the_window_passes() {
        let store = Arc::new(MemoryStore::new());
        let health = health(store.clone(), 7);
        assert!(!health.is_dead("gone.org").await.unwrap());
        health.record_failure("gone.org", "dns error").await.unwrap();
        assert!(!health.is_dead("gone.org").await.unwrap());
        health.record_failure("gone.org", "dns error").await.unwrap();
        assert!(health.is_dead("gone.org").await.unwrap());

        let expired = DomainHealth::new(
            store,
            Arc::new(SystemResolver { timeout: Duration::from_secs(1) }),
            chrono::Duration::zero(),
            1,
        );
        assert!(!expired.is_dead("gone.org").await.unwrap());
    }

    #[tokio::test]
    async fn revisit_clears_recovered_and_bumps_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let long_ago = Utc::now() - chrono::Duration::days(30);
        store.record_dns_failure("back.org", "dns error", long_ago).await.unwrap();
        store.record_dns_failure("gone.org", "dns error", long_ago).await.unwrap();
        store.record_dns_failure("new.org", "dns error", Utc::now()).await.unwrap();

        let summary = health(store.clone(), 7).revisit().await.unwrap();
        assert_eq!(
            summary,
            RevisitSummary { checked: 2, recovered: 1, still_dead: 1, skipped: 1, failed: 0 }
        );
        assert!(store.dead_domain("back.org").await.unwrap().is_none());
        let gone = store.dead_domain("gone.org").await.unwrap().unwrap();
        assert_eq!(gone.failure_count, 2);
        assert!(gone.last_checked_at > long_ago);
    }
}
