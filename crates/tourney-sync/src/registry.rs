//! Known crawl sources, keyed by canonical URL.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tourney_core::url::normalize;
use tourney_core::{NewSource, SourceRecord, SourceType, SweepStatus, UrlError};
use tourney_storage::{StoreError, TournamentStore};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn default_active() -> bool {
    true
}

/// One entry as written in `sources.yaml` or posted by an admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    pub source_type: SourceType,
    pub sport: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceManifest {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub seen: usize,
    pub upserted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct SourceRegistry {
    store: Arc<dyn TournamentStore>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn TournamentStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, entry: SourceEntry) -> Result<SourceRecord, RegistryError> {
        let canonical = normalize(&entry.url)?;
        let record = self
            .store
            .upsert_source(NewSource {
                canonical_url: canonical.canonical,
                source_type: entry.source_type,
                sport: entry.sport.trim().to_lowercase(),
                state: entry.state.filter(|s| !s.trim().is_empty()),
                city: entry.city.filter(|c| !c.trim().is_empty()),
                notes: entry.notes,
                is_active: entry.active,
            })
            .await?;
        Ok(record)
    }

    /// Accepts raw or canonical URLs.
    pub async fn get_by_url(&self, url: &str) -> Result<Option<SourceRecord>, RegistryError> {
        let canonical = normalize(url)?;
        Ok(self.store.source_by_url(&canonical.canonical).await?)
    }

    pub async fn list_active(&self) -> Result<Vec<SourceRecord>, RegistryError> {
        Ok(self.store.list_sources(true).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<SourceRecord>, RegistryError> {
        Ok(self.store.list_sources(false).await?)
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<SourceRecord, RegistryError> {
        Ok(self.store.set_source_active(id, active).await?)
    }

    pub async fn record_sweep(
        &self,
        id: Uuid,
        status: SweepStatus,
        summary: &str,
    ) -> Result<(), RegistryError> {
        Ok(self.store.record_sweep(id, status, summary, Utc::now()).await?)
    }

    /// Upsert every manifest entry; a bad entry is logged and counted, not fatal.
    pub async fn seed_from_yaml(&self, path: &Path) -> anyhow::Result<SeedSummary> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let manifest: SourceManifest =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut summary = SeedSummary {
            seen: manifest.sources.len(),
            ..Default::default()
        };
        for entry in manifest.sources {
            let url = entry.url.clone();
            match self.upsert(entry).await {
                Ok(record) => {
                    summary.upserted += 1;
                    info!(url = %record.canonical_url, source_type = %record.source_type, "source seeded");
                }
                Err(RegistryError::InvalidUrl(err)) => {
                    summary.failed += 1;
                    warn!(url, error = %err, "skipping manifest entry");
                }
                Err(err) => return Err(err).with_context(|| format!("seeding {url}")),
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tourney_storage::MemoryStore;

    fn entry(url: &str) -> SourceEntry {
        SourceEntry {
            url: url.into(),
            source_type: SourceType::TableListing,
            sport: "Soccer".into(),
            state: Some("WA".into()),
            city: None,
            notes: None,
            active: true,
        }
    }

    #[tokio::test]
    async fn equivalent_urls_share_one_row() {
        let registry = SourceRegistry::new(Arc::new(MemoryStore::new()));
        let first = registry
            .upsert(entry("http://WWW.WaSoccer.org/events?utm_source=x#top"))
            .await
            .unwrap();
        let mut changed = entry("https://wasoccer.org/events");
        changed.source_type = SourceType::VenueCalendar;
        let second = registry.upsert(changed).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.canonical_url, "https://wasoccer.org/events");
        assert_eq!(second.source_type, SourceType::VenueCalendar);
        assert_eq!(second.sport, "soccer");
        assert_eq!(registry.list_all().await.unwrap().len(), 1);

        let found = registry
            .get_by_url("wasoccer.org/events?fbclid=abc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn deactivated_sources_drop_out_of_active_list() {
        let registry = SourceRegistry::new(Arc::new(MemoryStore::new()));
        let a = registry.upsert(entry("https://a.org/events")).await.unwrap();
        registry.upsert(entry("https://b.org/events")).await.unwrap();
        registry.set_active(a.id, false).await.unwrap();

        let active = registry.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].canonical_url, "https://b.org/events");
        assert_eq!(registry.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sweep_outcome_is_recorded_on_the_row() {
        let registry = SourceRegistry::new(Arc::new(MemoryStore::new()));
        let source = registry.upsert(entry("https://a.org/events")).await.unwrap();
        registry
            .record_sweep(source.id, SweepStatus::Partial, "3 records, 1 failed page")
            .await
            .unwrap();

        let row = registry.get_by_url("https://a.org/events").await.unwrap().unwrap();
        assert_eq!(row.last_sweep_status, Some(SweepStatus::Partial));
        assert_eq!(row.last_sweep_summary.as_deref(), Some("3 records, 1 failed page"));
        assert!(row.last_swept_at.is_some());
    }

    #[tokio::test]
    async fn manifest_seeding_counts_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            r#"
sources:
  - url: https://wayouthsoccer.org/tournaments
    source_type: table_listing
    sport: soccer
    state: WA
  - url: "http://"
    source_type: venue_calendar
    sport: soccer
  - url: https://starfiresports.com/events
    source_type: venue_calendar
    sport: soccer
    state: WA
    city: Tukwila
    active: false
"#,
        )
        .unwrap();

        let registry = SourceRegistry::new(Arc::new(MemoryStore::new()));
        let summary = registry.seed_from_yaml(&path).await.unwrap();
        assert_eq!(summary, SeedSummary { seen: 3, upserted: 2, failed: 1 });
        assert_eq!(registry.list_active().await.unwrap().len(), 1);

        let again = registry.seed_from_yaml(&path).await.unwrap();
        assert_eq!(again.upserted, 2);
        assert_eq!(registry.list_all().await.unwrap().len(), 2);
    }
}
