//! One sweep over the registered sources: fetch, archive, extract, resolve.
//!
//! Sources run concurrently and independently. A source that errors or
//! hangs is recorded as failed and the run carries on; it is simply eligible
//! again on the next scheduled run.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs;
use tourney_adapters::{extractor_for, ExtractScope, SiteExtractor};
use tourney_core::url::host_of;
use tourney_core::{SourceRecord, SourceType, SweepStatus};
use tourney_storage::{ArtifactStore, FetchError, PageFetcher, TournamentStore};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::domains::{DomainHealth, SystemResolver};
use crate::registry::SourceRegistry;
use crate::resolver::{EntityResolver, ResolveError, ResolverConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEntry {
    pub tournament_id: Uuid,
    pub slug: String,
    pub inserted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: Uuid,
    pub source_url: String,
    pub source_type: SourceType,
    pub status: SweepStatus,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub records_extracted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub error: Option<String>,
    /// Tournaments this source inserted or changed.
    pub touched: Vec<ResolvedEntry>,
}

impl SourceOutcome {
    fn new(source: &SourceRecord) -> Self {
        Self {
            source_id: source.id,
            source_url: source.canonical_url.clone(),
            source_type: source.source_type,
            status: SweepStatus::Success,
            pages_fetched: 0,
            pages_failed: 0,
            records_extracted: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
            error: None,
            touched: Vec::new(),
        }
    }

    fn failed(mut self, error: String) -> Self {
        self.status = SweepStatus::Failed;
        self.error = Some(error);
        self
    }

    fn settle(mut self) -> Self {
        if self.status != SweepStatus::Failed && (self.pages_failed > 0 || self.failed > 0) {
            self.status = SweepStatus::Partial;
        }
        self
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} pages ({} failed), {} records: {} inserted, {} updated, {} unchanged, {} skipped, {} failed",
            self.pages_fetched,
            self.pages_failed,
            self.records_extracted,
            self.inserted,
            self.updated,
            self.unchanged,
            self.skipped,
            self.failed
        );
        if let Some(error) = &self.error {
            line.push_str(&format!("; error: {error}"));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub records_extracted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub reports_dir: String,
    pub sources: Vec<SourceOutcome>,
}

#[derive(Clone)]
pub struct SweepPipeline {
    config: PipelineConfig,
    registry: SourceRegistry,
    resolver: EntityResolver,
    fetcher: Arc<dyn PageFetcher>,
    artifacts: ArtifactStore,
    domains: DomainHealth,
}

impl SweepPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn TournamentStore>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let resolver = EntityResolver::new(
            store.clone(),
            ResolverConfig {
                default_status: config.default_status,
                year_in_slug: config.year_in_slug,
            },
        );
        let domains = DomainHealth::new(
            store.clone(),
            Arc::new(SystemResolver {
                timeout: config.http_client_config().timeout,
            }),
            config.revisit_window(),
            config.probe_concurrency,
        );
        Self {
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            registry: SourceRegistry::new(store),
            resolver,
            fetcher,
            domains,
            config,
        }
    }

    pub fn with_domain_health(mut self, domains: DomainHealth) -> Self {
        self.domains = domains;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Sweep every active source.
    pub async fn run_once(&self) -> anyhow::Result<SweepRunSummary> {
        let sources = self
            .registry
            .list_active()
            .await
            .context("listing active sources")?;
        self.run_sources(sources).await
    }

    pub async fn run_sources(&self, sources: Vec<SourceRecord>) -> anyhow::Result<SweepRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let timeout = self.config.source_timeout();
        info!(%run_id, sources = sources.len(), "sweep started");

        let mut outcomes = stream::iter(sources)
            .map(|source| async move {
                let span = tracing::info_span!("sweep_source", url = %source.canonical_url);
                let outcome = match tokio::time::timeout(timeout, self.sweep_source(&source))
                    .instrument(span)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => SourceOutcome::new(&source)
                        .failed(format!("timed out after {}s", timeout.as_secs())),
                };
                self.record(&outcome).await;
                outcome
            })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        outcomes.sort_by(|a, b| a.source_url.cmp(&b.source_url));

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_root().join(run_id.to_string());
        let summary = SweepRunSummary {
            run_id,
            started_at,
            finished_at,
            processed: outcomes.len(),
            succeeded: count_status(&outcomes, SweepStatus::Success),
            partial: count_status(&outcomes, SweepStatus::Partial),
            failed: count_status(&outcomes, SweepStatus::Failed),
            records_extracted: outcomes.iter().map(|o| o.records_extracted).sum(),
            inserted: outcomes.iter().map(|o| o.inserted).sum(),
            updated: outcomes.iter().map(|o| o.updated).sum(),
            unchanged: outcomes.iter().map(|o| o.unchanged).sum(),
            skipped: outcomes.iter().map(|o| o.skipped).sum(),
            reports_dir: reports_dir.display().to_string(),
            sources: outcomes,
        };
        write_reports(&reports_dir, &summary).await?;
        info!(
            %run_id,
            processed = summary.processed,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            inserted = summary.inserted,
            updated = summary.updated,
            "sweep finished"
        );
        Ok(summary)
    }

    async fn record(&self, outcome: &SourceOutcome) {
        if let Err(err) = self
            .registry
            .record_sweep(outcome.source_id, outcome.status, &outcome.summary_line())
            .await
        {
            warn!(url = %outcome.source_url, error = %err, "could not record sweep outcome");
        }
    }

    async fn sweep_source(&self, source: &SourceRecord) -> SourceOutcome {
        let mut outcome = SourceOutcome::new(source);
        let extractor = extractor_for(source.source_type, ExtractScope::for_source(source));

        let index = match self.fetch_page(&source.canonical_url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(url = %source.canonical_url, error = %err, "source fetch failed");
                return outcome.failed(err.to_string());
            }
        };
        outcome.pages_fetched += 1;

        let pages = match extractor.discover(&index, &source.canonical_url) {
            Ok(urls) if !urls.is_empty() => urls,
            Ok(_) => {
                self.extract_page(source, extractor.as_ref(), &index, &source.canonical_url, &mut outcome)
                    .await;
                return outcome.settle();
            }
            Err(err) => return outcome.failed(err.to_string()),
        };

        debug!(url = %source.canonical_url, pages = pages.len(), "following discovered pages");
        for page_url in pages {
            match self.fetch_page(&page_url).await {
                Ok(html) => {
                    outcome.pages_fetched += 1;
                    self.extract_page(source, extractor.as_ref(), &html, &page_url, &mut outcome)
                        .await;
                }
                Err(err) => {
                    outcome.pages_failed += 1;
                    warn!(url = %page_url, error = %err, "page fetch failed");
                }
            }
        }
        outcome.settle()
    }

    async fn extract_page(
        &self,
        source: &SourceRecord,
        extractor: &dyn SiteExtractor,
        html: &str,
        page_url: &str,
        outcome: &mut SourceOutcome,
    ) {
        let records = match extractor.extract(html, page_url) {
            Ok(records) => records,
            Err(err) => {
                outcome.pages_failed += 1;
                warn!(url = page_url, error = %err, "extraction failed");
                return;
            }
        };
        outcome.records_extracted += records.len();

        for record in records {
            let event_id = self.resolver.slug_for(&record);
            match self
                .resolver
                .upsert_from_source(&record, &source.sport, &source.canonical_url, &event_id)
                .await
            {
                Ok(resolved) if resolved.inserted => {
                    outcome.inserted += 1;
                    outcome.touched.push(ResolvedEntry {
                        tournament_id: resolved.id,
                        slug: resolved.slug,
                        inserted: true,
                    });
                }
                Ok(resolved) if resolved.changed => {
                    outcome.updated += 1;
                    outcome.touched.push(ResolvedEntry {
                        tournament_id: resolved.id,
                        slug: resolved.slug,
                        inserted: false,
                    });
                }
                Ok(_) => outcome.unchanged += 1,
                Err(ResolveError::InvalidRecord(reason)) => {
                    outcome.skipped += 1;
                    debug!(url = page_url, reason = %reason, "record skipped");
                }
                Err(err) => {
                    outcome.failed += 1;
                    warn!(url = page_url, name = %record.name, error = %err, "record upsert failed");
                }
            }
        }
    }

    /// Fetch and archive one page. Dead domains are not contacted.
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let host = host_of(url)?;
        if self.domains.is_dead(&host).await.unwrap_or(false) {
            return Err(FetchError::Unreachable(format!("{host} is a known dead domain")));
        }

        let fetched = match self.fetcher.fetch_page(url).await {
            Ok(fetched) => fetched,
            Err(err) => {
                if err.is_dns_failure() {
                    if let Err(store_err) = self.domains.record_failure(&host, &err.to_string()).await {
                        warn!(host = %host, error = %store_err, "could not record dead domain");
                    }
                }
                return Err(err);
            }
        };

        match self
            .artifacts
            .archive_page(Utc::now(), &host, fetched.content_type.as_deref(), &fetched.body)
            .await
        {
            Ok(page) => debug!(url, path = %page.relative_path.display(), deduplicated = page.deduplicated, "page archived"),
            Err(err) => warn!(url, error = %err, "archiving page failed"),
        }
        Ok(fetched.text())
    }
}

fn count_status(outcomes: &[SourceOutcome], status: SweepStatus) -> usize {
    outcomes.iter().filter(|o| o.status == status).count()
}

pub fn sweep_markdown(summary: &SweepRunSummary) -> String {
    let sources = summary
        .sources
        .iter()
        .map(|o| format!("- {} [{}]: {}, {}", o.source_url, o.source_type, o.status, o.summary_line()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Tournament Sweep Summary\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources: {} ({} success, {} partial, {} failed)\n- Records extracted: {}\n- Tournaments inserted: {}\n- Tournaments updated: {}\n- Unchanged: {}\n- Skipped records: {}\n\n## Sources\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.processed,
        summary.succeeded,
        summary.partial,
        summary.failed,
        summary.records_extracted,
        summary.inserted,
        summary.updated,
        summary.unchanged,
        summary.skipped,
        sources
    )
}

async fn write_reports(reports_dir: &Path, summary: &SweepRunSummary) -> anyhow::Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    fs::write(reports_dir.join("sweep_summary.md"), sweep_markdown(summary))
        .await
        .context("writing sweep_summary.md")?;

    let touched = summary
        .sources
        .iter()
        .flat_map(|o| o.touched.iter().map(move |t| (o.source_url.as_str(), t)))
        .map(|(source, t)| {
            serde_json::json!({
                "source": source,
                "tournament_id": t.tournament_id,
                "slug": t.slug,
                "inserted": t.inserted,
            })
        })
        .collect::<Vec<_>>();
    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "tournaments": touched,
    }))
    .context("serializing sweep delta")?;
    fs::write(reports_dir.join("sweep_delta.json"), delta_json)
        .await
        .context("writing sweep_delta.json")?;
    Ok(())
}
