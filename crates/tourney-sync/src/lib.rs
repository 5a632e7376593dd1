//! Ingestion orchestration: source registry, sweeps, entity resolution,
//! URL discovery, fact dedup, score rebuilds and domain health.

use std::sync::Arc;

use anyhow::Context;
use tourney_storage::{HttpFetcher, PageFetcher, PgStore, TournamentStore};

pub mod candidates;
pub mod config;
pub mod domains;
pub mod facts;
pub mod registry;
pub mod resolver;
pub mod scores;
pub mod sweep;

pub use candidates::{
    CandidateError, CandidateReport, DiscoverySummary, SearchError, SearchHit, SearchProvider,
    TavilySearch, UrlCandidateScorer, UrlContext, AUTO_APPLY_THRESHOLD,
};
pub use config::PipelineConfig;
pub use domains::{DomainHealth, HostResolver, RevisitSummary, SystemResolver};
pub use facts::{FactActionSummary, FactDeduplicator, FactError, ProposeSummary};
pub use registry::{RegistryError, SeedSummary, SourceEntry, SourceRegistry};
pub use resolver::{EntityResolver, ResolveError, ResolverConfig};
pub use scores::{RecomputeSummary, ScoreAggregator};
pub use sweep::{SourceOutcome, SweepPipeline, SweepRunSummary};

pub const CRATE_NAME: &str = "tourney-sync";

/// Every job service wired over one store, shared by the CLI and the job API.
#[derive(Clone)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub store: Arc<dyn TournamentStore>,
    pub registry: SourceRegistry,
    pub resolver: EntityResolver,
    pub sweep: SweepPipeline,
    pub candidates: Arc<UrlCandidateScorer>,
    pub facts: FactDeduplicator,
    pub scores: Arc<ScoreAggregator>,
    pub domains: DomainHealth,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn TournamentStore>,
        fetcher: Arc<dyn PageFetcher>,
        search: Arc<dyn SearchProvider>,
        dns: Arc<dyn HostResolver>,
    ) -> Self {
        let domains = DomainHealth::new(
            store.clone(),
            dns,
            config.revisit_window(),
            config.probe_concurrency,
        )
        .with_failure_threshold(config.dead_after_failures);
        let sweep = SweepPipeline::new(config.clone(), store.clone(), fetcher.clone())
            .with_domain_health(domains.clone());
        let candidates = UrlCandidateScorer::new(
            search,
            fetcher,
            store.clone(),
            domains.clone(),
            config.probe_concurrency,
        );
        Self {
            registry: SourceRegistry::new(store.clone()),
            resolver: EntityResolver::new(
                store.clone(),
                ResolverConfig {
                    default_status: config.default_status,
                    year_in_slug: config.year_in_slug,
                },
            ),
            sweep,
            candidates: Arc::new(candidates),
            facts: FactDeduplicator::new(store.clone()),
            scores: Arc::new(ScoreAggregator::new(store.clone())),
            domains,
            store,
            config,
        }
    }

    /// Production wiring: shared HTTP client, Tavily search, system DNS.
    pub fn from_config(config: PipelineConfig, store: Arc<dyn TournamentStore>) -> anyhow::Result<Self> {
        let http = config.http_client_config();
        let fetcher = HttpFetcher::new(http.clone()).context("building page fetcher")?;
        let search = TavilySearch::new(config.tavily_api_key.clone(), http.timeout)?
            .with_rate_limit(config.search_rate_limit());
        let dns = SystemResolver { timeout: http.timeout };
        Ok(Self::new(
            config,
            store,
            Arc::new(fetcher),
            Arc::new(search),
            Arc::new(dns),
        ))
    }
}

pub async fn connect_store(config: &PipelineConfig) -> anyhow::Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", redact(&config.database_url)))?;
    Ok(Arc::new(store))
}

/// Database URL with any password masked, for logs and errors.
pub fn redact(database_url: &str) -> String {
    match (database_url.find("://"), database_url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let creds = &database_url[scheme_end + 3..at];
            match creds.split_once(':') {
                Some((user, _)) => format!(
                    "{}{user}:***{}",
                    &database_url[..scheme_end + 3],
                    &database_url[at..]
                ),
                None => database_url.to_string(),
            }
        }
        _ => database_url.to_string(),
    }
}
