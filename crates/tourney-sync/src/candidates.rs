//! Official-URL discovery: search, score, live-validate, auto-apply.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tourney_core::states::{state_code, state_name};
use tourney_core::url::normalize;
use tourney_core::{Tournament, UrlCandidate};
use tourney_storage::{PageFetcher, RateLimiter, StoreError, TournamentStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domains::DomainHealth;

pub const AUTO_APPLY_THRESHOLD: f64 = 0.85;
pub const MAX_QUERIES: usize = 4;
pub const RESULTS_PER_QUERY: usize = 10;

const NAME_WEIGHT: f64 = 0.45;
const HOST_ORG_WEIGHT: f64 = 0.20;
const STATE_WEIGHT: f64 = 0.15;
const CITY_WEIGHT: f64 = 0.10;
const SPORT_WEIGHT: f64 = 0.05;
const KEYWORD_WEIGHT: f64 = 0.05;

const HTML_BONUS: f64 = 0.10;
const NON_HTML_PENALTY: f64 = 0.05;
const FAILURE_PENALTY: f64 = 0.10;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "annual", "at", "classic", "cup", "for", "in", "invitational", "of", "on",
    "open", "showcase", "the", "tournament", "tourney",
];

const CONFIRMING_KEYWORDS: &[&str] = &[
    "tournament", "register", "registration", "schedule", "brackets", "teams", "divisions",
];

#[derive(Debug, Error)]
pub enum SearchError {
    /// Missing or rejected credentials; retrying this run is pointless.
    #[error("search provider unavailable: {0}")]
    Unavailable(String),
    /// No connection could be made. Only fatal when every query of a tournament hits it.
    #[error("search provider unreachable: {0}")]
    Unreachable(String),
    #[error("search failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("external provider unavailable: {0}")]
    ExternalProviderUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'static str,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

pub struct TavilySearch {
    api_key: Option<String>,
    endpoint: String,
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
}

impl TavilySearch {
    pub fn new(api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building search client")?;
        Ok(Self {
            api_key,
            endpoint: "https://api.tavily.com/search".to_string(),
            client,
            limiter: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_rate_limit(mut self, limiter: Option<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.limiter.is_some()
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SearchError::Unavailable("TAVILY_API_KEY is not set".into()))?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TavilyRequest {
                api_key,
                query,
                search_depth: "basic",
                max_results: limit.clamp(1, RESULTS_PER_QUERY),
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() && !e.is_timeout() {
                    SearchError::Unreachable(e.to_string())
                } else {
                    SearchError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SearchError::Unavailable(format!("search credentials rejected ({status})")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Failed(format!("search api error {status}: {body}")));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Failed(format!("parsing search response: {e}")))?;
        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                snippet: r.content,
            })
            .collect())
    }
}

/// What is known about the event whose official page is sought.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlContext {
    pub name: String,
    pub state: String,
    pub city: Option<String>,
    pub sport: String,
    pub host_org: Option<String>,
}

impl UrlContext {
    pub fn from_tournament(t: &Tournament) -> Self {
        Self {
            name: t.name.clone(),
            state: t.state.clone().unwrap_or_default(),
            city: t.city.clone(),
            sport: t.sport.clone(),
            host_org: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateReport {
    pub candidates: Vec<UrlCandidate>,
    pub auto_apply_threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoverySummary {
    pub processed: usize,
    pub candidates_stored: usize,
    pub auto_applied: usize,
    pub failed: usize,
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Scoring tokens. Stop words are dropped unless nothing else remains.
fn scoring_tokens(text: &str) -> BTreeSet<String> {
    let all = words(text);
    let kept = all
        .iter()
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .cloned()
        .collect::<BTreeSet<_>>();
    if kept.is_empty() {
        all.into_iter().collect()
    } else {
        kept
    }
}

fn overlap(needle: &BTreeSet<String>, haystack: &BTreeSet<String>) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    needle.intersection(haystack).count() as f64 / needle.len() as f64
}

fn contains_phrase(haystack_words: &[String], phrase: &str) -> bool {
    let target = words(phrase);
    !target.is_empty() && haystack_words.windows(target.len()).any(|w| w == target.as_slice())
}

pub fn build_queries(ctx: &UrlContext) -> Vec<String> {
    let name = collapse(&ctx.name);
    let state = state_name(&ctx.state).unwrap_or(ctx.state.as_str()).to_string();
    let city = ctx.city.as_deref().map(collapse).unwrap_or_default();
    let sport = collapse(&ctx.sport);

    let mut raw = vec![
        format!("\"{name}\" {city} {state}"),
        format!("\"{name}\" {sport} tournament"),
        format!("{name} {state} {sport}"),
    ];
    if let Some(org) = ctx.host_org.as_deref().map(collapse).filter(|o| !o.is_empty()) {
        raw.insert(1, format!("\"{name}\" {org}"));
    }

    let mut queries: Vec<String> = Vec::new();
    for query in raw.into_iter().map(|q| collapse(&q)) {
        if !query.is_empty() && !queries.iter().any(|q| q.eq_ignore_ascii_case(&query)) {
            queries.push(query);
        }
    }
    queries.truncate(MAX_QUERIES);
    queries
}

/// Text-only score of a search hit against the context, before validation.
pub fn score_hit(ctx: &UrlContext, hit: &SearchHit) -> (f64, Vec<String>) {
    let prose = format!(
        "{} {}",
        hit.title.as_deref().unwrap_or_default(),
        hit.snippet.as_deref().unwrap_or_default()
    );
    let text = format!("{prose} {}", hit.url.replace(['/', '.', '-', '_'], " "));
    let hay_words = words(&text);
    let hay_tokens = hay_words.iter().cloned().collect::<BTreeSet<_>>();

    let mut matched = Vec::new();
    let mut score = 0.0;

    let name = overlap(&scoring_tokens(&ctx.name), &hay_tokens);
    if name > 0.0 {
        score += NAME_WEIGHT * name;
        if name >= 0.5 {
            matched.push("name".to_string());
        }
    }

    if let Some(org) = ctx.host_org.as_deref() {
        let org_overlap = overlap(&scoring_tokens(org), &hay_tokens);
        if org_overlap > 0.0 {
            score += HOST_ORG_WEIGHT * org_overlap;
            matched.push("host_org".to_string());
        }
    }

    // Two-letter codes collide with common words, so only upper-case codes count.
    let code = state_code(&ctx.state);
    let state_hit = code.is_some_and(|code| {
        state_name(code).is_some_and(|full| contains_phrase(&hay_words, full))
            || prose.split(|c: char| !c.is_alphanumeric()).any(|w| w == code)
    });
    if state_hit {
        score += STATE_WEIGHT;
        matched.push("state".to_string());
    }

    if ctx.city.as_deref().is_some_and(|city| contains_phrase(&hay_words, city)) {
        score += CITY_WEIGHT;
        matched.push("city".to_string());
    }

    if contains_phrase(&hay_words, &ctx.sport) {
        score += SPORT_WEIGHT;
        matched.push("sport".to_string());
    }

    if CONFIRMING_KEYWORDS.iter().any(|k| hay_tokens.contains(*k)) {
        score += KEYWORD_WEIGHT;
        matched.push("keyword".to_string());
    }

    (score.clamp(0.0, 1.0), matched)
}

fn round_score(score: f64) -> f64 {
    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

pub struct UrlCandidateScorer {
    provider: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn TournamentStore>,
    domains: DomainHealth,
    probe_concurrency: usize,
}

impl UrlCandidateScorer {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn TournamentStore>,
        domains: DomainHealth,
        probe_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            fetcher,
            store,
            domains,
            probe_concurrency: probe_concurrency.max(1),
        }
    }

    /// Run every query, merging hits by normalized URL in first-seen order.
    /// The provider counts as down only when no query could connect at all.
    async fn gather(&self, ctx: &UrlContext) -> Result<Vec<SearchHit>, CandidateError> {
        let mut merged: Vec<SearchHit> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let queries = build_queries(ctx);
        let mut unreachable = 0;
        let mut last_unreachable = String::new();

        for query in &queries {
            let hits = match self.provider.search(query, RESULTS_PER_QUERY).await {
                Ok(hits) => hits,
                Err(SearchError::Unavailable(reason)) => {
                    return Err(CandidateError::ExternalProviderUnavailable(reason))
                }
                Err(SearchError::Unreachable(reason)) => {
                    warn!(query = %query, error = %reason, "search provider unreachable");
                    unreachable += 1;
                    last_unreachable = reason;
                    continue;
                }
                Err(err) => {
                    warn!(query = %query, error = %err, "search query failed");
                    continue;
                }
            };

            for hit in hits {
                let Ok(canonical) = normalize(&hit.url) else {
                    debug!(url = %hit.url, "dropping unparseable search hit");
                    continue;
                };
                match index.get(&canonical.canonical) {
                    Some(&i) => {
                        let existing = &mut merged[i];
                        if existing.title.is_none() {
                            existing.title = hit.title;
                        }
                        if existing.snippet.is_none() {
                            existing.snippet = hit.snippet;
                        }
                    }
                    None => {
                        index.insert(canonical.canonical.clone(), merged.len());
                        merged.push(SearchHit {
                            url: canonical.canonical,
                            ..hit
                        });
                    }
                }
            }
        }
        if !queries.is_empty() && unreachable == queries.len() {
            return Err(CandidateError::ExternalProviderUnavailable(last_unreachable));
        }
        Ok(merged)
    }

    /// Adjust a scored candidate by fetching it. Never drops the candidate.
    async fn validate(&self, mut candidate: UrlCandidate) -> UrlCandidate {
        let host = normalize(&candidate.candidate_url)
            .map(|c| c.host)
            .unwrap_or_default();

        match self.domains.is_dead(&host).await {
            Ok(true) => {
                debug!(host = %host, "skipping probe of dead domain");
                candidate.score = round_score(candidate.score - FAILURE_PENALTY);
                return candidate;
            }
            Ok(false) => {}
            Err(err) => warn!(host = %host, error = %err, "dead domain lookup failed"),
        }

        match self.fetcher.probe(&candidate.candidate_url).await {
            Ok(probe) => {
                candidate.http_status = Some(probe.status);
                candidate.final_url = Some(probe.final_url.clone());
                candidate.content_type = probe.content_type.clone();
                let delta = if probe.is_success() && probe.is_html() {
                    HTML_BONUS
                } else if probe.is_success() {
                    -NON_HTML_PENALTY
                } else {
                    -FAILURE_PENALTY
                };
                candidate.score = round_score(candidate.score + delta);
            }
            Err(err) => {
                if err.is_dns_failure() {
                    if let Err(store_err) = self.domains.record_failure(&host, &err.to_string()).await {
                        warn!(host = %host, error = %store_err, "could not record dead domain");
                    }
                }
                debug!(url = %candidate.candidate_url, error = %err, "probe failed");
                candidate.score = round_score(candidate.score - FAILURE_PENALTY);
            }
        }
        candidate
    }

    pub async fn find_candidates(
        &self,
        entity_id: Uuid,
        ctx: &UrlContext,
    ) -> Result<CandidateReport, CandidateError> {
        let hits = self.gather(ctx).await?;
        let scored = hits
            .into_iter()
            .map(|hit| {
                let (score, matched_fields) = score_hit(ctx, &hit);
                UrlCandidate {
                    entity_id,
                    candidate_url: hit.url,
                    score: round_score(score),
                    matched_fields,
                    title: hit.title,
                    snippet: hit.snippet,
                    http_status: None,
                    final_url: None,
                    content_type: None,
                    auto_applied: false,
                }
            })
            .collect::<Vec<_>>();

        let mut candidates = stream::iter(scored)
            .map(|c| self.validate(c))
            .buffer_unordered(self.probe_concurrency)
            .collect::<Vec<_>>()
            .await;
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.candidate_url.cmp(&b.candidate_url))
        });

        Ok(CandidateReport {
            candidates,
            auto_apply_threshold: AUTO_APPLY_THRESHOLD,
        })
    }

    /// Persist candidates for one tournament, auto-applying a confident top hit.
    async fn store_candidates(
        &self,
        tournament: &Tournament,
        mut report: CandidateReport,
    ) -> Result<(usize, bool), StoreError> {
        let mut applied = false;
        if let Some(top) = report.candidates.first_mut() {
            if top.score >= report.auto_apply_threshold
                && self
                    .store
                    .set_official_url_if_empty(tournament.id, &top.candidate_url)
                    .await?
            {
                top.auto_applied = true;
                applied = true;
                info!(slug = %tournament.slug, url = %top.candidate_url, "official url auto-applied");
            }
        }
        for candidate in &report.candidates {
            self.store.upsert_url_candidate(candidate).await?;
        }
        Ok((report.candidates.len(), applied))
    }

    /// Discover URLs for tournaments still missing an official one. A provider
    /// outage aborts the batch; other per-tournament failures are counted.
    pub async fn discover_urls_batch(&self, limit: usize) -> Result<DiscoverySummary, CandidateError> {
        let tournaments = self.store.tournaments_missing_official_url(limit).await?;
        let mut summary = DiscoverySummary::default();

        for tournament in &tournaments {
            summary.processed += 1;
            let ctx = UrlContext::from_tournament(tournament);
            let report = match self.find_candidates(tournament.id, &ctx).await {
                Ok(report) => report,
                Err(CandidateError::ExternalProviderUnavailable(reason)) => {
                    warn!(reason = %reason, processed = summary.processed, "aborting url discovery");
                    return Err(CandidateError::ExternalProviderUnavailable(reason));
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(slug = %tournament.slug, error = %err, "url discovery failed");
                    continue;
                }
            };
            match self.store_candidates(tournament, report).await {
                Ok((stored, applied)) => {
                    summary.candidates_stored += stored;
                    summary.auto_applied += usize::from(applied);
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(slug = %tournament.slug, error = %err, "storing url candidates failed");
                }
            }
        }

        info!(
            processed = summary.processed,
            stored = summary.candidates_stored,
            auto_applied = summary.auto_applied,
            failed = summary.failed,
            "url discovery finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{DomainHealth, HostResolver};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tourney_core::{TournamentStatus, TournamentUpsert};
    use tourney_storage::{FetchError, FetchedResponse, MemoryStore, ProbeResponse};

    struct FakeSearch {
        responses: Mutex<Vec<Result<Vec<SearchHit>, SearchError>>>,
        queries: Mutex<Vec<String>>,
    }

    impl FakeSearch {
        fn new(responses: Vec<Result<Vec<SearchHit>, SearchError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SearchProvider for FakeSearch {
        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>, SearchError> {
            self.queries.lock().unwrap().push(query.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(Vec::new());
            }
            responses.remove(0)
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        probes: HashMap<String, Result<ProbeResponse, String>>,
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            Err(FetchError::Unreachable(format!("not used: {url}")))
        }

        async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError> {
            match self.probes.get(url) {
                Some(Ok(probe)) => Ok(probe.clone()),
                Some(Err(msg)) => Err(FetchError::Unreachable(msg.clone())),
                None => Err(FetchError::HttpStatus { status: 404, url: url.to_string() }),
            }
        }
    }

    struct NoDns;

    #[async_trait]
    impl HostResolver for NoDns {
        async fn resolve(&self, host: &str) -> Result<(), String> {
            Err(format!("dns lookup failed: {host}"))
        }
    }

    fn html(url: &str) -> Result<ProbeResponse, String> {
        Ok(ProbeResponse {
            status: 200,
            final_url: url.to_string(),
            content_type: Some("text/html; charset=utf-8".into()),
        })
    }

    fn hit(url: &str, title: &str, snippet: &str) -> SearchHit {
        SearchHit {
            url: url.into(),
            title: Some(title.into()),
            snippet: Some(snippet.into()),
        }
    }

    fn ctx() -> UrlContext {
        UrlContext {
            name: "Emerald City Classic".into(),
            state: "WA".into(),
            city: Some("Seattle".into()),
            sport: "soccer".into(),
            host_org: Some("Seattle United".into()),
        }
    }

    fn scorer(
        search: FakeSearch,
        fetcher: FakeFetcher,
        store: Arc<MemoryStore>,
    ) -> UrlCandidateScorer {
        scorer_over(Arc::new(search), fetcher, store)
    }

    fn scorer_over(
        search: Arc<dyn SearchProvider>,
        fetcher: FakeFetcher,
        store: Arc<MemoryStore>,
    ) -> UrlCandidateScorer {
        let domains = DomainHealth::new(store.clone(), Arc::new(NoDns), chrono::Duration::days(7), 2);
        UrlCandidateScorer::new(search, Arc::new(fetcher), store, domains, 5)
    }

    /// Accepts connections and never answers.
    async fn silent_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}/search")
    }

    /// An address nothing listens on.
    async fn refusing_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/search")
    }

    #[test]
    fn queries_are_deduped_and_capped() {
        let queries = build_queries(&ctx());
        assert_eq!(queries.len(), MAX_QUERIES);
        assert_eq!(queries[0], "\"Emerald City Classic\" Seattle Washington");
        assert_eq!(queries[1], "\"Emerald City Classic\" Seattle United");

        let bare = UrlContext { city: None, host_org: None, ..ctx() };
        let queries = build_queries(&bare);
        assert_eq!(queries.len(), 3);
        assert!(queries.iter().all(|q| !q.contains("  ")));
    }

    #[test]
    fn stop_words_do_not_inflate_name_overlap() {
        let ctx = ctx();
        let (generic, _) = score_hit(&ctx, &hit("https://cup.com", "The Classic Cup", ""));
        assert_eq!(generic, 0.0);

        let (strong, matched) = score_hit(
            &ctx,
            &hit(
                "https://emeraldcityclassic.com",
                "Emerald City Classic | Seattle United",
                "Youth soccer tournament in Seattle, Washington. Register your teams.",
            ),
        );
        assert!(strong >= 0.99, "{strong}");
        assert_eq!(matched, vec!["name", "host_org", "state", "city", "sport", "keyword"]);
    }

    #[test]
    fn lower_case_state_codes_are_not_state_matches() {
        let oregon = UrlContext { state: "OR".into(), city: None, host_org: None, ..ctx() };
        let (_, matched) = score_hit(&oregon, &hit("https://x.org", "Emerald or City", "soccer or futsal"));
        assert!(!matched.contains(&"state".to_string()));
        let (_, matched) = score_hit(&oregon, &hit("https://x.org", "Emerald City, OR", ""));
        assert!(matched.contains(&"state".to_string()));
    }

    #[tokio::test]
    async fn two_of_three_failing_queries_still_yield_candidates() {
        let store = Arc::new(MemoryStore::new());
        let search = FakeSearch::new(vec![
            Err(SearchError::Failed("rate limited".into())),
            Ok(vec![
                hit("http://www.emeraldcityclassic.com/?utm_source=x", "Emerald City Classic", "Seattle soccer"),
                hit("https://pdfs.org/flyer.pdf", "Emerald City Classic flyer", ""),
                hit("https://emeraldcityclassic.com/#register", "", "Register now"),
            ]),
            Err(SearchError::Failed("timeout".into())),
        ]);
        let mut fetcher = FakeFetcher::default();
        fetcher.probes.insert(
            "https://emeraldcityclassic.com/".into(),
            html("https://emeraldcityclassic.com/"),
        );
        fetcher.probes.insert(
            "https://pdfs.org/flyer.pdf".into(),
            Ok(ProbeResponse {
                status: 200,
                final_url: "https://pdfs.org/flyer.pdf".into(),
                content_type: Some("application/pdf".into()),
            }),
        );
        let scorer = scorer(search, fetcher, store);
        let three_queries = UrlContext { host_org: None, ..ctx() };
        assert_eq!(build_queries(&three_queries).len(), 3);

        let report = scorer.find_candidates(Uuid::new_v4(), &three_queries).await.unwrap();
        assert_eq!(report.auto_apply_threshold, AUTO_APPLY_THRESHOLD);
        assert_eq!(report.candidates.len(), 2);
        let top = &report.candidates[0];
        assert_eq!(top.candidate_url, "https://emeraldcityclassic.com/");
        assert_eq!(top.snippet.as_deref(), Some("Seattle soccer"));
        assert_eq!(top.http_status, Some(200));
        assert!(report.candidates[0].score > report.candidates[1].score);
    }

    #[tokio::test]
    async fn all_failing_queries_give_an_empty_list() {
        let store = Arc::new(MemoryStore::new());
        let failures = (0..4).map(|_| Err(SearchError::Failed("boom".into()))).collect();
        let scorer = scorer(FakeSearch::new(failures), FakeFetcher::default(), store);
        let report = scorer.find_candidates(Uuid::new_v4(), &ctx()).await.unwrap();
        assert!(report.candidates.is_empty());
    }

    #[tokio::test]
    async fn validation_adjusts_but_never_removes() {
        let store = Arc::new(MemoryStore::new());
        let search = FakeSearch::new(vec![Ok(vec![
            hit("https://live.org/", "Emerald City Classic", ""),
            hit("https://missing.org/", "Emerald City Classic", ""),
            hit("https://gone.org/", "Emerald City Classic", ""),
        ])]);
        let mut fetcher = FakeFetcher::default();
        fetcher.probes.insert("https://live.org/".into(), html("https://live.org/"));
        fetcher.probes.insert("https://gone.org/".into(), Err("dns lookup failed".into()));
        let scorer = scorer(search, fetcher, store.clone());

        let report = scorer.find_candidates(Uuid::new_v4(), &ctx()).await.unwrap();
        let by_url = |u: &str| report.candidates.iter().find(|c| c.candidate_url == u).unwrap().score;
        assert_eq!(report.candidates.len(), 3);
        assert!((by_url("https://live.org/") - by_url("https://missing.org/") - 0.2).abs() < 1e-9);
        assert_eq!(by_url("https://missing.org/"), by_url("https://gone.org/"));
        assert!(store.dead_domain("gone.org").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dead_domains_are_not_probed() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..2 {
            store
                .record_dns_failure("dead.org", "dns error", chrono::Utc::now())
                .await
                .unwrap();
        }
        let search = FakeSearch::new(vec![Ok(vec![hit("https://dead.org/", "Emerald City Classic", "")])]);
        let mut fetcher = FakeFetcher::default();
        fetcher.probes.insert("https://dead.org/".into(), html("https://dead.org/"));
        let scorer = scorer(search, fetcher, store);

        let report = scorer.find_candidates(Uuid::new_v4(), &ctx()).await.unwrap();
        assert_eq!(report.candidates[0].http_status, None);
    }

    async fn seed_tournament(store: &MemoryStore) -> Tournament {
        let outcome = store
            .upsert_tournament(TournamentUpsert {
                slug: "emerald-city-classic-seattle-wa".into(),
                name: "Emerald City Classic".into(),
                sport: "soccer".into(),
                state: Some("WA".into()),
                city: Some("Seattle".into()),
                venue: None,
                address: None,
                summary: None,
                start_date: None,
                end_date: None,
                source_url: "https://wasoccer.org/events".into(),
                confidence: 0.6,
                default_status: TournamentStatus::Draft,
                source: "wasoccer.org".into(),
                source_event_id: "ecc".into(),
            })
            .await
            .unwrap();
        store.tournament(outcome.id).await.unwrap().unwrap()
    }

    fn confident_hits() -> Vec<Result<Vec<SearchHit>, SearchError>> {
        vec![Ok(vec![hit(
            "https://emeraldcityclassic.com/",
            "Emerald City Classic",
            "Youth soccer tournament in Seattle, Washington",
        )])]
    }

    #[tokio::test]
    async fn batch_auto_applies_once_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let tournament = seed_tournament(&store).await;
        let mut fetcher = FakeFetcher::default();
        fetcher.probes.insert(
            "https://emeraldcityclassic.com/".into(),
            html("https://emeraldcityclassic.com/"),
        );
        let scorer = scorer(FakeSearch::new(confident_hits()), fetcher, store.clone());

        let summary = scorer.discover_urls_batch(10).await.unwrap();
        assert_eq!(
            summary,
            DiscoverySummary { processed: 1, candidates_stored: 1, auto_applied: 1, failed: 0 }
        );
        let row = store.tournament(tournament.id).await.unwrap().unwrap();
        assert_eq!(row.official_url.as_deref(), Some("https://emeraldcityclassic.com/"));
        let stored = store.url_candidates(tournament.id).await.unwrap();
        assert!(stored[0].auto_applied);

        let again = scorer.discover_urls_batch(10).await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn provider_outage_aborts_the_batch() {
        let store = Arc::new(MemoryStore::new());
        seed_tournament(&store).await;
        let search = FakeSearch::new(vec![Err(SearchError::Unavailable("no key".into()))]);
        let scorer = scorer(search, FakeFetcher::default(), store.clone());

        let err = scorer.discover_urls_batch(10).await.unwrap_err();
        assert!(matches!(err, CandidateError::ExternalProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn slow_search_response_fails_the_query_not_the_batch() {
        let tavily = TavilySearch::new(Some("key".into()), Duration::from_millis(300))
            .unwrap()
            .with_endpoint(silent_endpoint().await);
        let err = tavily.search("Emerald City Classic", 5).await.unwrap_err();
        assert!(matches!(err, SearchError::Failed(_)), "{err:?}");

        let store = Arc::new(MemoryStore::new());
        seed_tournament(&store).await;
        let scorer = scorer_over(Arc::new(tavily), FakeFetcher::default(), store);
        let summary = scorer.discover_urls_batch(10).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.candidates_stored, 0);
    }

    #[tokio::test]
    async fn refused_connection_is_reported_as_unreachable() {
        let tavily = TavilySearch::new(Some("key".into()), Duration::from_secs(2))
            .unwrap()
            .with_endpoint(refusing_endpoint().await);
        let err = tavily.search("Emerald City Classic", 5).await.unwrap_err();
        assert!(matches!(err, SearchError::Unreachable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn one_unreachable_query_is_skipped_but_all_unreachable_aborts() {
        let store = Arc::new(MemoryStore::new());
        let three_queries = UrlContext { host_org: None, ..ctx() };
        let search = FakeSearch::new(vec![
            Err(SearchError::Unreachable("connection refused".into())),
            Ok(vec![hit("https://emeraldcityclassic.com/", "Emerald City Classic", "")]),
            Ok(Vec::new()),
        ]);
        let report = scorer(search, FakeFetcher::default(), store.clone())
            .find_candidates(Uuid::new_v4(), &three_queries)
            .await
            .unwrap();
        assert_eq!(report.candidates.len(), 1);

        seed_tournament(&store).await;
        let down = (0..3)
            .map(|_| Err(SearchError::Unreachable("connection refused".into())))
            .collect();
        let err = scorer(FakeSearch::new(down), FakeFetcher::default(), store)
            .discover_urls_batch(10)
            .await
            .unwrap_err();
        assert!(matches!(err, CandidateError::ExternalProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn search_calls_wait_for_the_rate_limit() {
        let tavily = TavilySearch::new(Some("key".into()), Duration::from_millis(200))
            .unwrap()
            .with_endpoint(silent_endpoint().await)
            .with_rate_limit(RateLimiter::per_minute(1));
        assert!(tavily.is_rate_limited());
        assert!(tavily.search("first", 5).await.is_err());
        let second = tokio::time::timeout(Duration::from_secs(1), tavily.search("second", 5)).await;
        assert!(second.is_err(), "second query should still be waiting for its slot");
    }

    #[tokio::test]
    async fn validated_html_never_scores_below_the_text_score_and_failures_score_below_it() {
        let store = Arc::new(MemoryStore::new());
        let (title, snippet) = ("Emerald City Classic", "Seattle soccer");
        let urls = [
            "https://html.org/",
            "https://pdf.org/",
            "https://missing.org/",
            "https://gone.org/",
        ];
        let search = FakeSearch::new(vec![Ok(urls.iter().map(|u| hit(u, title, snippet)).collect())]);
        let mut fetcher = FakeFetcher::default();
        fetcher.probes.insert("https://html.org/".into(), html("https://html.org/"));
        fetcher.probes.insert(
            "https://pdf.org/".into(),
            Ok(ProbeResponse {
                status: 200,
                final_url: "https://pdf.org/".into(),
                content_type: Some("application/pdf".into()),
            }),
        );
        fetcher.probes.insert("https://gone.org/".into(), Err("connection reset".into()));
        let report = scorer(search, fetcher, store)
            .find_candidates(Uuid::new_v4(), &ctx())
            .await
            .unwrap();
        let score = |u: &str| report.candidates.iter().find(|c| c.candidate_url == u).unwrap().score;

        // Hosts differ only in tokens the context never mentions, so the text scores match.
        let baselines = urls
            .iter()
            .map(|u| round_score(score_hit(&ctx(), &hit(u, title, snippet)).0))
            .collect::<Vec<_>>();
        assert!(baselines.windows(2).all(|w| w[0] == w[1]));
        let baseline = baselines[0];
        assert!(baseline > FAILURE_PENALTY);

        assert!(score("https://html.org/") >= baseline);
        assert!(score("https://pdf.org/") < baseline);
        assert!(score("https://missing.org/") < baseline);
        assert!(score("https://gone.org/") < baseline);
    }

    #[tokio::test]
    async fn missing_api_key_is_unavailable() {
        let tavily = TavilySearch::new(None, Duration::from_secs(1)).unwrap();
        let err = tavily.search("anything", 5).await.unwrap_err();
        assert!(matches!(err, SearchError::Unavailable(_)));
    }
}
