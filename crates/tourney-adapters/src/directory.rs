use scraper::Html;
use tourney_core::states::state_code;
use tourney_core::url::join;
use tourney_core::{CandidateEventRecord, SourceType};
use tracing::debug;

use crate::dates::DateContext;
use crate::table::TableListingExtractor;
use crate::{
    accept_all, element_text, first_heading, selector, state_in_text, AdapterError, ExtractScope,
    SiteExtractor,
};

/// National index that links out to one listing page per state. Discovery
/// and extraction are separate passes: the index yields state-page URLs,
/// each state page is then fetched and read with the table contract.
#[derive(Debug, Clone)]
pub struct StateDirectoryExtractor {
    scope: ExtractScope,
}

/// State named by the last path segment, e.g. `/states/wa` or `/new-york.html`.
fn state_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    let stem = segment.split('.').next().unwrap_or(segment);
    let words = stem.replace(['-', '_', '+'], " ");
    state_code(&words)
}

impl StateDirectoryExtractor {
    pub fn new(scope: ExtractScope) -> Self {
        Self { scope }
    }

    fn page_state(document: &Html, source_url: &str) -> Result<Option<&'static str>, AdapterError> {
        let heading = first_heading(document, &selector("h1")?);
        Ok(heading
            .as_deref()
            .and_then(state_in_text)
            .or_else(|| state_from_url(source_url)))
    }
}

impl SiteExtractor for StateDirectoryExtractor {
    fn source_type(&self) -> SourceType {
        SourceType::StateDirectory
    }

    fn extract(
        &self,
        html: &str,
        source_url: &str,
    ) -> Result<Vec<CandidateEventRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let mut scope = self.scope.clone();
        if let Some(code) = Self::page_state(&document, source_url)? {
            if !scope.contains(code) {
                debug!(source_url, state = code, "state page outside scope");
                return Ok(Vec::new());
            }
            scope = scope.with_default_state(Some(code));
        }
        let records = TableListingExtractor::raw_records(&document, source_url, DateContext::default())?;
        Ok(accept_all(&scope, records, source_url))
    }

    fn discover(&self, html: &str, index_url: &str) -> Result<Vec<String>, AdapterError> {
        let document = Html::parse_document(html);
        let links = selector("a[href]")?;
        let mut urls: Vec<String> = Vec::new();

        for link in document.select(&links) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let text = element_text(&link);
            let Some(code) = state_code(&text).or_else(|| state_from_url(href)) else {
                continue;
            };
            if !self.scope.contains(code) {
                continue;
            }
            let Ok(target) = join(index_url, href) else {
                continue;
            };
            if !urls.contains(&target.canonical) {
                urls.push(target.canonical);
            }
        }
        Ok(urls)
    }
}
