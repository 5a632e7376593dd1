use std::collections::BTreeMap;

use scraper::{ElementRef, Html};
use tourney_core::{CandidateEventRecord, SourceType};

use crate::dates::{parse_date_range, DateContext};
use crate::{accept_all, element_text, selector, split_location, AdapterError, ExtractScope, SiteExtractor};

/// Tables of events with a header row, optionally grouped under
/// month/year headings or full-width separator rows.
#[derive(Debug, Clone)]
pub struct TableListingExtractor {
    scope: ExtractScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Date,
    City,
    State,
    Location,
    Venue,
    Other,
}

fn classify_header(text: &str) -> Column {
    let t = text.to_lowercase();
    if t.contains("website") || t.contains("link") {
        Column::Other
    } else if t.contains("date") || t.contains("when") {
        Column::Date
    } else if t.contains("state") {
        Column::State
    } else if t.contains("city") || t.contains("town") {
        Column::City
    } else if t.contains("location") || t.contains("where") {
        Column::Location
    } else if t.contains("venue") || t.contains("field") || t.contains("facility") || t.contains("site") {
        Column::Venue
    } else if t.contains("tournament") || t.contains("event") || t.contains("name") || t.contains("title") {
        Column::Name
    } else {
        Column::Other
    }
}

#[derive(Debug, Clone)]
struct Header {
    labels: Vec<String>,
    columns: Vec<Column>,
}

impl Header {
    fn from_labels(labels: Vec<String>) -> Self {
        let columns = labels.iter().map(|l| classify_header(l)).collect();
        Self { labels, columns }
    }

    /// Headerless tables are read as name, date, location.
    fn positional(width: usize) -> Self {
        let labels = ["name", "date", "location", "venue"]
            .iter()
            .map(|s| s.to_string())
            .chain((4..width).map(|i| format!("col{i}")))
            .take(width.max(1))
            .collect();
        Self::from_labels(labels)
    }
}

/// Header rows are tracked per table element.
fn set_header<K: PartialEq>(headers: &mut Vec<(K, Header)>, table: K, header: Header) {
    headers.retain(|(k, _)| *k != table);
    headers.push((table, header));
}

fn header_for<K: PartialEq + Copy>(headers: &mut Vec<(K, Header)>, table: K, width: usize) -> Header {
    if let Some((_, header)) = headers.iter().find(|(k, _)| *k == table) {
        return header.clone();
    }
    let header = Header::positional(width);
    headers.push((table, header.clone()));
    header
}

impl TableListingExtractor {
    pub fn new(scope: ExtractScope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &ExtractScope {
        &self.scope
    }

    /// Rows in document order, with headings before and inside tables
    /// updating the date context.
    pub(crate) fn raw_records(
        document: &Html,
        source_url: &str,
        initial: DateContext,
    ) -> Result<Vec<CandidateEventRecord>, AdapterError> {
        let walk = selector("h1, h2, h3, h4, h5, caption, tr")?;
        let cell_sel = selector("th, td")?;

        let mut ctx = initial;
        let mut headers = Vec::new();
        let mut records = Vec::new();

        for el in document.select(&walk) {
            let tag = el.value().name();
            if tag != "tr" {
                ctx.absorb_heading(&element_text(&el));
                continue;
            }

            let Some(table) = el
                .ancestors()
                .filter_map(ElementRef::wrap)
                .find(|a| a.value().name() == "table")
            else {
                continue;
            };

            let cells = el
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|c| cell_sel.matches(c))
                .collect::<Vec<_>>();
            if cells.is_empty() {
                continue;
            }

            let texts = cells.iter().map(element_text).collect::<Vec<_>>();
            let in_thead = el
                .ancestors()
                .filter_map(ElementRef::wrap)
                .any(|a| a.value().name() == "thead");
            let all_th = cells.iter().all(|c| c.value().name() == "th");

            if (in_thead || all_th) && cells.len() > 1 {
                set_header(&mut headers, table.id(), Header::from_labels(texts));
                continue;
            }

            let spans_row = cells.len() == 1
                && cells[0]
                    .value()
                    .attr("colspan")
                    .and_then(|v| v.parse::<u32>().ok())
                    .is_some_and(|n| n > 1);
            if cells.len() == 1 || spans_row {
                ctx.absorb_heading(&texts[0]);
                continue;
            }

            let header = header_for(&mut headers, table.id(), texts.len());
            records.push(row_to_record(&header, &texts, source_url, ctx));
        }

        Ok(records)
    }
}

fn row_to_record(
    header: &Header,
    texts: &[String],
    source_url: &str,
    ctx: DateContext,
) -> CandidateEventRecord {
    let mut record = CandidateEventRecord {
        source_url: source_url.to_string(),
        ..Default::default()
    };
    let mut raw_fields = BTreeMap::new();

    for (idx, text) in texts.iter().enumerate() {
        let label = header
            .labels
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("col{idx}"));
        raw_fields.insert(label, text.clone());
        if text.is_empty() {
            continue;
        }

        match header.columns.get(idx).copied().unwrap_or(Column::Other) {
            Column::Name if record.name.is_empty() => record.name = text.clone(),
            Column::Date if record.date_text.is_none() => record.date_text = Some(text.clone()),
            Column::City => record.city = Some(text.clone()),
            Column::State => record.state = Some(text.clone()),
            Column::Venue => record.venue = Some(text.clone()),
            Column::Location => {
                let (city, state) = split_location(text);
                record.city = record.city.take().or(city);
                record.state = record.state.take().or(state);
            }
            _ => {}
        }
    }

    if let Some((start, end)) = record
        .date_text
        .as_deref()
        .and_then(|t| parse_date_range(t, ctx))
    {
        record.start_date = Some(start);
        record.end_date = Some(end);
    }
    record.raw_fields = raw_fields;
    record
}

impl SiteExtractor for TableListingExtractor {
    fn source_type(&self) -> SourceType {
        SourceType::TableListing
    }

    fn extract(
        &self,
        html: &str,
        source_url: &str,
    ) -> Result<Vec<CandidateEventRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let records = Self::raw_records(&document, source_url, DateContext::default())?;
        Ok(accept_all(&self.scope, records, source_url))
    }
}
