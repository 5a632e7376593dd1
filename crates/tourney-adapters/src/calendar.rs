use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use tourney_core::{CandidateEventRecord, SourceType};

use crate::dates::{context_of, parse_date_range, parse_datetime_attr, DateContext};
use crate::{
    accept_all, element_text, first_heading, first_text, selector, split_location, AdapterError,
    ExtractScope, SiteExtractor,
};

const CARD: &str = ".event, .event-item, .calendar-event, [itemtype$='/Event'], [itemtype$='/SportsEvent']";

/// A single venue's event calendar: repeated event cards, usually grouped
/// under month headings. The venue and its location are the defaults.
#[derive(Debug, Clone)]
pub struct VenueCalendarExtractor {
    scope: ExtractScope,
}

struct CardSelectors {
    card: Selector,
    title: Selector,
    time: Selector,
    date: Selector,
    venue: Selector,
    location: Selector,
    locality: Selector,
    region: Selector,
}

impl CardSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            card: selector(CARD)?,
            title: selector(".event-title, .title, [itemprop='name'], h2, h3, h4, a")?,
            time: selector("time[datetime], [itemprop='startDate'][content], [itemprop='endDate'][content]")?,
            date: selector(".event-date, .date, .when, time")?,
            venue: selector(".event-venue, .venue, [itemprop='location'] [itemprop='name']")?,
            location: selector(".event-location, .location, .where")?,
            locality: selector("[itemprop='addressLocality']")?,
            region: selector("[itemprop='addressRegion']")?,
        })
    }
}

impl VenueCalendarExtractor {
    pub fn new(scope: ExtractScope) -> Self {
        Self { scope }
    }

    fn card_record(
        sel: &CardSelectors,
        card: &ElementRef<'_>,
        source_url: &str,
        ctx: DateContext,
        venue_default: Option<&str>,
    ) -> CandidateEventRecord {
        let mut raw_fields = BTreeMap::new();
        let name = first_text(card, &sel.title).unwrap_or_default();
        let date_text = first_text(card, &sel.date);

        let stamps = card
            .select(&sel.time)
            .filter_map(|t| t.value().attr("datetime").or_else(|| t.value().attr("content")))
            .filter_map(parse_datetime_attr)
            .collect::<Vec<_>>();

        let (start_date, end_date) = match (stamps.first(), stamps.last()) {
            (Some(start), Some(end)) if end >= start => (Some(*start), Some(*end)),
            _ => match date_text.as_deref().and_then(|t| parse_date_range(t, ctx)) {
                Some((s, e)) => (Some(s), Some(e)),
                None => (None, None),
            },
        };

        let (mut city, mut state) = first_text(card, &sel.location)
            .map(|t| split_location(&t))
            .unwrap_or_default();
        if let Some(locality) = first_text(card, &sel.locality) {
            city = Some(locality);
        }
        if let Some(region) = first_text(card, &sel.region) {
            state = Some(region);
        }

        let venue = first_text(card, &sel.venue).or_else(|| venue_default.map(str::to_string));

        raw_fields.insert("name".to_string(), name.clone());
        if let Some(text) = &date_text {
            raw_fields.insert("date".to_string(), text.clone());
        }
        if let Some(v) = &venue {
            raw_fields.insert("venue".to_string(), v.clone());
        }

        CandidateEventRecord {
            name,
            date_text: date_text.or_else(|| {
                start_date.map(|s| s.format("%Y-%m-%d").to_string())
            }),
            start_date,
            end_date,
            city,
            state,
            venue,
            source_url: source_url.to_string(),
            raw_fields,
        }
    }
}

fn inside_card(el: &ElementRef<'_>, card: &Selector) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| card.matches(&a))
}

impl SiteExtractor for VenueCalendarExtractor {
    fn source_type(&self) -> SourceType {
        SourceType::VenueCalendar
    }

    fn extract(
        &self,
        html: &str,
        source_url: &str,
    ) -> Result<Vec<CandidateEventRecord>, AdapterError> {
        let document = Html::parse_document(html);
        let sel = CardSelectors::new()?;
        let walk = selector(&format!("h1, h2, h3, h4, caption, {CARD}"))?;
        let page_title = selector("h1")?;
        let venue_default = first_heading(&document, &page_title);

        let mut ctx = DateContext::default();
        let mut records = Vec::new();
        for el in document.select(&walk) {
            if sel.card.matches(&el) {
                // Nested cards are reported once, by the outermost match.
                if inside_card(&el, &sel.card) {
                    continue;
                }
                let record = Self::card_record(&sel, &el, source_url, ctx, venue_default.as_deref());
                if let Some(start) = record.start_date {
                    if ctx.year.is_none() {
                        ctx = DateContext { month: None, ..context_of(start) };
                    }
                }
                records.push(record);
            } else if !inside_card(&el, &sel.card) {
                ctx.absorb_heading(&element_text(&el));
            }
        }

        Ok(accept_all(&self.scope, records, source_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const CALENDAR: &str = r#"
        <html><body>
          <h1>Starfire Sports Complex</h1>
          <h2>December 2025</h2>
          <div class="event">
            <h3 class="event-title">Winter Cup</h3>
            <time datetime="2025-12-12">Dec 12</time> - <time datetime="2025-12-14">Dec 14</time>
          </div>
          <div class="event">
            <h3 class="event-title">Holiday Futsal Fest</h3>
            <span class="event-date">27-28</span>
          </div>
          <div class="event">
            <h3 class="event-title">Away Game Day</h3>
            <span class="event-date">Dec 20</span>
            <span class="event-location">Boise, ID</span>
          </div>
          <div class="event"><span class="event-date">Dec 31</span></div>
        </body></html>
    "#;

    fn scope() -> ExtractScope {
        ExtractScope::states(["WA"])
            .with_default_state(Some("WA"))
            .with_default_city(Some("Tukwila"))
    }

    #[test]
    fn cards_default_to_the_venue_and_its_location() {
        let records = VenueCalendarExtractor::new(scope())
            .extract(CALENDAR, "https://starfiresports.com/events")
            .unwrap();
        let names = records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Winter Cup", "Holiday Futsal Fest"]);

        let winter = &records[0];
        assert_eq!(winter.start_date, NaiveDate::from_ymd_opt(2025, 12, 12));
        assert_eq!(winter.end_date, NaiveDate::from_ymd_opt(2025, 12, 14));
        assert_eq!(winter.venue.as_deref(), Some("Starfire Sports Complex"));
        assert_eq!(winter.city.as_deref(), Some("Tukwila"));
        assert_eq!(winter.state.as_deref(), Some("WA"));
    }

    #[test]
    fn day_ranges_use_the_month_heading() {
        let records = VenueCalendarExtractor::new(scope())
            .extract(CALENDAR, "https://starfiresports.com/events")
            .unwrap();
        let futsal = records.iter().find(|r| r.name == "Holiday Futsal Fest").unwrap();
        assert_eq!(futsal.start_date, NaiveDate::from_ymd_opt(2025, 12, 27));
        assert_eq!(futsal.end_date, NaiveDate::from_ymd_opt(2025, 12, 28));
    }

    #[test]
    fn microdata_cards_are_read() {
        let html = r#"<ul>
            <li itemscope itemtype="https://schema.org/SportsEvent">
              <span itemprop="name">Spring Kickoff</span>
              <meta itemprop="startDate" content="2026-03-07">
              <span itemprop="addressLocality">Redmond</span>
              <span itemprop="addressRegion">WA</span>
            </li>
        </ul>"#;
        let records = VenueCalendarExtractor::new(ExtractScope::states(["WA"]))
            .extract(html, "https://example.com/cal")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].city.as_deref(), Some("Redmond"));
        assert_eq!(records[0].start_date, NaiveDate::from_ymd_opt(2026, 3, 7));
        assert_eq!(records[0].date_text.as_deref(), Some("2026-03-07"));
    }
}
