use std::path::PathBuf;

use chrono::NaiveDate;
use tourney_adapters::{extractor_for, ExtractScope};
use tourney_core::SourceType;

fn fixture(rel: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

#[test]
fn table_listing_fixture_extracts_in_scope_rows() {
    let scope = ExtractScope::states(["WA"]).with_default_state(Some("WA"));
    let extractor = extractor_for(SourceType::TableListing, scope);
    let records = extractor
        .extract(&fixture("table-listing/wa-youth-soccer.html"), "https://wayouthsoccer.org/tournaments")
        .expect("extract");

    let names = records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "Harvest Cup",
            "Thanksgiving Shootout",
            "Winter Cup",
            "New Year's Classic",
            "Date To Be Announced",
        ]
    );

    let by_name = |name: &str| records.iter().find(|r| r.name == name).expect(name);
    assert_eq!(by_name("Harvest Cup").start_date, date(2025, 11, 8));
    assert_eq!(by_name("Harvest Cup").venue.as_deref(), Some("Chesterley Park"));
    assert_eq!(by_name("Thanksgiving Shootout").end_date, date(2025, 11, 30));
    assert_eq!(by_name("Winter Cup").start_date, date(2025, 12, 12));
    assert_eq!(by_name("New Year's Classic").start_date, date(2025, 12, 30));
    assert_eq!(by_name("New Year's Classic").end_date, date(2026, 1, 2));

    let tba = by_name("Date To Be Announced");
    assert_eq!(tba.date_text.as_deref(), Some("TBA"));
    assert_eq!(tba.start_date, None);
    assert!(records.iter().all(|r| r.state.as_deref() == Some("WA")));
}

#[test]
fn venue_calendar_fixture_uses_time_elements_and_headings() {
    let scope = ExtractScope::states(["WA"])
        .with_default_state(Some("WA"))
        .with_default_city(Some("Tukwila"));
    let extractor = extractor_for(SourceType::VenueCalendar, scope);
    let records = extractor
        .extract(&fixture("venue-calendar/starfire.html"), "https://starfiresports.com/events")
        .expect("extract");

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].name, "MLK Weekend Invitational");
    assert_eq!(records[0].start_date, date(2026, 1, 17));
    assert_eq!(records[0].end_date, date(2026, 1, 19));
    assert_eq!(records[0].venue.as_deref(), Some("Starfire Stadium Fields 1-4"));
    assert_eq!(records[1].start_date, date(2026, 1, 24));
    assert_eq!(records[1].venue.as_deref(), Some("Starfire Sports Complex"));
    assert_eq!(records[2].start_date, date(2026, 2, 14));
    assert_eq!(records[2].end_date, date(2026, 2, 16));
    assert!(records.iter().all(|r| r.city.as_deref() == Some("Tukwila")));
}

#[test]
fn state_directory_fixture_discovers_then_extracts() {
    let extractor = extractor_for(
        SourceType::StateDirectory,
        ExtractScope::states(["WA", "OR", "ID"]),
    );
    let urls = extractor
        .discover(&fixture("state-directory/index.html"), "https://tournaments.example.org/")
        .expect("discover");
    assert_eq!(
        urls,
        vec![
            "https://tournaments.example.org/tournaments/washington",
            "https://tournaments.example.org/tournaments/oregon",
            "https://tournaments.example.org/tournaments/idaho/",
        ]
    );

    let records = extractor
        .extract(&fixture("state-directory/oregon.html"), &urls[1])
        .expect("extract");
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.state.as_deref() == Some("OR")));
    assert_eq!(records[0].venue.as_deref(), Some("Wallace Marine Park"));
    assert_eq!(records[0].start_date, date(2026, 3, 21));
    assert_eq!(records[1].end_date, date(2026, 3, 29));
}
