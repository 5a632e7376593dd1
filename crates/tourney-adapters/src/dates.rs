//! Free-text event date parsing with month/year heading context.
//!
//! A day outside 1..=31 or an impossible calendar date rejects the whole
//! range; nothing is clamped.

use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

const MONTH: &str = r"(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)\.?";
const DAY: &str = r"(\d{1,2})(?:st|nd|rd|th)?";

static WEEKDAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:mon|tue|tues|wed|thu|thur|thurs|fri|sat|sun)(?:day|sday|nesday|rsday|urday)?\b\.?,?")
        .expect("weekday pattern")
});
static ISO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})(?:\s*-\s*(\d{4})-(\d{1,2})-(\d{1,2}))?$")
        .expect("iso pattern")
});
static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2}|\d{4})(?:\s*-\s*(\d{1,2})/(\d{1,2})/(\d{2}|\d{4}))?$")
        .expect("numeric pattern")
});
static CROSS_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^{MONTH}\s+{DAY}(?:,?\s*(\d{{4}}))?\s*-\s*{MONTH}\s+{DAY}(?:,?\s*(\d{{4}}))?$"
    ))
    .expect("cross-month pattern")
});
static SAME_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{MONTH}\s+{DAY}\s*-\s*{DAY}(?:,?\s*(\d{{4}}))?$"))
        .expect("same-month pattern")
});
static SINGLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{MONTH}\s+{DAY}(?:,?\s*(\d{{4}}))?$")).expect("single-day pattern")
});
static DAY_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\s*-\s*(\d{1,2})$").expect("day-range pattern"));
static DAY_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})$").expect("day pattern"));
static HEADING_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\b{MONTH}\s+(\d{{4}})\b")).expect("heading pattern")
});
static HEADING_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").expect("year pattern"));

/// Month/year in effect for cells that only carry day numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateContext {
    pub month: Option<u32>,
    pub year: Option<i32>,
}

impl DateContext {
    pub fn new(month: u32, year: i32) -> Self {
        Self {
            month: Some(month),
            year: Some(year),
        }
    }

    /// Update from a heading or separator row; returns true when it carried a date.
    pub fn absorb_heading(&mut self, text: &str) -> bool {
        let text = text.to_lowercase();
        if let Some(caps) = HEADING_MONTH.captures(&text) {
            let month = month_number(&caps[1]);
            let year = caps[2].parse::<i32>().ok();
            if month.is_some() && year.is_some() {
                self.month = month;
                self.year = year;
                return true;
            }
        }
        if let Some(caps) = HEADING_YEAR.captures(&text) {
            if let Ok(year) = caps[1].parse::<i32>() {
                self.year = Some(year);
                self.month = None;
                return true;
            }
        }
        false
    }
}

fn month_number(name: &str) -> Option<u32> {
    let prefix = name.trim_end_matches('.').get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn day(text: &str) -> Option<u32> {
    text.parse::<u32>().ok().filter(|d| (1..=31).contains(d))
}

fn year(text: &str) -> Option<i32> {
    let value = text.parse::<i32>().ok()?;
    Some(if text.len() == 2 { 2000 + value } else { value })
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn ordered(start: NaiveDate, end: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    (end >= start).then_some((start, end))
}

fn normalize(text: &str) -> String {
    let lowered = text
        .to_lowercase()
        .replace(['\u{2013}', '\u{2014}'], "-")
        .replace(" to ", " - ")
        .replace(" thru ", " - ")
        .replace(" through ", " - ");
    let stripped = WEEKDAY.replace_all(&lowered, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a date cell into an inclusive `(start, end)` pair.
pub fn parse_date_range(text: &str, ctx: DateContext) -> Option<(NaiveDate, NaiveDate)> {
    let text = normalize(text);
    if text.is_empty() {
        return None;
    }

    if let Some(c) = ISO.captures(&text) {
        let start = ymd(year(&c[1])?, c[2].parse().ok()?, day(&c[3])?)?;
        let end = match (c.get(4), c.get(5), c.get(6)) {
            (Some(y), Some(m), Some(d)) => {
                ymd(year(y.as_str())?, m.as_str().parse().ok()?, day(d.as_str())?)?
            }
            _ => start,
        };
        return ordered(start, end);
    }

    if let Some(c) = NUMERIC.captures(&text) {
        let start = ymd(year(&c[3])?, c[1].parse().ok()?, day(&c[2])?)?;
        let end = match (c.get(4), c.get(5), c.get(6)) {
            (Some(m), Some(d), Some(y)) => {
                ymd(year(y.as_str())?, m.as_str().parse().ok()?, day(d.as_str())?)?
            }
            _ => start,
        };
        return ordered(start, end);
    }

    if let Some(c) = CROSS_MONTH.captures(&text) {
        let (m1, d1) = (month_number(&c[1])?, day(&c[2])?);
        let (m2, d2) = (month_number(&c[4])?, day(&c[5])?);
        let y1 = c.get(3).and_then(|y| year(y.as_str()));
        let y2 = c.get(6).and_then(|y| year(y.as_str()));
        let (y1, y2) = match (y1, y2, ctx.year) {
            (Some(a), Some(b), _) => (a, b),
            (Some(a), None, _) => (a, if m2 < m1 { a + 1 } else { a }),
            (None, Some(b), _) => (if m1 > m2 { b - 1 } else { b }, b),
            (None, None, Some(a)) => (a, if m2 < m1 { a + 1 } else { a }),
            (None, None, None) => return None,
        };
        return ordered(ymd(y1, m1, d1)?, ymd(y2, m2, d2)?);
    }

    if let Some(c) = SAME_MONTH.captures(&text) {
        let month = month_number(&c[1])?;
        let (d1, d2) = (day(&c[2])?, day(&c[3])?);
        let year = c.get(4).and_then(|y| year(y.as_str())).or(ctx.year)?;
        return ordered(ymd(year, month, d1)?, ymd(year, month, d2)?);
    }

    if let Some(c) = SINGLE.captures(&text) {
        let month = month_number(&c[1])?;
        let d = day(&c[2])?;
        let year = c.get(3).and_then(|y| year(y.as_str())).or(ctx.year)?;
        let date = ymd(year, month, d)?;
        return Some((date, date));
    }

    if let Some(c) = DAY_RANGE.captures(&text) {
        let (d1, d2) = (day(&c[1])?, day(&c[2])?);
        let (year, month) = (ctx.year?, ctx.month?);
        let start = ymd(year, month, d1)?;
        let end = if d2 >= d1 {
            ymd(year, month, d2)?
        } else {
            let (ny, nm) = next_month(year, month);
            ymd(ny, nm, d2)?
        };
        return ordered(start, end);
    }

    if let Some(c) = DAY_ONLY.captures(&text) {
        let d = day(&c[1])?;
        let date = ymd(ctx.year?, ctx.month?, d)?;
        return Some((date, date));
    }

    None
}

/// Parse the `datetime` attribute of a `<time>` element.
pub fn parse_datetime_attr(value: &str) -> Option<NaiveDate> {
    let head = value.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Context derived from a known date, for cells on the same calendar page.
pub fn context_of(date: NaiveDate) -> DateContext {
    DateContext::new(date.month(), date.year())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn heading_plus_day_range_resolves() {
        let mut ctx = DateContext::default();
        assert!(ctx.absorb_heading("December 2025"));
        assert_eq!(parse_date_range("12-14", ctx), Some((d(2025, 12, 12), d(2025, 12, 14))));
    }

    #[test]
    fn out_of_range_day_is_rejected_not_clamped() {
        let ctx = DateContext::new(12, 2025);
        assert_eq!(parse_date_range("35", ctx), None);
        assert_eq!(parse_date_range("30-35", ctx), None);
        assert_eq!(parse_date_range("Feb 30, 2025", ctx), None);
    }

    #[test]
    fn month_name_forms() {
        let ctx = DateContext { month: None, year: Some(2025) };
        assert_eq!(parse_date_range("Dec 12-14", ctx), Some((d(2025, 12, 12), d(2025, 12, 14))));
        assert_eq!(
            parse_date_range("Sat, Dec 13th", ctx),
            Some((d(2025, 12, 13), d(2025, 12, 13)))
        );
        assert_eq!(
            parse_date_range("March 7 \u{2013} 9, 2026", DateContext::default()),
            Some((d(2026, 3, 7), d(2026, 3, 9)))
        );
    }

    #[test]
    fn cross_month_range_rolls_the_year() {
        let ctx = DateContext::new(12, 2025);
        assert_eq!(
            parse_date_range("Dec 30 - Jan 2", ctx),
            Some((d(2025, 12, 30), d(2026, 1, 2)))
        );
        assert_eq!(
            parse_date_range("Dec 30 - Jan 2, 2026", DateContext::default()),
            Some((d(2025, 12, 30), d(2026, 1, 2)))
        );
    }

    #[test]
    fn numeric_and_iso_forms() {
        let none = DateContext::default();
        assert_eq!(parse_date_range("12/12/2025", none), Some((d(2025, 12, 12), d(2025, 12, 12))));
        assert_eq!(
            parse_date_range("2025-12-12 to 2025-12-14", none),
            Some((d(2025, 12, 12), d(2025, 12, 14)))
        );
        assert_eq!(parse_date_range("2025-12-14 - 2025-12-12", none), None);
    }

    #[test]
    fn missing_context_yields_no_dates() {
        assert_eq!(parse_date_range("12-14", DateContext::default()), None);
        assert_eq!(parse_date_range("TBD", DateContext::new(1, 2026)), None);
    }

    #[test]
    fn year_only_heading_sets_year() {
        let mut ctx = DateContext::new(5, 2024);
        assert!(ctx.absorb_heading("2026 Tournament Schedule"));
        assert_eq!(ctx, DateContext { month: None, year: Some(2026) });
        assert!(!ctx.absorb_heading("Mayors Cup"));
    }

    #[test]
    fn datetime_attribute_parses_date_prefix() {
        assert_eq!(parse_datetime_attr("2025-12-12T09:00:00-08:00"), Some(d(2025, 12, 12)));
        assert_eq!(parse_datetime_attr("soon"), None);
    }
}
