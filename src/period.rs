//! Parsing and normalizing granularities and period keys, and computing the
//! date ranges and enumerations the collector and scheduler need.
//!
//! A `period_key` is the canonical textual bucket identifier for a
//! granularity: `yyyyMMdd` for day, `yyyyMM` for month, `yyyyQn` for
//! quarter, `yyyy` for year.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

/// One of the four supported time-bucket resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Normalize an arbitrary caller-supplied `dateType`, defaulting to
    /// `day` exactly as the original frontend contract does (`others` also
    /// collapses to `day`).
    pub fn normalize(date_type: Option<&str>) -> Granularity {
        let key = date_type.unwrap_or("").trim().to_lowercase();
        if key.starts_with("quarter") {
            return Granularity::Quarter;
        }
        match key.as_str() {
            "month" => Granularity::Month,
            "year" => Granularity::Year,
            _ => Granularity::Day,
        }
    }
}

static DASHED_DAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static DASHED_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}$").unwrap());
static QUARTER_COMPACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d{4})Q(\d)$").unwrap());
static QUARTER_DASHED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d{4})-Q(\d)$").unwrap());

/// Parse a caller-supplied `timest` into a concrete calendar date under the
/// given granularity. Falls back to today (UTC) when the input is empty or
/// unrecognized, matching the original's permissive parser.
pub fn parse_timest(granularity: Granularity, timest: &str) -> NaiveDate {
    let raw = timest.trim();
    if raw.is_empty() {
        return chrono::Utc::now().date_naive();
    }

    match granularity {
        Granularity::Day => {
            if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
                    return d;
                }
            }
            if DASHED_DAY.is_match(raw) {
                if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
                    return d;
                }
            }
        }
        Granularity::Month => {
            if raw.len() == 6 && raw.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(d) = NaiveDate::parse_from_str(&format!("{raw}01"), "%Y%m%d") {
                    return d;
                }
            }
            if DASHED_MONTH.is_match(raw) {
                if let Ok(d) = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d") {
                    return d;
                }
            }
        }
        Granularity::Quarter => {
            if let Some(c) = QUARTER_COMPACT.captures(raw).or_else(|| QUARTER_DASHED.captures(raw))
            {
                let year: i32 = c[1].parse().unwrap_or(1970);
                let q: u32 = c[2].parse().unwrap_or(1);
                let month = (q.clamp(1, 4) - 1) * 3 + 1;
                if let Some(d) = NaiveDate::from_ymd_opt(year, month, 1) {
                    return d;
                }
            }
        }
        Granularity::Year => {
            if raw.len() == 4 && raw.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(year) = raw.parse::<i32>() {
                    if let Some(d) = NaiveDate::from_ymd_opt(year, 1, 1) {
                        return d;
                    }
                }
            }
        }
    }

    // Fallback: try bare yyyyMMdd regardless of granularity, then give up to "now".
    if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
            return d;
        }
    }
    chrono::Utc::now().date_naive()
}

fn quarter_of(month: u32) -> u32 {
    (month - 1) / 3 + 1
}

/// Render a date as a canonical `period_key` for the given granularity.
pub fn period_key(granularity: Granularity, date: NaiveDate) -> String {
    match granularity {
        Granularity::Day => date.format("%Y%m%d").to_string(),
        Granularity::Month => date.format("%Y%m").to_string(),
        Granularity::Quarter => format!("{}Q{}", date.year(), quarter_of(date.month())),
        Granularity::Year => date.format("%Y").to_string(),
    }
}

/// Convert a single `timest` straight to its `period_key`.
pub fn timest_to_period_key(granularity: Granularity, timest: &str) -> String {
    period_key(granularity, parse_timest(granularity, timest))
}

/// Format a date per-granularity the way the upstream collect API expects
/// (`day`=`yyyy-MM-dd`, `month`=`yyyy-MM`, `quarter`=`yyyy-Qn`, `year`=`yyyy`).
pub fn format_for_collect_api(granularity: Granularity, value: &str) -> String {
    let dt = parse_timest(granularity, value);
    match granularity {
        Granularity::Day => dt.format("%Y-%m-%d").to_string(),
        Granularity::Month => dt.format("%Y-%m").to_string(),
        Granularity::Quarter => format!("{}-Q{}", dt.year(), quarter_of(dt.month())),
        Granularity::Year => dt.format("%Y").to_string(),
    }
}

/// The real start/end calendar dates (`yyyy-MM-dd`) covered by a period,
/// used for the `starRange`/`endRange` fields the collect API requires.
pub fn period_to_date_range(granularity: Granularity, timest: &str) -> (String, String) {
    let dt = parse_timest(granularity, timest);
    let (start, end) = match granularity {
        Granularity::Day => (dt, dt),
        Granularity::Month => {
            let start = dt.with_day(1).unwrap();
            let end = last_day_of_month(dt.year(), dt.month());
            (start, end)
        }
        Granularity::Quarter => {
            let q = quarter_of(dt.month());
            let start_month = (q - 1) * 3 + 1;
            let start = NaiveDate::from_ymd_opt(dt.year(), start_month, 1).unwrap();
            let end = last_day_of_month(dt.year(), start_month + 2);
            (start, end)
        }
        Granularity::Year => (
            NaiveDate::from_ymd_opt(dt.year(), 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(dt.year(), 12, 31).unwrap(),
        ),
    };
    (start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string())
}

/// Format an industry-trend range's start/end for the collect API, per
/// granularity (`day`=`yyyy-MM-dd`, `month`=`yyyy-MM`, `quarter`=`yyyy-Qn`,
/// `year`=`yyyy`). Accepts raw inputs in period_key form or already-dashed
/// form.
pub fn format_trend_range(granularity: Granularity, raw_start: &str, raw_end: &str) -> (String, String) {
    let start = format_for_collect_api(granularity, raw_start);
    let end = format_for_collect_api(granularity, raw_end);
    (start, end)
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
}

/// Enumerate every `period_key` a `[start_date, end_date]` range touches at
/// the given granularity, inclusive on both ends. Start/end are swapped if
/// given reversed.
pub fn period_keys_in_range(granularity: Granularity, start_date: &str, end_date: &str) -> Vec<String> {
    let parse_d = |s: &str| -> NaiveDate {
        let raw = s.trim();
        let raw8 = raw.get(0..10).unwrap_or(raw);
        if DASHED_DAY.is_match(raw8) {
            NaiveDate::parse_from_str(raw8, "%Y-%m-%d").unwrap_or_else(|_| chrono::Utc::now().date_naive())
        } else if raw8.len() == 8 && raw8.chars().all(|c| c.is_ascii_digit()) {
            NaiveDate::parse_from_str(raw8, "%Y%m%d").unwrap_or_else(|_| chrono::Utc::now().date_naive())
        } else {
            chrono::Utc::now().date_naive()
        }
    };

    let (mut start, mut end) = (parse_d(start_date), parse_d(end_date));
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }

    let mut keys = Vec::new();
    match granularity {
        Granularity::Day => {
            let mut d = start;
            while d <= end {
                keys.push(d.format("%Y%m%d").to_string());
                d = d.succ_opt().unwrap();
            }
        }
        Granularity::Month => {
            let (mut y, mut m) = (start.year(), start.month());
            let (ey, em) = (end.year(), end.month());
            while (y, m) <= (ey, em) {
                keys.push(format!("{y}{m:02}"));
                if m == 12 {
                    y += 1;
                    m = 1;
                } else {
                    m += 1;
                }
            }
        }
        Granularity::Quarter => {
            let (mut y, mut q) = (start.year(), quarter_of(start.month()));
            let (ey, eq) = (end.year(), quarter_of(end.month()));
            while (y, q) <= (ey, eq) {
                keys.push(format!("{y}Q{q}"));
                if q == 4 {
                    y += 1;
                    q = 1;
                } else {
                    q += 1;
                }
            }
        }
        Granularity::Year => {
            let mut y = start.year();
            while y <= end.year() {
                keys.push(y.to_string());
                y += 1;
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_day() {
        assert_eq!(parse_timest(Granularity::Day, "20250115"), NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn parses_dashed_quarter() {
        assert_eq!(parse_timest(Granularity::Quarter, "2025-Q2"), NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
    }

    #[test]
    fn quarter_period_key_roundtrip() {
        let dt = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();
        assert_eq!(period_key(Granularity::Quarter, dt), "2025Q4");
    }

    #[test]
    fn month_date_range_covers_whole_month() {
        let (s, e) = period_to_date_range(Granularity::Month, "202502");
        assert_eq!((s.as_str(), e.as_str()), ("2025-02-01", "2025-02-28"));
    }

    #[test]
    fn day_keys_in_range_enumerates_inclusive() {
        let keys = period_keys_in_range(Granularity::Day, "2025-01-01", "2025-01-03");
        assert_eq!(keys, vec!["20250101", "20250102", "20250103"]);
    }

    #[test]
    fn quarter_keys_in_range_spans_year_boundary() {
        let keys = period_keys_in_range(Granularity::Quarter, "2024-11-01", "2025-02-01");
        assert_eq!(keys, vec!["2024Q4", "2025Q1"]);
    }

    #[test]
    fn granularity_normalizes_others_to_day() {
        assert_eq!(Granularity::normalize(Some("others")), Granularity::Day);
        assert_eq!(Granularity::normalize(Some("QUARTERLY_FOR_YEAR")), Granularity::Quarter);
    }
}
