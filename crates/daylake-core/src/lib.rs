//! Core domain model for daylake: date units, partition layout and change detection.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "daylake-core";

/// Placeholder substituted with the `DD-MM-YYYY` date in request URL templates.
pub const URL_DATE_PLACEHOLDER: &str = "{}";
pub const URL_DATE_FORMAT: &str = "%d-%m-%Y";

pub const STAGED_FILE_NAME: &str = "file.json";
pub const CONVERTED_FILE_NAME: &str = "file.parquet";

/// Dates whose new or changed payload was staged, mapped to the staged file path.
/// Unchanged and failed dates are absent.
pub type BatchResult = BTreeMap<NaiveDate, PathBuf>;

/// One calendar day under ingestion, with its fully resolved request URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateUnit {
    pub date: NaiveDate,
    pub source_url: String,
}

impl DateUnit {
    pub fn new(date: NaiveDate, url_template: &str) -> Self {
        Self {
            date,
            source_url: format_request_url(url_template, date),
        }
    }
}

pub fn format_request_url(template: &str, date: NaiveDate) -> String {
    let formatted = date.format(URL_DATE_FORMAT).to_string();
    template.replacen(URL_DATE_PLACEHOLDER, &formatted, 1)
}

pub fn template_has_single_placeholder(template: &str) -> bool {
    template.matches(URL_DATE_PLACEHOLDER).count() == 1
}

/// Every calendar date in `[start, end]`, ascending. Empty when `start > end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|day| *day <= end).collect()
}

pub fn expand_date_units(url_template: &str, start: NaiveDate, end: NaiveDate) -> Vec<DateUnit> {
    date_range(start, end)
        .into_iter()
        .map(|date| DateUnit::new(date, url_template))
        .collect()
}

/// Resolves "the last `days` days" to an inclusive range ending yesterday.
///
/// Returns `None` for `days == 0` or when the range underflows the calendar.
pub fn resolve_last_n_days(today: NaiveDate, days: u32) -> Option<(NaiveDate, NaiveDate)> {
    if days == 0 {
        return None;
    }
    let end = today.checked_sub_days(Days::new(1))?;
    let start = end.checked_sub_days(Days::new(u64::from(days - 1)))?;
    Some((start, end))
}

/// `{base}/year={Y}/month={M}/day={D}` with unpadded decimal components.
pub fn date_partition_dir(base: &Path, date: NaiveDate) -> PathBuf {
    base.join(format!("year={}", date.year()))
        .join(format!("month={}", date.month()))
        .join(format!("day={}", date.day()))
}

/// Hex SHA-256 digest of a payload's canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted metadata row: at most one per date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub date: NaiveDate,
    pub hash: ContentFingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// No record exists for the date yet.
    New,
    /// A record exists with a different fingerprint.
    Changed,
    Unchanged,
}

impl ChangeKind {
    pub fn requires_staging(self) -> bool {
        !matches!(self, ChangeKind::Unchanged)
    }
}

pub fn detect_change(
    stored: Option<&ContentFingerprint>,
    fresh: &ContentFingerprint,
) -> ChangeKind {
    match stored {
        None => ChangeKind::New,
        Some(existing) if existing == fresh => ChangeKind::Unchanged,
        Some(_) => ChangeKind::Changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn request_url_uses_zero_padded_day_month_year() {
        let url = format_request_url("https://api.example.test/history?date={}", ymd(2024, 3, 5));
        assert_eq!(url, "https://api.example.test/history?date=05-03-2024");
    }

    #[test]
    fn placeholder_check_requires_exactly_one() {
        assert!(template_has_single_placeholder("https://x.test/?d={}"));
        assert!(!template_has_single_placeholder("https://x.test/"));
        assert!(!template_has_single_placeholder("https://x.test/{}/{}"));
    }

    #[test]
    fn date_range_is_inclusive_and_crosses_month_boundaries() {
        let days = date_range(ymd(2024, 2, 28), ymd(2024, 3, 2));
        assert_eq!(
            days,
            vec![ymd(2024, 2, 28), ymd(2024, 2, 29), ymd(2024, 3, 1), ymd(2024, 3, 2)]
        );
        assert_eq!(date_range(ymd(2024, 1, 1), ymd(2024, 1, 1)), vec![ymd(2024, 1, 1)]);
        assert!(date_range(ymd(2024, 1, 2), ymd(2024, 1, 1)).is_empty());
    }

    #[test]
    fn expanded_units_carry_formatted_urls() {
        let units = expand_date_units("u?date={}", ymd(2023, 12, 31), ymd(2024, 1, 1));
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].source_url, "u?date=31-12-2023");
        assert_eq!(units[1].source_url, "u?date=01-01-2024");
    }

    #[test]
    fn last_n_days_ends_yesterday() {
        let today = ymd(2024, 3, 10);
        assert_eq!(resolve_last_n_days(today, 1), Some((ymd(2024, 3, 9), ymd(2024, 3, 9))));
        assert_eq!(resolve_last_n_days(today, 7), Some((ymd(2024, 3, 3), ymd(2024, 3, 9))));
        assert_eq!(resolve_last_n_days(today, 0), None);
    }

    #[test]
    fn partition_dir_components_are_unpadded() {
        let dir = date_partition_dir(Path::new("/data/raw"), ymd(2024, 3, 5));
        assert_eq!(dir, PathBuf::from("/data/raw/year=2024/month=3/day=5"));
    }

    #[test]
    fn change_detection_policy() {
        let a = ContentFingerprint::from_hex("aa");
        let b = ContentFingerprint::from_hex("bb");
        assert_eq!(detect_change(None, &a), ChangeKind::New);
        assert_eq!(detect_change(Some(&a), &a), ChangeKind::Unchanged);
        assert_eq!(detect_change(Some(&a), &b), ChangeKind::Changed);
        assert!(ChangeKind::New.requires_staging());
        assert!(ChangeKind::Changed.requires_staging());
        assert!(!ChangeKind::Unchanged.requires_staging());
    }
}
