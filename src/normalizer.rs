//! Raw page text to canonical metric records.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use crate::models::{
    ExportBatch, MetricRecord, MetricValue, OrgTarget, RawObservation, Section, TimeWindow, ValueKind,
};

/// Card metrics that display counts rather than shares.
const ABSOLUTE_CARD_METRICS: &[&str] = &[
    "total publications",
    "total preprints",
    "total articles",
    "publications",
];

const GROUPING_CHARS: &[char] = &[',', ' ', '\u{a0}', '\u{202f}', '\''];
const CURRENCY_CHARS: &[char] = &['£', '$', '€', '¥'];

/// Kind a metric would have if its value parses.
pub fn classify(section: Section, metric_name: &str) -> ValueKind {
    match section {
        Section::Explore => ValueKind::Absolute,
        Section::Insights | Section::Actions => {
            let name = metric_name.trim().to_lowercase();
            if ABSOLUTE_CARD_METRICS.contains(&name.as_str()) {
                ValueKind::Absolute
            } else {
                ValueKind::Percentage
            }
        }
    }
}

/// Numeric reading of `raw` for `kind`, or `None` when it does not parse or
/// falls outside the range valid for that kind.
pub fn parse_number(raw: &str, kind: ValueKind) -> Option<f64> {
    let mut text = raw.trim();
    match kind {
        ValueKind::Percentage => text = text.strip_suffix('%').unwrap_or(text).trim_end(),
        ValueKind::Absolute => text = text.trim_start_matches(CURRENCY_CHARS).trim_start(),
        ValueKind::Unparsed => return None,
    }

    let cleaned: String = text.chars().filter(|c| !GROUPING_CHARS.contains(c)).collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = cleaned.parse::<f64>().ok().filter(|v| v.is_finite())?;

    let in_range = match kind {
        ValueKind::Percentage => (0.0..=100.0).contains(&value),
        _ => value >= 0.0,
    };
    in_range.then_some(value)
}

/// Start and end dates of `window` as seen on `collected`; all-time has no start.
pub fn resolve_window(window: TimeWindow, collected: NaiveDate) -> (Option<NaiveDate>, NaiveDate) {
    let current = collected.year();
    let bounds = match window {
        TimeWindow::AllTime => None,
        TimeWindow::LastTwoYears => year_start(current - 1).zip(year_end(current)),
        TimeWindow::Year(year) => year_start(year).zip(year_end(year)),
    };
    match bounds {
        Some((start, end)) => (Some(start), end),
        None => (None, collected),
    }
}

fn year_start(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
}

fn year_end(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 12, 31)
}

pub fn normalize(
    observation: RawObservation,
    target: &OrgTarget,
    source_url: &str,
    collected_at: DateTime<Utc>,
) -> MetricRecord {
    let kind = classify(target.section, &observation.label);
    let (metric_value, value_kind) = match parse_number(&observation.raw_value, kind) {
        Some(number) => (MetricValue::Number(number), kind),
        None => (MetricValue::Text(observation.raw_value), ValueKind::Unparsed),
    };
    let (time_window_start, time_window_end) =
        resolve_window(observation.time_window, collected_at.date_naive());

    MetricRecord {
        organisation: target.organisation.clone(),
        environment: target.environment,
        section: target.section,
        time_window: observation.time_window,
        time_window_start,
        time_window_end,
        metric_name: observation.label,
        metric_value,
        value_kind,
        source_url: source_url.to_string(),
        collected_at,
    }
}

/// Normalizes a whole visit, preserving extraction order.
pub fn normalize_batch(
    observations: Vec<RawObservation>,
    target: &OrgTarget,
    source_url: &str,
    collected_at: DateTime<Utc>,
) -> ExportBatch {
    let records = observations
        .into_iter()
        .map(|obs| normalize(obs, target, source_url, collected_at))
        .collect();
    ExportBatch::new(target, records)
}
