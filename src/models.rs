use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment of the dashboard being scraped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Staging,
    Dev,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Staging => "staging",
            Environment::Dev => "dev",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report section of an organisation page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Insights,
    Explore,
    Actions,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Insights => "insights",
            Section::Explore => "explore",
            Section::Actions => "actions",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reporting period selected in the page UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    AllTime,
    LastTwoYears,
    Year(i32),
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::AllTime => f.write_str("ALL_TIME"),
            TimeWindow::LastTwoYears => f.write_str("LAST_TWO_YEARS_INCLUDING_CURRENT"),
            TimeWindow::Year(year) => write!(f, "YEAR_{}", year),
        }
    }
}

/// One label/value pair as displayed on the page, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObservation {
    pub label: String,
    pub raw_value: String,
    pub time_window: TimeWindow,
}

impl RawObservation {
    pub fn new(label: impl Into<String>, raw_value: impl Into<String>, time_window: TimeWindow) -> Self {
        Self {
            label: label.into(),
            raw_value: raw_value.into(),
            time_window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Percentage,
    Absolute,
    Unparsed,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Percentage => "PERCENTAGE",
            ValueKind::Absolute => "ABSOLUTE",
            ValueKind::Unparsed => "UNPARSED",
        })
    }
}

/// Parsed number, or the verbatim page text when it did not parse.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{}", n),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

/// A page the pipeline visits: one organisation in one section of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgTarget {
    pub environment: Environment,
    pub section: Section,
    pub organisation: String,
    pub url: String,
}

/// Canonical, persisted form of one metric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub organisation: String,
    pub environment: Environment,
    pub section: Section,
    pub time_window: TimeWindow,
    /// `None` means the window has no lower bound (all time).
    pub time_window_start: Option<NaiveDate>,
    pub time_window_end: NaiveDate,
    pub metric_name: String,
    pub metric_value: MetricValue,
    pub value_kind: ValueKind,
    pub source_url: String,
    pub collected_at: DateTime<Utc>,
}

impl MetricRecord {
    /// Column header shared by the local artifact and the remote worksheet.
    pub const HEADER: [&'static str; 10] = [
        "organisation",
        "environment",
        "section",
        "time_window_start",
        "time_window_end",
        "metric_name",
        "metric_value",
        "value_kind",
        "source_url",
        "collected_at",
    ];

    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.organisation.clone(),
            self.environment.to_string(),
            self.section.to_string(),
            self.time_window_start
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            self.time_window_end.format("%Y-%m-%d").to_string(),
            self.metric_name.clone(),
            self.metric_value.to_string(),
            self.value_kind.to_string(),
            self.source_url.clone(),
            self.collected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        ]
    }
}

/// Records from one (organisation, environment, section) visit, exported as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportBatch {
    pub organisation: String,
    pub environment: Environment,
    pub section: Section,
    pub records: Vec<MetricRecord>,
}

impl ExportBatch {
    pub fn new(target: &OrgTarget, records: Vec<MetricRecord>) -> Self {
        Self {
            organisation: target.organisation.clone(),
            environment: target.environment,
            section: target.section,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn rows(&self) -> Vec<Vec<String>> {
        self.records.iter().map(MetricRecord::to_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_window_labels() {
        assert_eq!(TimeWindow::AllTime.to_string(), "ALL_TIME");
        assert_eq!(TimeWindow::LastTwoYears.to_string(), "LAST_TWO_YEARS_INCLUDING_CURRENT");
        assert_eq!(TimeWindow::Year(2023).to_string(), "YEAR_2023");
    }

    #[test]
    fn test_row_matches_header_order() {
        let record = MetricRecord {
            organisation: "hhmi".to_string(),
            environment: Environment::Dev,
            section: Section::Insights,
            time_window: TimeWindow::AllTime,
            time_window_start: None,
            time_window_end: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            metric_name: "With Open Code".to_string(),
            metric_value: MetricValue::Number(42.0),
            value_kind: ValueKind::Percentage,
            source_url: "https://dev.oa.report/hhmi".to_string(),
            collected_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
        };

        let row = record.to_row();
        assert_eq!(row.len(), MetricRecord::HEADER.len());
        assert_eq!(
            row,
            vec![
                "hhmi",
                "dev",
                "insights",
                "",
                "2025-03-01",
                "With Open Code",
                "42",
                "PERCENTAGE",
                "https://dev.oa.report/hhmi",
                "2025-03-01T09:30:00Z",
            ]
        );
    }
}
