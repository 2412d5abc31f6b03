//! One run: every configured organisation of one (environment, section),
//! visited and exported in order, each isolated from the others' failures.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ScrapeError;
use crate::exporter::{ExportOutcome, Exporter, FailureKind};
use crate::extractors;
use crate::models::{Environment, ExportBatch, OrgTarget, Section};
use crate::normalizer::normalize_batch;
use crate::session::{PageSession, SessionFactory, Wait};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgStatus {
    Exported { records: usize, attempts: u32 },
    ScrapeFailed { reason: String },
    ExportFailed { records: usize, kind: FailureKind, reason: String },
}

#[derive(Debug, Clone)]
pub struct OrgOutcome {
    pub organisation: String,
    pub url: String,
    pub status: OrgStatus,
}

impl OrgOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OrgStatus::Exported { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub environment: Environment,
    pub section: Section,
    pub outcomes: Vec<OrgOutcome>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(OrgOutcome::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &OrgOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn exported_records(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o.status {
                OrgStatus::Exported { records, .. } => records,
                _ => 0,
            })
            .sum()
    }
}

pub async fn run(
    config: &Config,
    environment: Environment,
    section: Section,
    browser: &dyn SessionFactory,
    exporter: &mut Exporter,
) -> Result<RunSummary> {
    let Some(section_target) = config.section_target(environment, section) else {
        bail!("no targets configured for {}/{}", environment, section);
    };
    let targets = config.org_targets(environment, section)?;
    if targets.is_empty() {
        warn!("No URLs configured for {}/{}", environment, section);
    }

    let mut outcomes = Vec::with_capacity(targets.len());
    for (idx, target) in targets.iter().enumerate() {
        info!("[{}/{}] Scraping: {}", idx + 1, targets.len(), target.url);

        let status = match visit(browser, config, target).await {
            Ok(batch) => {
                let records = batch.len();
                match exporter.append(batch, &section_target.sheet).await {
                    ExportOutcome::Success { attempts } => {
                        info!("Exported {} records for {}", records, target.organisation);
                        OrgStatus::Exported { records, attempts }
                    }
                    ExportOutcome::Failed { kind, reason, .. } => {
                        error!(
                            "Export failed for {} ({}/{}): {:?}: {}",
                            target.organisation, environment, section, kind, reason
                        );
                        OrgStatus::ExportFailed { records, kind, reason }
                    }
                }
            }
            Err(e) => {
                error!(
                    "Failed to scrape {} ({}/{}): {}",
                    target.organisation, environment, section, e
                );
                OrgStatus::ScrapeFailed { reason: e.to_string() }
            }
        };

        outcomes.push(OrgOutcome {
            organisation: target.organisation.clone(),
            url: target.url.clone(),
            status,
        });
    }

    Ok(RunSummary {
        environment,
        section,
        outcomes,
    })
}

/// Opens a fresh session for `target` and always closes it, whatever the scrape did.
async fn visit(browser: &dyn SessionFactory, config: &Config, target: &OrgTarget) -> Result<ExportBatch, ScrapeError> {
    let mut session = browser.new_session().await?;
    let result = scrape(session.as_mut(), config, target).await;
    session.close().await;
    result
}

async fn scrape(session: &mut dyn PageSession, config: &Config, target: &OrgTarget) -> Result<ExportBatch, ScrapeError> {
    session.open(&target.url).await?;
    session.wait_fixed(Wait::PageLoad).await;

    let collected_at = Utc::now();
    let observations = extractors::extract(
        session,
        config.selectors.for_section(target.section),
        &config.explore,
        collected_at.date_naive(),
    )
    .await?;

    Ok(normalize_batch(observations, target, session.current_url(), collected_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::exporter::testing::ScriptedSheet;
    use crate::exporter::RetryPolicy;
    use crate::models::{TimeWindow, ValueKind};
    use crate::session::testing::{FakeBrowser, FakePage};
    use std::time::Duration;

    const HHMI: &str = "https://dev.oa.report/HHMI";
    const GATES: &str = "https://dev.oa.report/gates-foundation?orgkey=abc";

    fn insights_page(value: &str) -> String {
        format!(
            "<button id='all_time_button'>All time</button><button id='two_years_button'>2024-25</button>\
             <article class='insight'><h3>With Open Code</h3><span class='value'>{value}</span></article>\
             <article class='insight'><h3>Total publications</h3><span class='value'>1,204</span></article>"
        )
    }

    fn browser() -> FakeBrowser {
        FakeBrowser::default().with_page(
            HHMI,
            FakePage::new(insights_page("0%"))
                .on_click("#all_time_button", insights_page("42%"))
                .on_click("#two_years_button", insights_page("N/A")),
        )
    }

    #[tokio::test]
    async fn test_failed_organisation_does_not_stop_the_run() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let browser = browser();
        let mut exporter = Exporter::new(dir.path().to_path_buf(), None, RetryPolicy::new(Duration::ZERO));

        let summary = run(&config, Environment::Dev, Section::Insights, &browser, &mut exporter)
            .await
            .unwrap();

        assert!(!summary.is_success());
        assert_eq!(summary.outcomes.len(), 2);
        assert_eq!(summary.outcomes[0].organisation, "gates-foundation");
        assert!(matches!(summary.outcomes[0].status, OrgStatus::ScrapeFailed { .. }));
        assert_eq!(
            summary.outcomes[1].status,
            OrgStatus::Exported { records: 4, attempts: 0 }
        );
        assert_eq!(summary.failures().count(), 1);
        assert_eq!(summary.exported_records(), 4);

        let events = browser.events();
        assert_eq!(events.iter().filter(|e| *e == "close").count(), 2);
    }

    #[tokio::test]
    async fn test_session_closed_when_extraction_fails_after_open() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let no_cards = "<button id='all_time_button'>All time</button>\
                        <button id='two_years_button'>2024-25</button><p>Loading...</p>";
        let browser = browser().with_page(GATES, FakePage::new(no_cards));
        let mut exporter = Exporter::new(dir.path().to_path_buf(), None, RetryPolicy::new(Duration::ZERO));

        let summary = run(&config, Environment::Dev, Section::Insights, &browser, &mut exporter)
            .await
            .unwrap();

        match &summary.outcomes[0].status {
            OrgStatus::ScrapeFailed { reason } => assert!(reason.contains("article.insight")),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(summary.outcomes[1].is_success());

        let events = browser.events();
        assert_eq!(events.iter().filter(|e| *e == "close").count(), 2);
        let first_visit: Vec<_> = events.iter().take_while(|e| !e.starts_with(&format!("open {HHMI}"))).collect();
        assert_eq!(first_visit.first().map(|e| e.as_str()), Some(format!("open {GATES}").as_str()));
        assert_eq!(first_visit.last().map(|e| e.as_str()), Some("close"));
        assert!(first_visit.iter().any(|e| *e == "read"));
    }

    #[tokio::test]
    async fn test_insights_records_cover_exactly_two_windows() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let target = config.org_targets(Environment::Dev, Section::Insights).unwrap()[1].clone();
        let browser = browser();

        let batch = visit(&browser, &config, &target).await.unwrap();

        let windows: Vec<_> = batch.records.iter().map(|r| r.time_window).collect();
        assert_eq!(
            windows,
            vec![
                TimeWindow::AllTime,
                TimeWindow::AllTime,
                TimeWindow::LastTwoYears,
                TimeWindow::LastTwoYears,
            ]
        );
        let open_code = &batch.records[0];
        assert_eq!(open_code.metric_name, "With Open Code");
        assert_eq!(open_code.value_kind, ValueKind::Percentage);
        assert_eq!(open_code.metric_value.as_number(), Some(42.0));
        assert_eq!(batch.records[1].value_kind, ValueKind::Absolute);
        assert_eq!(batch.records[2].value_kind, ValueKind::Unparsed);
        assert!(batch.records.iter().all(|r| r.source_url == HHMI));
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_failure_is_reported_per_organisation() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let browser = browser();
        let sheet = ScriptedSheet::new(vec![Err(crate::error::AppendError::Auth("401".into()))]);
        let mut exporter = Exporter::new(
            dir.path().to_path_buf(),
            Some(Box::new(sheet)),
            RetryPolicy::new(Duration::from_secs(10)),
        );

        let summary = run(&config, Environment::Dev, Section::Insights, &browser, &mut exporter)
            .await
            .unwrap();

        assert!(matches!(
            summary.outcomes[1].status,
            OrgStatus::ExportFailed { records: 4, kind: FailureKind::Auth, .. }
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_section_is_an_error() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = Exporter::new(dir.path().to_path_buf(), None, RetryPolicy::new(Duration::ZERO));
        let result = run(&config, Environment::Staging, Section::Explore, &browser(), &mut exporter).await;
        assert!(result.is_err());
    }
}
