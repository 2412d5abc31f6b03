//! Batch delivery: durable local artifact first, then the remote sheet with
//! bounded retry on quota failures.
//!
//! Delivery is at-least-once: an attempt that lands rows but still reports a
//! quota error is retried, so the sheet may receive the batch twice.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::SheetTarget;
use crate::csv_writer::CsvExporter;
use crate::error::AppendError;
use crate::excel_writer::ExcelExporter;
use crate::models::{ExportBatch, MetricRecord};
use crate::sheets::SheetsClient;

/// Total remote attempts per batch, the first one included.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Sending,
    RateLimited,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Auth,
    MalformedPayload,
    Network,
    LocalWrite,
}

impl From<&AppendError> for FailureKind {
    fn from(e: &AppendError) -> Self {
        match e {
            AppendError::RateLimited(_) => FailureKind::RateLimited,
            AppendError::Auth(_) => FailureKind::Auth,
            AppendError::MalformedPayload(_) => FailureKind::MalformedPayload,
            AppendError::Network(_) => FailureKind::Network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Success { attempts: u32 },
    Failed { kind: FailureKind, attempts: u32, reason: String },
}

/// Remote delivery state of one batch.
#[derive(Debug)]
pub struct Delivery {
    state: BatchState,
    attempts: u32,
    max_attempts: u32,
}

impl Delivery {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: BatchState::Pending,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn begin_attempt(&mut self) {
        debug_assert!(matches!(self.state, BatchState::Pending | BatchState::RateLimited));
        self.state = BatchState::Sending;
        self.attempts += 1;
    }

    fn succeed(&mut self) {
        self.state = BatchState::Success;
    }

    /// Records a quota failure; returns whether another attempt is allowed.
    fn rate_limited(&mut self) -> bool {
        if self.attempts < self.max_attempts {
            self.state = BatchState::RateLimited;
            true
        } else {
            self.state = BatchState::Failed;
            false
        }
    }

    fn fail(&mut self) {
        self.state = BatchState::Failed;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            delay,
        }
    }
}

/// One remote attempt: header if the sheet is empty, then the rows.
async fn attempt(client: &dyn SheetsClient, target: &SheetTarget, rows: &[Vec<String>]) -> Result<(), AppendError> {
    if client.is_empty(target).await? {
        let header = vec![MetricRecord::HEADER.iter().map(|h| h.to_string()).collect::<Vec<_>>()];
        client.append_rows(target, &header).await?;
    }
    client.append_rows(target, rows).await
}

/// Sends `rows` until success, a non-quota failure, or the attempt budget runs out.
pub async fn send_with_retry(
    client: &dyn SheetsClient,
    target: &SheetTarget,
    rows: &[Vec<String>],
    policy: RetryPolicy,
) -> ExportOutcome {
    let mut delivery = Delivery::new(policy.max_attempts);

    loop {
        delivery.begin_attempt();
        match attempt(client, target, rows).await {
            Ok(()) => {
                delivery.succeed();
                info!(
                    "Uploaded {} rows to {}/{}",
                    rows.len(),
                    target.spreadsheet_id,
                    target.worksheet
                );
                return ExportOutcome::Success {
                    attempts: delivery.attempts(),
                };
            }
            Err(e) if e.is_rate_limited() => {
                if delivery.rate_limited() {
                    warn!(
                        "Quota hit, retrying in {:?} ({}/{})",
                        policy.delay,
                        delivery.attempts(),
                        policy.max_attempts
                    );
                    tokio::time::sleep(policy.delay).await;
                } else {
                    error!("Failed after {} attempts: {}", delivery.attempts(), e);
                    return ExportOutcome::Failed {
                        kind: FailureKind::RateLimited,
                        attempts: delivery.attempts(),
                        reason: e.to_string(),
                    };
                }
            }
            Err(e) => {
                delivery.fail();
                error!("Append to {} failed: {}", target.worksheet, e);
                return ExportOutcome::Failed {
                    kind: FailureKind::from(&e),
                    attempts: delivery.attempts(),
                    reason: e.to_string(),
                };
            }
        }
        debug!("Batch state {:?} after attempt {}", delivery.state(), delivery.attempts());
    }
}

pub struct Exporter {
    output_dir: PathBuf,
    remote: Option<Box<dyn SheetsClient>>,
    retry: RetryPolicy,
    workbook: Option<(ExcelExporter, PathBuf)>,
}

impl Exporter {
    /// `remote: None` keeps delivery local.
    pub fn new(output_dir: PathBuf, remote: Option<Box<dyn SheetsClient>>, retry: RetryPolicy) -> Self {
        Self {
            output_dir,
            remote,
            retry,
            workbook: None,
        }
    }

    pub fn with_workbook(mut self, path: PathBuf) -> Result<Self> {
        self.workbook = Some((ExcelExporter::new()?, path));
        Ok(self)
    }

    /// Writes the local artifact, then appends remotely. The local write never
    /// depends on the remote outcome.
    pub async fn append(&mut self, batch: ExportBatch, target: &SheetTarget) -> ExportOutcome {
        let local = self.write_local(&batch);

        if let Some((workbook, _)) = self.workbook.as_mut() {
            if let Err(e) = workbook.write_batch(&batch) {
                warn!("Could not add {} rows to workbook: {:#}", batch.len(), e);
            }
        }

        let remote = match &self.remote {
            Some(_) if batch.is_empty() => {
                warn!("Nothing to upload for {}", batch.organisation);
                ExportOutcome::Success { attempts: 0 }
            }
            Some(client) => send_with_retry(client.as_ref(), target, &batch.rows(), self.retry).await,
            None => ExportOutcome::Success { attempts: 0 },
        };

        match (local, remote) {
            (_, failed @ ExportOutcome::Failed { .. }) => failed,
            (Err(e), ExportOutcome::Success { attempts }) => ExportOutcome::Failed {
                kind: FailureKind::LocalWrite,
                attempts,
                reason: format!("{e:#}"),
            },
            (Ok(()), success) => success,
        }
    }

    fn write_local(&self, batch: &ExportBatch) -> Result<()> {
        let mut csv = CsvExporter::open(&self.output_dir, batch.section, batch.environment)?;
        csv.write_batch(batch)?;
        info!("Wrote {} rows to {}", batch.len(), csv.path().display());
        csv.finalize()
    }

    /// Saves the run workbook, if one was requested.
    pub fn finish(self) -> Result<()> {
        if let Some((workbook, path)) = self.workbook {
            let rows = workbook.rows_written();
            workbook.save(&path)?;
            info!("Workbook with {} rows saved to {}", rows, path.display());
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedSheet;
    use super::*;
    use crate::csv_writer::artifact_path;
    use crate::models::{Environment, MetricValue, Section, TimeWindow, ValueKind};
    use chrono::{NaiveDate, Utc};

    fn target() -> SheetTarget {
        SheetTarget {
            spreadsheet_id: "sheet".to_string(),
            worksheet: "insights".to_string(),
        }
    }

    fn quota() -> AppendError {
        AppendError::RateLimited("Quota exceeded".to_string())
    }

    fn batch(names: &[&str]) -> ExportBatch {
        let records = names
            .iter()
            .map(|name| MetricRecord {
                organisation: "hhmi".to_string(),
                environment: Environment::Dev,
                section: Section::Insights,
                time_window: TimeWindow::AllTime,
                time_window_start: None,
                time_window_end: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                metric_name: name.to_string(),
                metric_value: MetricValue::Number(42.0),
                value_kind: ValueKind::Percentage,
                source_url: "https://dev.oa.report/hhmi".to_string(),
                collected_at: Utc::now(),
            })
            .collect();
        ExportBatch {
            organisation: "hhmi".to_string(),
            environment: Environment::Dev,
            section: Section::Insights,
            records,
        }
    }

    fn data_lines(dir: &std::path::Path) -> usize {
        let text = std::fs::read_to_string(artifact_path(dir, Section::Insights, Environment::Dev)).unwrap();
        text.lines().count() - 1
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_twice_then_success() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = ScriptedSheet::new(vec![Err(quota()), Err(quota()), Ok(())]);
        let mut exporter = Exporter::new(
            dir.path().to_path_buf(),
            Some(Box::new(sheet.clone())),
            RetryPolicy::new(Duration::from_secs(10)),
        );

        let started = tokio::time::Instant::now();
        let outcome = exporter.append(batch(&["With Open Code", "With Data"]), &target()).await;

        assert_eq!(outcome, ExportOutcome::Success { attempts: 3 });
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(data_lines(dir.path()), 2);
        // header + two records, header sent only by the attempt that landed
        assert_eq!(sheet.received().len(), 3);
        assert_eq!(sheet.received()[0][0], "organisation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhausts_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = ScriptedSheet::new(vec![Err(quota()), Err(quota()), Err(quota()), Ok(())]);
        let mut exporter = Exporter::new(
            dir.path().to_path_buf(),
            Some(Box::new(sheet.clone())),
            RetryPolicy::new(Duration::from_secs(10)),
        );

        let started = tokio::time::Instant::now();
        let outcome = exporter.append(batch(&["With Open Code"]), &target()).await;

        assert!(matches!(
            outcome,
            ExportOutcome::Failed { kind: FailureKind::RateLimited, attempts: 3, .. }
        ));
        assert_eq!(sheet.calls(), 3);
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(data_lines(dir.path()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_quota_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = ScriptedSheet::new(vec![Err(AppendError::Auth("401".to_string())), Ok(())]);
        let mut exporter = Exporter::new(
            dir.path().to_path_buf(),
            Some(Box::new(sheet.clone())),
            RetryPolicy::new(Duration::from_secs(10)),
        );

        let started = tokio::time::Instant::now();
        let outcome = exporter.append(batch(&["With Open Code"]), &target()).await;

        assert!(matches!(
            outcome,
            ExportOutcome::Failed { kind: FailureKind::Auth, attempts: 1, .. }
        ));
        assert_eq!(sheet.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(data_lines(dir.path()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_before_quota_duplicates_rows() {
        let dir = tempfile::tempdir().unwrap();
        // header lands, rows land but report quota, retry lands them again
        let mut sheet = ScriptedSheet::new(vec![Ok(()), Err(quota()), Ok(())]);
        sheet.lands_on_error = true;
        let mut exporter = Exporter::new(
            dir.path().to_path_buf(),
            Some(Box::new(sheet.clone())),
            RetryPolicy::new(Duration::from_secs(1)),
        );

        let outcome = exporter.append(batch(&["With Open Code"]), &target()).await;

        assert_eq!(outcome, ExportOutcome::Success { attempts: 2 });
        let metric_rows: Vec<_> = sheet
            .received()
            .into_iter()
            .filter(|row| row[5] == "With Open Code")
            .collect();
        assert_eq!(metric_rows.len(), 2);
    }

    #[tokio::test]
    async fn test_local_only_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = Exporter::new(
            dir.path().to_path_buf(),
            None,
            RetryPolicy::new(Duration::from_secs(1)),
        );
        let outcome = exporter.append(batch(&["A", "B", "C"]), &target()).await;
        assert_eq!(outcome, ExportOutcome::Success { attempts: 0 });
        assert_eq!(data_lines(dir.path()), 3);
        exporter.finish().unwrap();
    }

    #[test]
    fn test_delivery_transitions() {
        let mut delivery = Delivery::new(2);
        assert_eq!(delivery.state(), BatchState::Pending);
        delivery.begin_attempt();
        assert_eq!(delivery.state(), BatchState::Sending);
        assert!(delivery.rate_limited());
        assert_eq!(delivery.state(), BatchState::RateLimited);
        delivery.begin_attempt();
        assert!(!delivery.rate_limited());
        assert_eq!(delivery.state(), BatchState::Failed);
        assert_eq!(delivery.attempts(), 2);

        let mut ok = Delivery::new(3);
        ok.begin_attempt();
        ok.succeed();
        assert_eq!(ok.state(), BatchState::Success);
    }
}
