use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::ExploreSelectors;
use crate::dom::{Document, Table};
use crate::error::ScrapeError;
use crate::models::{RawObservation, TimeWindow};
use crate::session::{PageSession, Wait};

/// Appended to metric labels read from the preprints view.
pub const PREPRINTS_SUFFIX: &str = " (Preprints)";

/// The `years_to_keep` most recent calendar years, oldest first.
pub fn years_to_visit(current_year: i32, years_to_keep: u32) -> Vec<i32> {
    let span = i32::try_from(years_to_keep.max(1)).unwrap_or(1);
    (current_year.saturating_sub(span - 1)..=current_year).collect()
}

/// Reads every requested year from the Explore view. Fails when none of
/// them shows any data, so an empty page is never exported as a success.
pub async fn extract_explore(
    session: &mut dyn PageSession,
    selectors: &ExploreSelectors,
    years: &[i32],
) -> Result<Vec<RawObservation>, ScrapeError> {
    prepare_view(session, selectors).await?;

    let mut observations = yearly_pass(session, selectors, years, "").await?;
    if observations.is_empty() {
        return Err(ScrapeError::NoData {
            selector: selectors.table.clone(),
            years: years.to_vec(),
        });
    }

    if let Some(filter) = &selectors.preprints_filter {
        match session.click(filter).await {
            Ok(()) => {
                session.wait_fixed(Wait::DataLoad).await;
                observations.extend(yearly_pass(session, selectors, years, PREPRINTS_SUFFIX).await?);
            }
            Err(ScrapeError::ElementNotFound { .. }) => debug!("No preprints view on this page"),
            Err(e) => return Err(e),
        }
    }

    Ok(observations)
}

/// All-time range, per-year breakdown, raw numbers instead of percentages.
async fn prepare_view(session: &mut dyn PageSession, selectors: &ExploreSelectors) -> Result<(), ScrapeError> {
    for control in [&selectors.all_time_button, &selectors.year_breakdown_button]
        .into_iter()
        .flatten()
    {
        session.select_time_window(control).await?;
    }

    if let Some(toggle) = &selectors.raw_numbers_toggle {
        match session.attribute(toggle, "aria-checked").await {
            Ok(Some(checked)) if checked == "true" => {
                info!("Switching Explore to raw numbers");
                session.click(toggle).await?;
                session.wait_fixed(Wait::DataLoad).await;
            }
            Ok(_) => {}
            Err(ScrapeError::ElementNotFound { .. }) => {
                warn!("Raw/percent toggle missing, reading values as displayed")
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// One observation per (year, metric). Clicks the year's control when one is
/// configured and present; otherwise reads the table already on screen.
async fn yearly_pass(
    session: &mut dyn PageSession,
    selectors: &ExploreSelectors,
    years: &[i32],
    suffix: &str,
) -> Result<Vec<RawObservation>, ScrapeError> {
    let mut observations = Vec::new();
    // last snapshot read; still valid until the next click
    let mut rendered: Option<String> = None;

    for &year in years {
        let clicked = match selectors.year_button_for(year) {
            Some(control) => match session.select_time_window(&control).await {
                Ok(()) => true,
                Err(ScrapeError::ElementNotFound { .. }) => {
                    debug!("No control for {}, reading the breakdown table", year);
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };

        let html = match rendered.take() {
            Some(html) if !clicked => html,
            _ => session.rendered_html().await?,
        };
        let decoded = decode_year(&html, &selectors.table, year, suffix)?;
        if decoded.is_empty() {
            warn!("Explore table has no data for {}", year);
        }
        observations.extend(decoded);
        rendered = Some(html);
    }

    Ok(observations)
}

/// Observations for `year` from the rendered table, or none when the table
/// or the year is absent.
pub fn decode_year(
    html: &str,
    table_selector: &str,
    year: i32,
    suffix: &str,
) -> Result<Vec<RawObservation>, ScrapeError> {
    let table = match Document::parse(html).table(table_selector) {
        Ok(table) => table,
        Err(ScrapeError::ElementNotFound { selector }) => {
            debug!("No table ({}) rendered for {}", selector, year);
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    Ok(pivot_year(&table, year)
        .into_iter()
        .map(|(label, value)| RawObservation::new(format!("{label}{suffix}"), value, TimeWindow::Year(year)))
        .collect())
}

/// Flattens the table into one (metric label, value) pair per metric for `year`.
///
/// Two layouts are read: metric rows with one column (or column group) per
/// year, and year rows with one column (or column group) per metric. Within a
/// group the first leaf column is used, and the first occurrence of a label
/// wins, so grouping never yields duplicates.
pub fn pivot_year(table: &Table, year: i32) -> Vec<(String, String)> {
    let year_label = year.to_string();
    let width = table.width();
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();

    if width < 2 {
        return pairs;
    }

    let rows: Vec<&Vec<String>> = table
        .rows
        .iter()
        .filter(|row| {
            let fits = row.len() == width;
            if !fits {
                debug!("Skipping row due to column mismatch: {:?}", row);
            }
            fits
        })
        .collect();

    let year_column = (1..width).find(|&col| table.columns[col].iter().any(|h| *h == year_label));

    if let Some(column) = year_column {
        for row in rows {
            let label = &row[0];
            if label.is_empty() || !seen.insert(label.clone()) {
                continue;
            }
            pairs.push((label.clone(), row[column].clone()));
        }
        return pairs;
    }

    for row in rows.into_iter().filter(|row| row[0] == year_label) {
        for (col, value) in row.iter().enumerate().skip(1) {
            let metric = table.group(col);
            if metric.is_empty() || !seen.insert(metric.to_string()) {
                continue;
            }
            pairs.push((metric.to_string(), value.clone()));
        }
    }

    pairs
}
