use tracing::{debug, warn};

use crate::config::CardSelectors;
use crate::dom::{find_within, text_of, Document};
use crate::error::ScrapeError;
use crate::models::{RawObservation, TimeWindow};
use crate::session::PageSession;

/// Windows read on Insights and Actions pages, in extraction order.
pub const CARD_WINDOWS: [TimeWindow; 2] = [TimeWindow::AllTime, TimeWindow::LastTwoYears];

pub async fn extract_cards(
    session: &mut dyn PageSession,
    selectors: &CardSelectors,
) -> Result<Vec<RawObservation>, ScrapeError> {
    let mut observations = Vec::new();

    for window in CARD_WINDOWS {
        let control = match window {
            TimeWindow::AllTime => &selectors.all_time_button,
            _ => &selectors.last_two_years_button,
        };
        session.select_time_window(control).await?;

        let html = session.rendered_html().await?;
        let decoded = decode_cards(&html, selectors, window)?;
        debug!("Read {} cards for {}", decoded.len(), window);
        observations.extend(decoded);
    }

    Ok(observations)
}

/// Placeholder for a card title or value the page did not render.
pub const MISSING: &str = "N/A";

/// One observation per card, in page order. A missing or blank title or
/// value is recorded as [`MISSING`] so the gap shows up in the data.
pub fn decode_cards(
    html: &str,
    selectors: &CardSelectors,
    window: TimeWindow,
) -> Result<Vec<RawObservation>, ScrapeError> {
    let doc = Document::parse(html);
    let cards = doc.select_all(&selectors.card)?;

    let mut observations = Vec::with_capacity(cards.len());
    for (idx, card) in cards.into_iter().enumerate() {
        let label = match find_within(card, &selectors.card_title).map(text_of) {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => {
                warn!("Card {} in {} has an empty title", idx + 1, window);
                MISSING.to_string()
            }
            Err(e) => {
                warn!("Card {} in {} has no title: {}", idx + 1, window, e);
                MISSING.to_string()
            }
        };

        let value = match find_within(card, &selectors.card_value).map(text_of) {
            Ok(value) if !value.is_empty() => value,
            Ok(_) => MISSING.to_string(),
            Err(e) => {
                warn!("Card '{}' in {} has no value: {}", label, window, e);
                MISSING.to_string()
            }
        };

        observations.push(RawObservation::new(label, value, window));
    }

    Ok(observations)
}
