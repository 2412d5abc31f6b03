//! Section extractors: drive a positioned page through its time windows and
//! decode what is rendered into raw observations.

pub mod cards;
pub mod explore;

use chrono::{Datelike, NaiveDate};

use crate::config::{ExploreSettings, SelectorMap};
use crate::error::ScrapeError;
use crate::models::RawObservation;
use crate::session::PageSession;

/// Runs the extractor matching `selectors` against an already opened page.
///
/// Observations come back window-major, each window in page order.
pub async fn extract(
    session: &mut dyn PageSession,
    selectors: SelectorMap<'_>,
    explore_settings: &ExploreSettings,
    today: NaiveDate,
) -> Result<Vec<RawObservation>, ScrapeError> {
    match selectors {
        SelectorMap::Cards(cards) => cards::extract_cards(session, cards).await,
        SelectorMap::Explore(explore) => {
            let years = explore::years_to_visit(today.year(), explore_settings.years_to_keep);
            explore::extract_explore(session, explore, &years).await
        }
    }
}
