//! Typed run configuration, loaded from YAML and validated before any page is opened.

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{Environment, OrgTarget, Section};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub delays: Delays,
    #[serde(default)]
    pub explore: ExploreSettings,
    #[serde(default)]
    pub export: ExportSettings,
    pub selectors: Selectors,
    pub targets: Targets,
}

/// Fixed waits, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delays {
    pub page_load: u64,
    pub data_load: u64,
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout: u64,
}

fn default_navigation_timeout() -> u64 {
    30
}

impl Delays {
    pub fn page_load(&self) -> Duration {
        Duration::from_secs(self.page_load)
    }

    pub fn data_load(&self) -> Duration {
        Duration::from_secs(self.data_load)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExploreSettings {
    #[serde(default = "default_years_to_keep")]
    pub years_to_keep: u32,
}

pub const MAX_YEARS_TO_KEEP: u32 = 50;

fn default_years_to_keep() -> u32 {
    5
}

impl Default for ExploreSettings {
    fn default() -> Self {
        Self {
            years_to_keep: default_years_to_keep(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportSettings {
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Credential payload for the spreadsheet backend.
    #[serde(default)]
    pub credentials: Option<PathBuf>,
}

fn default_retry_delay() -> u64 {
    10
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            retry_delay: default_retry_delay(),
            output_dir: default_output_dir(),
            credentials: None,
        }
    }
}

impl ExportSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selectors {
    pub insights: CardSelectors,
    pub actions: CardSelectors,
    pub explore: ExploreSelectors,
}

/// CSS selectors for sections rendered as metric cards (Insights, Actions).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CardSelectors {
    pub all_time_button: String,
    pub last_two_years_button: String,
    /// One match per metric card, in page order.
    pub card: String,
    /// Relative to `card`.
    pub card_title: String,
    /// Relative to `card`.
    pub card_value: String,
}

/// CSS selectors for the Explore table view.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExploreSelectors {
    #[serde(default)]
    pub all_time_button: Option<String>,
    #[serde(default)]
    pub year_breakdown_button: Option<String>,
    #[serde(default)]
    pub raw_numbers_toggle: Option<String>,
    #[serde(default)]
    pub preprints_filter: Option<String>,
    /// Per-year control; must contain `{year}`. Without it every year is
    /// read from the breakdown table as rendered.
    #[serde(default)]
    pub year_button: Option<String>,
    pub table: String,
}

impl ExploreSelectors {
    pub fn year_button_for(&self, year: i32) -> Option<String> {
        self.year_button
            .as_ref()
            .map(|template| template.replace("{year}", &year.to_string()))
    }
}

/// Structural queries for one section.
#[derive(Debug, Clone, Copy)]
pub enum SelectorMap<'a> {
    Cards(&'a CardSelectors),
    Explore(&'a ExploreSelectors),
}

impl Selectors {
    pub fn for_section(&self, section: Section) -> SelectorMap<'_> {
        match section {
            Section::Insights => SelectorMap::Cards(&self.insights),
            Section::Actions => SelectorMap::Cards(&self.actions),
            Section::Explore => SelectorMap::Explore(&self.explore),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Targets {
    #[serde(default)]
    pub staging: EnvironmentTargets,
    #[serde(default)]
    pub dev: EnvironmentTargets,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentTargets {
    #[serde(default)]
    pub insights: Option<SectionTarget>,
    #[serde(default)]
    pub explore: Option<SectionTarget>,
    #[serde(default)]
    pub actions: Option<SectionTarget>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionTarget {
    pub sheet: SheetTarget,
    pub urls: Vec<String>,
}

/// Remote worksheet that receives one (environment, section) stream of rows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SheetTarget {
    pub spreadsheet_id: String,
    pub worksheet: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_YEARS_TO_KEEP).contains(&self.explore.years_to_keep) {
            bail!("explore.years_to_keep must be between 1 and {}", MAX_YEARS_TO_KEEP);
        }

        for (name, sel) in [("insights", &self.selectors.insights), ("actions", &self.selectors.actions)] {
            check_selector(&format!("selectors.{name}.all_time_button"), &sel.all_time_button)?;
            check_selector(&format!("selectors.{name}.last_two_years_button"), &sel.last_two_years_button)?;
            check_selector(&format!("selectors.{name}.card"), &sel.card)?;
            check_selector(&format!("selectors.{name}.card_title"), &sel.card_title)?;
            check_selector(&format!("selectors.{name}.card_value"), &sel.card_value)?;
        }

        let explore = &self.selectors.explore;
        if let Some(template) = &explore.year_button {
            if !template.contains("{year}") {
                bail!("selectors.explore.year_button must contain a {{year}} placeholder");
            }
            check_selector("selectors.explore.year_button", &template.replace("{year}", "2000"))?;
        }
        check_selector("selectors.explore.table", &explore.table)?;
        for (key, value) in [
            ("all_time_button", &explore.all_time_button),
            ("year_breakdown_button", &explore.year_breakdown_button),
            ("raw_numbers_toggle", &explore.raw_numbers_toggle),
            ("preprints_filter", &explore.preprints_filter),
        ] {
            if let Some(selector) = value {
                check_selector(&format!("selectors.explore.{key}"), selector)?;
            }
        }

        for environment in [Environment::Staging, Environment::Dev] {
            for section in [Section::Insights, Section::Explore, Section::Actions] {
                let Some(target) = self.section_target(environment, section) else {
                    continue;
                };
                let key = format!("targets.{environment}.{section}");
                if target.sheet.spreadsheet_id.trim().is_empty() {
                    bail!("{key}.sheet.spreadsheet_id must not be empty");
                }
                if target.sheet.worksheet.trim().is_empty() {
                    bail!("{key}.sheet.worksheet must not be empty");
                }
                for url in &target.urls {
                    organisation_from_url(url).with_context(|| format!("{key}.urls"))?;
                }
            }
        }

        Ok(())
    }

    pub fn section_target(&self, environment: Environment, section: Section) -> Option<&SectionTarget> {
        let targets = match environment {
            Environment::Staging => &self.targets.staging,
            Environment::Dev => &self.targets.dev,
        };
        match section {
            Section::Insights => targets.insights.as_ref(),
            Section::Explore => targets.explore.as_ref(),
            Section::Actions => targets.actions.as_ref(),
        }
    }

    /// Organisation pages to visit, in configuration order.
    pub fn org_targets(&self, environment: Environment, section: Section) -> Result<Vec<OrgTarget>> {
        let Some(target) = self.section_target(environment, section) else {
            return Ok(Vec::new());
        };
        target
            .urls
            .iter()
            .map(|url| {
                Ok(OrgTarget {
                    environment,
                    section,
                    organisation: organisation_from_url(url)?,
                    url: url.clone(),
                })
            })
            .collect()
    }
}

fn check_selector(key: &str, selector: &str) -> Result<()> {
    scraper::Selector::parse(selector)
        .map_err(|e| anyhow::anyhow!("{key}: invalid CSS selector '{selector}': {e:?}"))?;
    Ok(())
}

/// Organisation slug: the first path segment of the page URL.
pub fn organisation_from_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid URL '{url}'"))?;
    let slug = parsed
        .path_segments()
        .and_then(|mut segments| segments.next())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    if slug.is_empty() {
        bail!("URL '{url}' has no organisation path segment");
    }
    Ok(slug)
}
