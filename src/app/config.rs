use std::time::Duration;

use url::Url;

use super::classify::ClassifierConfig;
use super::error::MonitorError;
use super::types::{Cli, MonitoredUrl};

const DIRECT_CONSOLES: &str = "https://direct.playstation.com/en-us/consoles/console/";

/// Product pages visited in rotation order.
pub const PRODUCT_PAGES: &[(&str, &str)] = &[
    ("ps5-disc", "playstation5-console.3005816"),
    ("ps5-digital", "playstation5-digital-edition-console.3005817"),
];

pub const QUEUE_MARKERS: &[&str] = &["When you reach the front of the queue"];

pub const CHALLENGE_MARKERS: &[&str] = &["We\u{2019}re trying to get you in"];

/// Add-to-cart button of the hero product; other products further down the page
/// carry the same button class outside of `productHero-info`.
pub const STOCK_SELECTOR: &str = "div.productHero-info div.button-placeholder button.add-to-cart";

pub const HIDDEN_CLASS: &str = "hide";

/// Keeps the product video from downloading on every reload.
pub const BLOCK_RULES: &str = r#"[{
    "trigger": {
        "url-filter": ".*",
        "resource-type": ["media"]
    },
    "action": {
        "type": "block"
    }
}]"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    Reload,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub load_timeout: Duration,
    pub retry_delay: Duration,
    pub challenge_threshold: u32,
    pub rotate_on_sold_out: bool,
    pub renderer_termination: TerminationPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(3),
            challenge_threshold: 3,
            rotate_on_sold_out: true,
            renderer_termination: TerminationPolicy::Reload,
        }
    }
}

impl MonitorSettings {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            load_timeout: Duration::from_secs(cli.load_timeout_secs.max(1)),
            retry_delay: Duration::from_secs(cli.retry_delay_secs),
            challenge_threshold: cli.challenge_threshold.max(1),
            rotate_on_sold_out: !cli.pin_url,
            renderer_termination: if cli.fatal_renderer_termination {
                TerminationPolicy::Fail
            } else {
                TerminationPolicy::Reload
            },
        }
    }
}

impl ClassifierConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            min_markup_len: cli.min_markup_len,
            ..Self::default()
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            queue_markers: QUEUE_MARKERS.iter().map(|m| m.to_string()).collect(),
            challenge_markers: CHALLENGE_MARKERS.iter().map(|m| m.to_string()).collect(),
            min_markup_len: 1000,
            stock_selector: STOCK_SELECTOR.to_string(),
            hidden_class: HIDDEN_CLASS.to_string(),
        }
    }
}

pub fn product_pages() -> Result<Vec<MonitoredUrl>, MonitorError> {
    let entries = PRODUCT_PAGES
        .iter()
        .map(|(id, slug)| (*id, format!("{DIRECT_CONSOLES}{slug}")))
        .collect::<Vec<_>>();
    parse_catalogue(&entries)
}

pub fn parse_catalogue<S: AsRef<str>>(entries: &[(&str, S)]) -> Result<Vec<MonitoredUrl>, MonitorError> {
    if entries.is_empty() {
        return Err(MonitorError::EmptyUrlSet);
    }

    entries
        .iter()
        .map(|(id, raw)| {
            let raw = raw.as_ref();
            let url = Url::parse(raw).map_err(|source| MonitorError::InvalidUrl {
                url: raw.to_string(),
                source,
            })?;
            Ok(MonitoredUrl {
                id: id.to_string(),
                url,
            })
        })
        .collect()
}
