use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use super::error::MonitorError;
use super::types::BrowserArg;

#[derive(Debug, Deserialize)]
struct RawRule {
    trigger: RawTrigger,
    action: RawAction,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    #[serde(rename = "url-filter")]
    url_filter: String,
    #[serde(rename = "resource-type", default)]
    resource_type: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    kind: String,
}

type Lowering = (Vec<&'static str>, Vec<(&'static str, Value)>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Document,
    Image,
    StyleSheet,
    Script,
    Font,
    Raw,
    Media,
    Popup,
}

impl ResourceType {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "document" => ResourceType::Document,
            "image" => ResourceType::Image,
            "style-sheet" => ResourceType::StyleSheet,
            "script" => ResourceType::Script,
            "font" => ResourceType::Font,
            "raw" => ResourceType::Raw,
            "media" => ResourceType::Media,
            "popup" => ResourceType::Popup,
            _ => return None,
        })
    }

    /// Browser preferences and switches that block this resource class outright.
    fn lowering(self, browser: BrowserArg) -> Option<Lowering> {
        match (browser, self) {
            (BrowserArg::Firefox, ResourceType::Media) => Some((
                Vec::new(),
                vec![
                    ("media.autoplay.default", json!(5)),
                    ("media.autoplay.blocking_policy", json!(2)),
                    ("media.mediasource.enabled", json!(false)),
                    ("media.play-stand-alone", json!(false)),
                ],
            )),
            (BrowserArg::Firefox, ResourceType::Image) => {
                Some((Vec::new(), vec![("permissions.default.image", json!(2))]))
            }
            (BrowserArg::Firefox, ResourceType::Font) => {
                Some((Vec::new(), vec![("browser.display.use_document_fonts", json!(0))]))
            }
            (BrowserArg::Chrome | BrowserArg::Edge, ResourceType::Media) => Some((
                vec![
                    "--autoplay-policy=user-gesture-required",
                    "--disable-features=MediaSource",
                ],
                Vec::new(),
            )),
            (BrowserArg::Chrome | BrowserArg::Edge, ResourceType::Image) => Some((
                Vec::new(),
                vec![("profile.managed_default_content_settings.images", json!(2))],
            )),
            (BrowserArg::Chrome | BrowserArg::Edge, ResourceType::Popup) => Some((
                Vec::new(),
                vec![("profile.managed_default_content_settings.popups", json!(2))],
            )),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ContentRule {
    url_filter: Regex,
    resource_types: Vec<ResourceType>,
}

impl ContentRule {
    fn matches_every_url(&self) -> bool {
        matches!(self.url_filter.as_str(), ".*" | "^.*$" | "^.*" | ".*$")
    }

    #[cfg(test)]
    pub fn blocks(&self, url: &str, kind: ResourceType) -> bool {
        (self.resource_types.is_empty() || self.resource_types.contains(&kind))
            && self.url_filter.is_match(url)
    }
}

/// Extra session settings derived from the compiled rules for one browser.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BrowserTweaks {
    pub args: Vec<String>,
    pub prefs: Map<String, Value>,
}

#[derive(Debug)]
pub struct ContentRuleList {
    rules: Vec<ContentRule>,
}

impl ContentRuleList {
    /// Parses and validates a content-blocker rule list. Only `block` actions are
    /// accepted; every `url-filter` must be a valid regular expression.
    pub fn compile(source: &str) -> Result<Self, MonitorError> {
        let raw: Vec<RawRule> = serde_json::from_str(source)
            .map_err(|e| MonitorError::ContentRules(format!("rule list parse failed: {e}")))?;

        let mut rules = Vec::with_capacity(raw.len());
        for (index, rule) in raw.into_iter().enumerate() {
            if rule.action.kind != "block" {
                return Err(MonitorError::ContentRules(format!(
                    "rule {index}: unsupported action `{}`",
                    rule.action.kind
                )));
            }
            let url_filter = Regex::new(&rule.trigger.url_filter).map_err(|e| {
                MonitorError::ContentRules(format!("rule {index}: invalid url-filter: {e}"))
            })?;
            let resource_types = rule
                .trigger
                .resource_type
                .iter()
                .map(|kind| {
                    ResourceType::parse(kind).ok_or_else(|| {
                        MonitorError::ContentRules(format!(
                            "rule {index}: unknown resource-type `{kind}`"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            rules.push(ContentRule {
                url_filter,
                resource_types,
            });
        }

        Ok(Self { rules })
    }

    #[cfg(test)]
    pub fn rules(&self) -> &[ContentRule] {
        &self.rules
    }

    #[cfg(test)]
    pub fn is_blocked(&self, url: &str, kind: ResourceType) -> bool {
        self.rules.iter().any(|rule| rule.blocks(url, kind))
    }

    /// WebDriver has no per-request interception, so only rules covering every URL
    /// can be enforced; they become browser preferences and switches.
    pub fn lower(&self, browser: BrowserArg) -> BrowserTweaks {
        let mut tweaks = BrowserTweaks::default();
        for rule in &self.rules {
            if !rule.matches_every_url() {
                warn!(
                    filter = rule.url_filter.as_str(),
                    "content rule is URL-specific and cannot be enforced over WebDriver; skipped"
                );
                continue;
            }
            for kind in &rule.resource_types {
                let Some((args, prefs)) = kind.lowering(browser) else {
                    warn!(?kind, ?browser, "content rule has no browser equivalent; skipped");
                    continue;
                };
                for arg in args {
                    if !tweaks.args.iter().any(|a| a == arg) {
                        tweaks.args.push(arg.to_string());
                    }
                }
                for (key, value) in prefs {
                    tweaks.prefs.insert(key.to_string(), value);
                }
            }
        }
        tweaks
    }
}
