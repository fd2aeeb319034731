use scraper::{Html, Selector};

use super::error::MonitorError;
use super::types::PageVerdict;

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub queue_markers: Vec<String>,
    pub challenge_markers: Vec<String>,
    pub min_markup_len: usize,
    pub stock_selector: String,
    pub hidden_class: String,
}

/// Turns rendered markup into a `PageVerdict`.
///
/// Checks run cheapest and most specific first: queue markers, then challenge
/// markers and the short-page heuristic, and only then a structural parse for the
/// hero product's add-to-cart button.
pub struct Classifier {
    queue_markers: Vec<String>,
    challenge_markers: Vec<String>,
    min_markup_len: usize,
    stock_selector: Selector,
    body_selector: Selector,
    hidden_class: String,
}

fn parse_selector(selector: &str) -> Result<Selector, MonitorError> {
    Selector::parse(selector).map_err(|e| MonitorError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, MonitorError> {
        Ok(Self {
            stock_selector: parse_selector(&config.stock_selector)?,
            body_selector: parse_selector("body")?,
            queue_markers: config.queue_markers,
            challenge_markers: config.challenge_markers,
            min_markup_len: config.min_markup_len,
            hidden_class: config.hidden_class,
        })
    }

    pub fn classify(&self, markup: &str) -> PageVerdict {
        if contains_any(markup, &self.queue_markers) {
            return PageVerdict::Queued;
        }
        if contains_any(markup, &self.challenge_markers)
            || markup.chars().count() < self.min_markup_len
        {
            return PageVerdict::Challenged;
        }

        let doc = Html::parse_document(markup);
        if !has_element_content(&doc, &self.body_selector) {
            return PageVerdict::Unreadable("rendered markup has no element content".to_string());
        }

        PageVerdict::Stocked(self.hero_button_visible(&doc))
    }

    // A missing button counts as sold out, never as an error.
    fn hero_button_visible(&self, doc: &Html) -> bool {
        doc.select(&self.stock_selector)
            .next()
            .map(|button| !button.value().classes().any(|c| c == self.hidden_class))
            .unwrap_or(false)
    }
}

fn contains_any(markup: &str, markers: &[String]) -> bool {
    markers
        .iter()
        .any(|marker| !marker.is_empty() && markup.contains(marker.as_str()))
}

fn has_element_content(doc: &Html, body: &Selector) -> bool {
    doc.select(body)
        .next()
        .is_some_and(|el| el.children().any(|node| node.value().is_element()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default()).expect("default selector parses")
    }

    fn page(body: &str) -> String {
        let filler = "<p>".to_string() + &"Console bundles and accessories. ".repeat(40) + "</p>";
        format!(
            "<!DOCTYPE html><html><head><title>PlayStation 5</title></head><body>{body}{filler}</body></html>"
        )
    }

    fn hero(button_class: &str) -> String {
        format!(
            r#"<div class="productHero-info"><h1>PS5</h1><div class="button-placeholder"><button class="{button_class}">Add to Cart</button></div></div>"#
        )
    }

    #[test]
    fn queue_marker_wins_over_stock_button() {
        let markup = page(&format!(
            "<p>When you reach the front of the queue you will have 10 minutes.</p>{}",
            hero("add-to-cart")
        ));
        assert_eq!(classifier().classify(&markup), PageVerdict::Queued);
    }

    #[test]
    fn queue_marker_wins_over_challenge_marker() {
        let markup = page(
            "<p>We\u{2019}re trying to get you in</p><p>When you reach the front of the queue</p>",
        );
        assert_eq!(classifier().classify(&markup), PageVerdict::Queued);
    }

    #[test]
    fn challenge_banner_is_challenged() {
        let markup = page("<h2>We\u{2019}re trying to get you in</h2>");
        assert_eq!(classifier().classify(&markup), PageVerdict::Challenged);
    }

    #[test]
    fn short_markup_is_treated_as_challenge() {
        let markup = "<html><body><p>Please wait</p></body></html>";
        assert!(markup.len() < 1000);
        assert_eq!(classifier().classify(markup), PageVerdict::Challenged);
    }

    #[test]
    fn visible_hero_button_means_in_stock() {
        let markup = page(&hero("add-to-cart"));
        assert_eq!(classifier().classify(&markup), PageVerdict::Stocked(true));
    }

    #[test]
    fn hidden_hero_button_means_sold_out() {
        let markup = page(&hero("add-to-cart hide"));
        assert_eq!(classifier().classify(&markup), PageVerdict::Stocked(false));
    }

    #[test]
    fn missing_button_means_sold_out() {
        let markup = page("<div class=\"productHero-info\"><p>Out of stock</p></div>");
        assert_eq!(classifier().classify(&markup), PageVerdict::Stocked(false));
    }

    #[test]
    fn buttons_outside_the_hero_are_ignored() {
        let markup = page(
            r#"<div class="productHero-info"><div class="button-placeholder"><button class="add-to-cart hide">Add</button></div></div>
               <div class="accessories"><div class="button-placeholder"><button class="add-to-cart">Add</button></div></div>"#,
        );
        assert_eq!(classifier().classify(&markup), PageVerdict::Stocked(false));
    }

    #[test]
    fn text_without_elements_is_unreadable() {
        let markup = "{\"error\":\"upstream\"} ".repeat(80);
        assert!(matches!(
            classifier().classify(&markup),
            PageVerdict::Unreadable(_)
        ));
    }

    #[test]
    fn min_length_is_configurable() {
        let classifier = Classifier::new(ClassifierConfig {
            min_markup_len: 0,
            ..ClassifierConfig::default()
        })
        .expect("classifier");
        let markup = format!("<html><body>{}</body></html>", hero("add-to-cart"));
        assert_eq!(classifier.classify(&markup), PageVerdict::Stocked(true));
    }

    #[test]
    fn bad_selector_is_a_configuration_error() {
        let result = Classifier::new(ClassifierConfig {
            stock_selector: "div[".to_string(),
            ..ClassifierConfig::default()
        });
        assert!(matches!(result, Err(MonitorError::InvalidSelector { .. })));
    }
}
