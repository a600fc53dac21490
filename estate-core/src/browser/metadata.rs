use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{SelectorSection, SiteSection};

use super::error::{AutomationError, AutomationResult};
use super::session::ProviderSession;

/// Semi-structured view of a page: candidate texts per field plus the visible text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub headings: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub price_candidates: Vec<String>,
    #[serde(default)]
    pub address_candidates: Vec<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub currency: String,
    pub amount: u64,
    pub display: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub title: Option<String>,
    pub price: Option<Price>,
    pub address: Option<String>,
    pub source_url: String,
}

impl PropertyRecord {
    pub fn is_partial(&self) -> bool {
        self.title.is_none() || self.price.is_none() || self.address.is_none()
    }

    pub fn resolved_fields(&self) -> usize {
        [
            self.title.is_some(),
            self.price.is_some(),
            self.address.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

#[derive(Debug, Clone)]
pub struct PropertyExtractor {
    detail_markers: Vec<String>,
    price_regex: Regex,
    postcode_regex: Regex,
    site_suffix_regex: Regex,
}

impl PropertyExtractor {
    pub fn new(site: &SiteSection) -> Self {
        let price_regex = Regex::new(r"([£$€])\s?(\d{1,3}(?:,\d{3})+|\d+)(?:\.\d{1,2})?")
            .expect("valid regex");
        let postcode_regex =
            Regex::new(r"\b[A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2}\b").expect("valid regex");
        let site_suffix_regex = Regex::new(r"\s*[|\-–]\s*[^|\-–]*$").expect("valid regex");
        Self {
            detail_markers: site.detail_url_markers.clone(),
            price_regex,
            postcode_regex,
            site_suffix_regex,
        }
    }

    pub async fn extract(
        &self,
        session: &mut dyn ProviderSession,
    ) -> AutomationResult<PropertyRecord> {
        let snapshot = session.snapshot().await?;
        self.parse(&snapshot)
    }

    /// Best-effort parse of a detail page. Any other page is an error, whatever
    /// fields happen to resolve on it.
    pub fn parse(&self, snapshot: &PageSnapshot) -> AutomationResult<PropertyRecord> {
        if !self.is_detail_page(&snapshot.url) {
            return Err(AutomationError::Extraction(format!(
                "{} is not a property detail page",
                snapshot.url
            )));
        }
        let record = PropertyRecord {
            title: self.select_title(snapshot),
            price: self.select_price(snapshot),
            address: self.select_address(snapshot),
            source_url: snapshot.url.clone(),
        };
        debug!(
            url = %snapshot.url,
            fields = record.resolved_fields(),
            "parsed property snapshot"
        );
        Ok(record)
    }

    pub fn is_detail_page(&self, url: &str) -> bool {
        self.detail_markers
            .iter()
            .any(|marker| !marker.is_empty() && url.contains(marker.as_str()))
    }

    fn select_title(&self, snapshot: &PageSnapshot) -> Option<String> {
        snapshot
            .headings
            .iter()
            .map(|heading| normalize_whitespace(heading))
            .find(|heading| !heading.is_empty())
            .or_else(|| {
                snapshot
                    .meta
                    .get("og:title")
                    .map(|title| normalize_whitespace(title))
                    .filter(|title| !title.is_empty())
            })
            .or_else(|| {
                let title = normalize_whitespace(&snapshot.title);
                let stripped = self.site_suffix_regex.replace(&title, "").trim().to_string();
                if stripped.is_empty() {
                    None
                } else {
                    Some(stripped)
                }
            })
    }

    fn select_price(&self, snapshot: &PageSnapshot) -> Option<Price> {
        snapshot
            .price_candidates
            .iter()
            .find_map(|candidate| self.parse_price(candidate))
            .or_else(|| self.parse_price(&snapshot.text))
    }

    pub fn parse_price(&self, input: &str) -> Option<Price> {
        let captures = self.price_regex.captures(input)?;
        let symbol = captures.get(1)?.as_str();
        let digits = captures.get(2)?.as_str().replace(',', "");
        let amount = digits.parse::<u64>().ok()?;
        let currency = match symbol {
            "£" => "GBP",
            "$" => "USD",
            "€" => "EUR",
            _ => return None,
        };
        Some(Price {
            currency: currency.to_string(),
            amount,
            display: captures.get(0)?.as_str().trim().to_string(),
        })
    }

    fn select_address(&self, snapshot: &PageSnapshot) -> Option<String> {
        snapshot
            .address_candidates
            .iter()
            .map(|candidate| normalize_whitespace(candidate))
            .find(|candidate| !candidate.is_empty())
            .or_else(|| {
                snapshot
                    .text
                    .lines()
                    .map(str::trim)
                    .find(|line| line.len() <= 160 && self.postcode_regex.is_match(line))
                    .map(normalize_whitespace)
            })
    }
}

fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Script evaluated in the page to build a [`PageSnapshot`].
pub fn snapshot_script(selectors: &SelectorSection) -> String {
    format!(
        r#"
(() => {{
    const texts = (selectors) => selectors
        .flatMap(sel => Array.from(document.querySelectorAll(sel)))
        .map(el => (el.innerText || el.textContent || '').trim())
        .filter(Boolean);
    const meta = {{}};
    document.querySelectorAll('meta[property], meta[name]').forEach(el => {{
        const key = el.getAttribute('property') || el.getAttribute('name');
        if (key && el.content) {{ meta[key] = el.content; }}
    }});
    return {{
        url: location.href,
        title: document.title || '',
        headings: texts([{title}]),
        meta,
        price_candidates: texts([{price}]),
        address_candidates: texts([{address}]),
        text: (document.body ? document.body.innerText : '').slice(0, 20000)
    }};
}})()
"#,
        title = js_list(&selectors.title),
        price = js_list(&selectors.price),
        address = js_list(&selectors.address),
    )
}

pub(crate) fn js_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| format!("\"{}\"", escape_js(s)))
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn escape_js(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> PropertyExtractor {
        PropertyExtractor::new(&SiteSection::default())
    }

    fn detail_snapshot() -> PageSnapshot {
        PageSnapshot {
            url: "https://www.zoopla.co.uk/for-sale/details/67012345/".into(),
            title: "3 bed semi-detached house for sale in Didsbury - Zoopla".into(),
            headings: vec!["  3 bed   semi-detached house for sale ".into()],
            meta: BTreeMap::new(),
            price_candidates: vec!["£425,000".into()],
            address_candidates: vec!["Lapwing Lane, Manchester M20".into()],
            text: String::new(),
        }
    }

    #[test]
    fn parses_full_record() {
        let record = extractor().parse(&detail_snapshot()).unwrap();
        assert_eq!(
            record.title.as_deref(),
            Some("3 bed semi-detached house for sale")
        );
        let price = record.price.unwrap();
        assert_eq!(price.currency, "GBP");
        assert_eq!(price.amount, 425_000);
        assert_eq!(record.address.as_deref(), Some("Lapwing Lane, Manchester M20"));
    }

    #[test]
    fn missing_price_yields_partial_record() {
        let mut snapshot = detail_snapshot();
        snapshot.price_candidates = vec!["Price on application".into()];
        let record = extractor().parse(&snapshot).unwrap();
        assert!(record.price.is_none());
        assert!(record.title.is_some());
        assert!(record.address.is_some());
        assert!(record.is_partial());
        assert_eq!(record.resolved_fields(), 2);
    }

    #[test]
    fn falls_back_to_page_text() {
        let snapshot = PageSnapshot {
            url: "https://www.zoopla.co.uk/for-sale/details/1/".into(),
            title: "Flat for sale | Zoopla".into(),
            text: "Guide price\n£1,250,000\nFlat 4, 12 Deansgate, Manchester M3 4LQ\n".into(),
            ..PageSnapshot::default()
        };
        let record = extractor().parse(&snapshot).unwrap();
        assert_eq!(record.title.as_deref(), Some("Flat for sale"));
        assert_eq!(record.price.unwrap().amount, 1_250_000);
        assert_eq!(
            record.address.as_deref(),
            Some("Flat 4, 12 Deansgate, Manchester M3 4LQ")
        );
    }

    #[test]
    fn non_detail_page_without_fields_is_error() {
        let snapshot = PageSnapshot {
            url: "https://www.zoopla.co.uk/".into(),
            ..PageSnapshot::default()
        };
        let err = extractor().parse(&snapshot).unwrap_err();
        assert!(matches!(err, AutomationError::Extraction(_)));
    }

    #[test]
    fn results_page_with_title_is_error() {
        let snapshot = PageSnapshot {
            url: "https://www.zoopla.co.uk/for-sale/property/leeds/".into(),
            title: "Property for sale in Leeds | Zoopla".into(),
            headings: vec!["Property for sale in Leeds".into()],
            ..PageSnapshot::default()
        };
        let err = extractor().parse(&snapshot).unwrap_err();
        assert!(matches!(err, AutomationError::Extraction(_)));
        assert!(!extractor().is_detail_page(&snapshot.url));
    }

    #[test]
    fn detail_page_without_fields_keeps_source_url() {
        let snapshot = PageSnapshot {
            url: "https://www.zoopla.co.uk/for-sale/details/99/".into(),
            ..PageSnapshot::default()
        };
        let record = extractor().parse(&snapshot).unwrap();
        assert_eq!(record.resolved_fields(), 0);
        assert_eq!(record.source_url, snapshot.url);
    }

    #[test]
    fn snapshot_script_embeds_selectors() {
        let script = snapshot_script(&SelectorSection::default());
        assert!(script.contains("[data-testid='price']"));
        assert!(script.contains("price_candidates"));
    }
}
