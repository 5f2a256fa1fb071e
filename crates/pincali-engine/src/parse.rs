use pincali_core::{property_id, ManifestEntry, OperationType, Result, SyncError};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Listing titles are capped before they reach the manifest.
const MAX_TITLE_LEN: usize = 500;

/// Upper bound on auto-detected pagination; listing sites occasionally
/// report absurd totals.
pub const PAGE_HARD_CAP: u32 = 500;

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| SyncError::Parse(e.to_string()))
}

/// Extracts manifest entries from one listing page. Only reads HTML; never
/// follows links, never talks to storage.
pub struct ListingPageParser {
    tile: Selector,
    link: Selector,
    title: Selector,
    price: Selector,
    pagination_summary: Selector,
    pagination_links: Selector,
    price_re: Regex,
    summary_re: Regex,
    page_param_re: Regex,
}

impl ListingPageParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            tile: parse_selector("li.property__component")?,
            link: parse_selector("a")?,
            title: parse_selector(".title")?,
            price: parse_selector("li.price")?,
            pagination_summary: parse_selector(".pagination-summary")?,
            pagination_links: parse_selector(".pagination a, .pager a")?,
            price_re: Regex::new(r"(\d+(?:\.\d+)?)")
                .map_err(|e| SyncError::Parse(e.to_string()))?,
            summary_re: Regex::new(r"(?i)Page\s+\d+\s+of\s+([\d,]+)")
                .map_err(|e| SyncError::Parse(e.to_string()))?,
            page_param_re: Regex::new(r"page=(\d+)")
                .map_err(|e| SyncError::Parse(e.to_string()))?,
        })
    }

    /// Parse one listing page into manifest entries. Malformed tiles are
    /// skipped; a page that yields nothing is the caller's signal of a failed
    /// page.
    pub fn parse_listing_page(
        &self,
        html: &str,
        page_url: &str,
        operation_type: OperationType,
    ) -> Vec<ManifestEntry> {
        let document = Html::parse_document(html);
        let base = Url::parse(page_url).ok();

        let mut entries = Vec::new();
        for tile in document.select(&self.tile) {
            match self.extract_entry(tile, base.as_ref(), operation_type) {
                Some(entry) => entries.push(entry),
                None => debug!("Skipping tile without usable link on {}", page_url),
            }
        }

        dedupe_entries(entries)
    }

    fn extract_entry(
        &self,
        tile: ElementRef,
        base: Option<&Url>,
        operation_type: OperationType,
    ) -> Option<ManifestEntry> {
        let href = tile
            .select(&self.link)
            .find_map(|a| a.value().attr("href"))?;

        let source_url = match base {
            Some(base) => base.join(href).ok()?.to_string(),
            None => href.to_string(),
        };

        let mut entry = ManifestEntry::new(property_id(&source_url), source_url, operation_type);

        if let Some(title_el) = tile.select(&self.title).next() {
            let title = title_el.text().collect::<String>().trim().to_string();
            if !title.is_empty() {
                entry.listing_title = Some(truncate_chars(&title, MAX_TITLE_LEN));
            }
        }

        if let Some(price_el) = tile.select(&self.price).next() {
            let text = price_el.text().collect::<String>();
            entry.listing_price = self.extract_price(&text);
        }

        let element = tile.value();
        if let (Some(lat), Some(lng)) = (element.attr("data-lat"), element.attr("data-long")) {
            if let (Ok(lat), Ok(lng)) = (lat.parse::<f64>(), lng.parse::<f64>()) {
                entry.latitude = Some(lat);
                entry.longitude = Some(lng);
            }
        }

        Some(entry)
    }

    /// Pull a numeric price out of display text; currency symbols and
    /// thousands separators are stripped first.
    pub fn extract_price(&self, text: &str) -> Option<f64> {
        let cleaned = text.replace(',', "");
        let captures = self.price_re.captures(&cleaned)?;
        captures.get(1)?.as_str().parse().ok()
    }

    /// Read the site's "Page 1 of N" summary, falling back to walking
    /// pagination links. Capped; `None` when the page carries no signal.
    pub fn detect_total_pages(&self, html: &str) -> Option<u32> {
        let document = Html::parse_document(html);

        if let Some(summary) = document.select(&self.pagination_summary).next() {
            let text = summary.text().collect::<String>();
            if let Some(captures) = self.summary_re.captures(&text) {
                if let Ok(total) = captures[1].replace(',', "").parse::<u32>() {
                    debug!("Detected {} total pages from summary", total);
                    return Some(total.min(PAGE_HARD_CAP));
                }
            }
        }

        let mut max_page = 1;
        for link in document.select(&self.pagination_links) {
            let text = link.text().collect::<String>();
            if let Ok(n) = text.trim().parse::<u32>() {
                max_page = max_page.max(n);
            }
            if let Some(href) = link.value().attr("href") {
                if let Some(captures) = self.page_param_re.captures(href) {
                    if let Ok(n) = captures[1].parse::<u32>() {
                        max_page = max_page.max(n);
                    }
                }
            }
        }

        (max_page > 1).then_some(max_page.min(PAGE_HARD_CAP))
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Collapse duplicate observations of the same property, keeping whichever
/// entry carries more populated fields; ties keep the first occurrence.
pub fn dedupe_entries(entries: Vec<ManifestEntry>) -> Vec<ManifestEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut seen: HashMap<String, ManifestEntry> = HashMap::new();

    for entry in entries {
        match seen.get(&entry.property_id) {
            None => {
                order.push(entry.property_id.clone());
                seen.insert(entry.property_id.clone(), entry);
            }
            Some(existing) => {
                if entry.populated_fields() > existing.populated_fields() {
                    seen.insert(entry.property_id.clone(), entry);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| seen.remove(&id))
        .collect()
}
