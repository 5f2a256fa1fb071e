use async_trait::async_trait;
use pincali_core::{property_id, Result, ScrapeRecord, SyncConfig, SyncError};
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| SyncError::Parse(e.to_string()))
}

/// Detail-page scraping as the engine consumes it. The implementation is
/// opaque to the rest of the pipeline and may be swapped for anything that
/// can turn a URL into a record.
#[async_trait]
pub trait DetailScraper: Send + Sync {
    async fn scrape(&self, url: &str) -> Result<ScrapeRecord>;
}

/// Plain-HTTP detail scraper covering the fields a listing detail page
/// exposes in its markup. Sites that gate detail pages behind captchas or
/// logins need an external scraper implementing [`DetailScraper`] instead.
pub struct HttpDetailScraper {
    client: Client,
    title: Selector,
    price: Selector,
    description: Selector,
    address: Selector,
    images: Selector,
    price_re: Regex,
}

impl HttpDetailScraper {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            title: parse_selector("h1")?,
            price: parse_selector(".price, [itemprop=\"price\"]")?,
            description: parse_selector(".description, .property-description")?,
            address: parse_selector(".address, .property-address")?,
            images: parse_selector(".gallery img, .property-images img")?,
            price_re: Regex::new(r"(\d+(?:\.\d+)?)")
                .map_err(|e| SyncError::Parse(e.to_string()))?,
        })
    }

    fn parse_document(&self, html: &str, url: &str) -> ScrapeRecord {
        let document = Html::parse_document(html);
        let mut record = ScrapeRecord {
            property_id: Some(property_id(url)),
            source_url: Some(url.to_string()),
            ..Default::default()
        };

        if let Some(el) = document.select(&self.title).next() {
            let title = el.text().collect::<String>().trim().to_string();
            if !title.is_empty() {
                record.title = Some(title);
            }
        }

        if let Some(el) = document.select(&self.price).next() {
            let text = el.text().collect::<String>().replace(',', "");
            record.price = self
                .price_re
                .captures(&text)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok());
        }

        if let Some(el) = document.select(&self.description).next() {
            let description = el.text().collect::<String>().trim().to_string();
            if !description.is_empty() {
                record.description = Some(description);
            }
        }

        if let Some(el) = document.select(&self.address).next() {
            let address = el.text().collect::<String>().trim().to_string();
            if !address.is_empty() {
                record.address = Some(address);
            }
        }

        let images: Vec<String> = document
            .select(&self.images)
            .filter_map(|img| img.value().attr("src"))
            .map(String::from)
            .collect();
        if !images.is_empty() {
            record.main_image_url = images.first().cloned();
            record.image_urls = Some(images);
        }

        record
    }
}

#[async_trait]
impl DetailScraper for HttpDetailScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapeRecord> {
        debug!("Scraping detail page {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Scrape(format!("HTTP {} for {}", status.as_u16(), url)));
        }
        let body = response.text().await?;
        Ok(self.parse_document(&body, url))
    }
}
