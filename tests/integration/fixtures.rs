use async_trait::async_trait;
use pincali_core::{
    db::AtomicClaim, Clock, Database, ListingSource, ManualClock, OperationType, Result,
    ScrapeRecord, SyncConfig, SyncError,
};
use pincali_engine::{
    DetailScraper, DiffDetector, FetchedPage, HeadResponse, ManifestScanner, PageFetcher,
    QueueWorker, Scheduler, TierOrchestrator,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SOURCE_URL: &str = "https://site.test/sale";

/// In-memory stand-in for the listing site: listing pages served by URL and
/// HEAD responses by URL, both mutable mid-test.
#[derive(Default)]
pub struct FakeFetcher {
    pages: Mutex<HashMap<String, (u16, String)>>,
    heads: Mutex<HashMap<String, (u16, Option<String>)>>,
}

impl FakeFetcher {
    pub fn set_page(&self, url: &str, body: String) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (200, body));
    }

    pub fn set_head(&self, url: &str, status: u16, location: Option<&str>) {
        self.heads
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, location.map(String::from)));
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn get(&self, url: &str) -> Result<FetchedPage> {
        match self.pages.lock().unwrap().get(url) {
            Some((status, body)) => Ok(FetchedPage {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(FetchedPage {
                status: 404,
                body: String::new(),
            }),
        }
    }

    async fn head(&self, url: &str) -> Result<HeadResponse> {
        let (status, location) = self
            .heads
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((200, None));
        Ok(HeadResponse { status, location })
    }
}

/// Detail scraper fed from a url -> record map, with optional per-url
/// failures and an optional per-item delay to hold a tier open.
#[derive(Default)]
pub struct FakeDetailScraper {
    records: Mutex<HashMap<String, ScrapeRecord>>,
    fail_urls: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeDetailScraper {
    pub fn set_record(&self, url: &str, record: ScrapeRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(url.to_string(), record);
    }

    pub fn stock_listing(&self, slug: &str, price: f64) {
        let url = detail_url(slug);
        let record = ScrapeRecord {
            property_id: Some(pincali_core::property_id(&url)),
            source_url: Some(url.clone()),
            price: Some(price),
            title: Some(format!("Listing {}", slug)),
            description: Some("A fine property".to_string()),
            operation_type: Some(OperationType::Sale),
            ..Default::default()
        };
        self.set_record(&url, record);
    }

    pub fn fail_url(&self, url: &str) {
        self.fail_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl DetailScraper for FakeDetailScraper {
    async fn scrape(&self, url: &str) -> Result<ScrapeRecord> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_urls.lock().unwrap().contains(url) {
            return Err(SyncError::Scrape("scraper blew up".to_string()));
        }
        self.records
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| SyncError::Scrape(format!("no fixture for {}", url)))
    }
}

pub fn detail_url(slug: &str) -> String {
    format!("https://site.test/en/home/{}", slug)
}

pub fn prop_id(slug: &str) -> String {
    pincali_core::property_id(&detail_url(slug))
}

/// Render a listing page with one tile per (slug, price), plus a pagination
/// summary so full scans auto-detect their page count.
pub fn listing_page(tiles: &[(&str, f64)], page: u32, total_pages: u32) -> String {
    let tile_html: String = tiles
        .iter()
        .map(|(slug, price)| {
            format!(
                "<li class=\"property__component\">\
                 <a href=\"/en/home/{slug}\"><span class=\"title\">Listing {slug}</span></a>\
                 <ul><li class=\"price\">${price:.0}</li></ul></li>",
            )
        })
        .collect();
    format!(
        "<html><body>\
         <div class=\"pagination-summary\">Page {page} of {total_pages}</div>\
         <ul>{tile_html}</ul></body></html>",
    )
}

pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig {
        base_url: "https://site.test".to_string(),
        listing_sources: vec![ListingSource {
            name: "For Sale".to_string(),
            url: SOURCE_URL.to_string(),
            operation_type: OperationType::Sale,
        }],
        ..SyncConfig::default()
    };
    for tier in &mut config.tiers {
        tier.delay_between_pages_secs = 0.0;
        tier.delay_between_details_secs = 0.0;
    }
    // Small page budgets keep the fixtures readable.
    config.tiers[0].pages_to_scan = 2;
    config.tiers[1].pages_to_scan = 2;
    config
}

pub struct Harness {
    pub db: Arc<Database>,
    pub config: Arc<SyncConfig>,
    pub clock: Arc<ManualClock>,
    pub fetcher: Arc<FakeFetcher>,
    pub scraper: Arc<FakeDetailScraper>,
    pub scheduler: Arc<Scheduler>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let fetcher = Arc::new(FakeFetcher::default());
        let scraper = Arc::new(FakeDetailScraper::default());

        let scanner = ManifestScanner::new(
            Arc::clone(&db),
            fetcher.clone() as Arc<dyn PageFetcher>,
            Arc::clone(&config),
            Arc::clone(&clock_dyn),
        )
        .unwrap();
        let diff = DiffDetector::new(
            Arc::clone(&db),
            fetcher.clone() as Arc<dyn PageFetcher>,
            Arc::clone(&clock_dyn),
        );
        let worker = QueueWorker::new(
            Arc::clone(&db),
            scraper.clone() as Arc<dyn DetailScraper>,
            Arc::new(AtomicClaim),
            Arc::clone(&config),
            Arc::clone(&clock_dyn),
            "worker-test",
        );
        let orchestrator = Arc::new(TierOrchestrator::new(
            Arc::clone(&db),
            scanner,
            diff,
            worker,
            Arc::clone(&config),
            Arc::clone(&clock_dyn),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&db),
            orchestrator,
            Arc::clone(&config),
            clock_dyn,
        ));

        Self {
            db,
            config,
            clock,
            fetcher,
            scraper,
            scheduler,
        }
    }

    /// Serve `tiles` split across listing pages and register detail records
    /// for each of them.
    pub fn serve_listings(&self, pages: &[&[(&str, f64)]]) {
        let total = pages.len() as u32;
        for (i, tiles) in pages.iter().enumerate() {
            let page_num = i as u32 + 1;
            let url = if page_num == 1 {
                SOURCE_URL.to_string()
            } else {
                format!("{}?page={}", SOURCE_URL, page_num)
            };
            self.fetcher
                .set_page(&url, listing_page(tiles, page_num, total));
            for (slug, price) in tiles.iter() {
                self.scraper.stock_listing(slug, *price);
            }
        }
    }

    /// Seed a canonical row as if a detail scrape happened at the given
    /// moment.
    pub async fn seed_canonical(&self, slug: &str, price: f64) {
        let url = detail_url(slug);
        let record = ScrapeRecord {
            property_id: Some(prop_id(slug)),
            source_url: Some(url),
            price: Some(price),
            title: Some(format!("Listing {}", slug)),
            operation_type: Some(OperationType::Sale),
            ..Default::default()
        };
        self.db
            .upsert_from_scrape(&prop_id(slug), &record, self.clock.now())
            .await
            .unwrap();
    }
}
