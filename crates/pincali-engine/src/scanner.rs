use crate::parse::{dedupe_entries, ListingPageParser};
use crate::{CancelToken, PageFetcher};
use pincali_core::{
    Clock, Database, ListingSource, ManifestEntry, Result, SyncConfig, SyncError, TierSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pages assumed when a full scan is requested but the site gives no
/// pagination signal.
const FALLBACK_TOTAL_PAGES: u32 = 100;

#[derive(Debug, Default, Clone)]
pub struct ScanResult {
    pub pages_scanned: i64,
    pub properties_found: i64,
    pub new_properties: i64,
    pub price_changes: i64,
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

impl ScanResult {
    fn absorb(&mut self, other: ScanResult) {
        self.pages_scanned += other.pages_scanned;
        self.properties_found += other.properties_found;
        self.new_properties += other.new_properties;
        self.price_changes += other.price_changes;
        self.errors.extend(other.errors);
    }
}

/// Walks listing pages, extracts observations and upserts them into the
/// manifest. Detail pages are never touched here.
pub struct ManifestScanner {
    db: Arc<Database>,
    fetcher: Arc<dyn PageFetcher>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    parser: ListingPageParser,
}

impl ManifestScanner {
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn PageFetcher>,
        config: Arc<SyncConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            db,
            fetcher,
            config,
            clock,
            parser: ListingPageParser::new()?,
        })
    }

    /// Scan one listing source for up to `max_pages` pages (0 = all pages,
    /// auto-detected from the site's pagination).
    pub async fn run_scan(
        &self,
        source: &ListingSource,
        max_pages: u32,
        run_id: &str,
        tier: &TierSettings,
        cancel: &CancelToken,
    ) -> Result<ScanResult> {
        let started = self.clock.now();
        let mut result = ScanResult::default();
        let delay = Duration::from_secs_f64(tier.delay_between_pages_secs);

        let max_pages = if max_pages == 0 {
            let detected = self.detect_total_pages(&source.url, delay).await;
            info!("Auto-detected {} total pages for {}", detected, source.name);
            detected
        } else {
            max_pages
        };

        let mut all_entries: Vec<ManifestEntry> = Vec::new();
        let mut failed_pages: Vec<(u32, String)> = Vec::new();

        for page_num in 1..=max_pages {
            if cancel.is_cancelled() {
                result.errors.push("Scan cancelled".to_string());
                break;
            }

            let page_url = page_url_for(&source.url, page_num);
            match self.fetch_listing_page(&page_url, delay).await {
                Ok(body) => {
                    let entries =
                        self.parser
                            .parse_listing_page(&body, &page_url, source.operation_type);
                    if entries.is_empty() {
                        failed_pages.push((page_num, page_url));
                        result
                            .errors
                            .push(format!("No properties found on page {}", page_num));
                    } else {
                        debug!("Page {}: found {} properties", page_num, entries.len());
                        result.pages_scanned += 1;
                        all_entries.extend(entries);
                    }
                }
                Err(e) => {
                    result.errors.push(format!("Error on page {}: {}", page_num, e));
                    failed_pages.push((page_num, page_url));
                }
            }

            if failed_pages.len() > tier.max_page_failures {
                let message = format!(
                    "Too many page failures ({}), aborting scan of {}",
                    failed_pages.len(),
                    source.name
                );
                warn!("{}", message);
                result.errors.push(message);
                break;
            }

            if page_num % 10 == 0 {
                info!(
                    "Progress: {}/{} pages, {} properties found",
                    page_num,
                    max_pages,
                    all_entries.len()
                );
            }

            if page_num < max_pages {
                tokio::time::sleep(delay).await;
            }
        }

        // One retry pass over failed pages, with doubled delay.
        if !failed_pages.is_empty() && !cancel.is_cancelled() {
            info!("Retrying {} failed pages", failed_pages.len());
            for (page_num, page_url) in &failed_pages {
                tokio::time::sleep(delay * 2).await;
                match self.fetch_listing_page(page_url, delay).await {
                    Ok(body) => {
                        let entries = self.parser.parse_listing_page(
                            &body,
                            page_url,
                            source.operation_type,
                        );
                        if !entries.is_empty() {
                            result.pages_scanned += 1;
                            all_entries.extend(entries);
                        }
                    }
                    Err(e) => warn!("Retry failed for page {}: {}", page_num, e),
                }
            }
        }

        let unique = dedupe_entries(all_entries);
        result.properties_found = unique.len() as i64;

        if !unique.is_empty() {
            let (new_count, price_changes) = self
                .db
                .upsert_manifest_entries(&unique, run_id, &self.config, self.clock.now())
                .await?;
            result.new_properties = new_count as i64;
            result.price_changes = price_changes as i64;
        }

        result.duration_ms = (self.clock.now() - started).num_milliseconds();
        info!(
            "Scan of {} completed: {} pages, {} properties, {} new, {} price changes",
            source.name,
            result.pages_scanned,
            result.properties_found,
            result.new_properties,
            result.price_changes
        );

        Ok(result)
    }

    /// Scan every configured source, accumulating counts.
    pub async fn run_multi_source(
        &self,
        max_pages_per_source: u32,
        run_id: &str,
        tier: &TierSettings,
        cancel: &CancelToken,
    ) -> Result<ScanResult> {
        let started = self.clock.now();
        let mut combined = ScanResult::default();

        info!(
            "Starting multi-source manifest scan: {} sources",
            self.config.listing_sources.len()
        );

        for source in &self.config.listing_sources {
            if cancel.is_cancelled() {
                combined.errors.push("Scan cancelled".to_string());
                break;
            }
            info!("Scanning source: {} ({})", source.name, source.operation_type);
            let source_result = self
                .run_scan(source, max_pages_per_source, run_id, tier, cancel)
                .await?;
            combined.absorb(source_result);
        }

        combined.duration_ms = (self.clock.now() - started).num_milliseconds();
        Ok(combined)
    }

    /// Fetch a listing page with a single retry at doubled delay on timeout,
    /// transport error or 5xx. Non-retriable statuses fail immediately.
    async fn fetch_listing_page(&self, url: &str, delay: Duration) -> Result<String> {
        match self.fetcher.get(url).await {
            Ok(page) if page.status == 200 => return Ok(page.body),
            Ok(page) if page.status < 500 => {
                return Err(SyncError::Scrape(format!("HTTP {} for {}", page.status, url)));
            }
            Ok(page) => debug!("HTTP {} for {}, retrying", page.status, url),
            Err(e) => debug!("Fetch error for {}: {}, retrying", url, e),
        }

        tokio::time::sleep(delay * 2).await;

        let page = self.fetcher.get(url).await?;
        if page.status == 200 {
            Ok(page.body)
        } else {
            Err(SyncError::Scrape(format!("HTTP {} for {}", page.status, url)))
        }
    }

    async fn detect_total_pages(&self, source_url: &str, delay: Duration) -> u32 {
        match self.fetch_listing_page(source_url, delay).await {
            Ok(body) => self
                .parser
                .detect_total_pages(&body)
                .unwrap_or(FALLBACK_TOTAL_PAGES),
            Err(e) => {
                warn!("Could not determine total pages for {}: {}", source_url, e);
                FALLBACK_TOTAL_PAGES
            }
        }
    }
}

/// Page 1 uses the bare source URL; later pages append `page=K`.
fn page_url_for(source_url: &str, page_num: u32) -> String {
    if page_num == 1 {
        source_url.to_string()
    } else {
        let separator = if source_url.contains('?') { '&' } else { '?' };
        format!("{}{}page={}", source_url, separator, page_num)
    }
}
