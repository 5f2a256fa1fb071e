use crate::{CancelToken, PageFetcher};
use pincali_core::{db::RemovalCandidate, Clock, Database, OperationType, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between removal-verification probes.
const HEAD_PROBE_DELAY_SECS: f64 = 1.0;

/// Redirect targets containing these markers point at search or listing
/// pages, which the site serves when a property is gone.
const SEARCH_REDIRECT_MARKERS: [&str; 4] = ["search", "properties", "filter", "?"];

#[derive(Debug, Clone)]
pub struct PriceChange {
    pub property_id: String,
    pub old_price: f64,
    pub new_price: f64,
    pub percent_change: f64,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemovalVerification {
    pub property_id: String,
    pub confirmed_removed: bool,
    pub http_status: Option<u16>,
    pub redirect_url: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default, Clone)]
pub struct DiffOutcome {
    pub new_properties: Vec<String>,
    pub price_changes: Vec<PriceChange>,
    pub removal_candidates: Vec<RemovalCandidate>,
    pub confirmed_removals: Vec<RemovalVerification>,
    pub relisted_properties: Vec<String>,
    pub duration_ms: i64,
}

impl DiffOutcome {
    pub fn confirmed_removal_count(&self) -> usize {
        self.confirmed_removals
            .iter()
            .filter(|r| r.confirmed_removed)
            .count()
    }
}

/// What a diff run should do beyond the always-on new/price/relist
/// detection. Missing-count maintenance only makes sense after a scan that
/// covered a source completely; a prefix scan proves nothing about absence.
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    pub verify_removals: bool,
    pub maintain_missing_counts: bool,
    pub min_missing_count: i64,
}

/// Compares the manifest after a scan against the canonical store and
/// reconciles lifecycle state.
pub struct DiffDetector {
    db: Arc<Database>,
    fetcher: Arc<dyn PageFetcher>,
    clock: Arc<dyn Clock>,
}

impl DiffDetector {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn PageFetcher>, clock: Arc<dyn Clock>) -> Self {
        Self { db, fetcher, clock }
    }

    pub async fn detect_new_properties(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = self.db.new_property_ids(run_id).await?;
        info!("Detected {} new properties", ids.len());
        Ok(ids)
    }

    pub async fn detect_price_changes(&self, run_id: &str) -> Result<Vec<PriceChange>> {
        let flagged = self.db.price_changed_entries(run_id).await?;
        if flagged.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = flagged.iter().map(|m| m.property_id.as_str()).collect();
        let live_prices = self.db.canonical_prices(&ids).await?;

        let mut changes = Vec::new();
        for record in &flagged {
            let old_price = live_prices
                .get(record.property_id.as_str())
                .copied()
                .flatten();
            if let (Some(old_price), Some(new_price)) = (old_price, record.listing_price) {
                if old_price > 0.0 && old_price != new_price {
                    changes.push(PriceChange {
                        property_id: record.property_id.clone(),
                        old_price,
                        new_price,
                        percent_change: (new_price - old_price).abs() / old_price * 100.0,
                        source_url: Some(record.source_url.clone()),
                    });
                }
            }
        }

        info!("Detected {} price changes", changes.len());
        Ok(changes)
    }

    pub async fn detect_relisted_properties(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = self.db.relisted_property_ids(run_id).await?;
        if !ids.is_empty() {
            info!("Detected {} relisted properties", ids.len());
        }
        Ok(ids)
    }

    /// Probe a removal candidate's URL and decide whether it is really gone.
    /// A probe failure is never fatal; the candidate simply stays
    /// unconfirmed with the reason recorded.
    async fn verify_candidate(&self, candidate: &RemovalCandidate) -> RemovalVerification {
        if candidate.source_url.is_empty() {
            return RemovalVerification {
                property_id: candidate.property_id.clone(),
                confirmed_removed: true,
                http_status: None,
                redirect_url: None,
                reason: "No source URL available".to_string(),
            };
        }

        match self.fetcher.head(&candidate.source_url).await {
            Ok(response) => {
                let status = response.status;
                match status {
                    404 => RemovalVerification {
                        property_id: candidate.property_id.clone(),
                        confirmed_removed: true,
                        http_status: Some(status),
                        redirect_url: None,
                        reason: "Page not found (404)".to_string(),
                    },
                    301 | 302 | 303 | 307 | 308 => {
                        let redirect = response.location.unwrap_or_default();
                        let lowered = redirect.to_lowercase();
                        if SEARCH_REDIRECT_MARKERS.iter().any(|m| lowered.contains(m)) {
                            RemovalVerification {
                                property_id: candidate.property_id.clone(),
                                confirmed_removed: true,
                                http_status: Some(status),
                                redirect_url: Some(redirect),
                                reason: "Redirected to search/listing page".to_string(),
                            }
                        } else {
                            RemovalVerification {
                                property_id: candidate.property_id.clone(),
                                confirmed_removed: false,
                                http_status: Some(status),
                                redirect_url: Some(redirect),
                                reason: "Redirected to another page".to_string(),
                            }
                        }
                    }
                    200 => RemovalVerification {
                        property_id: candidate.property_id.clone(),
                        confirmed_removed: false,
                        http_status: Some(status),
                        redirect_url: None,
                        reason: "Page still exists (200 OK)".to_string(),
                    },
                    other => RemovalVerification {
                        property_id: candidate.property_id.clone(),
                        confirmed_removed: false,
                        http_status: Some(other),
                        redirect_url: None,
                        reason: format!("Unexpected status code: {}", other),
                    },
                }
            }
            Err(e) => RemovalVerification {
                property_id: candidate.property_id.clone(),
                confirmed_removed: false,
                http_status: None,
                redirect_url: None,
                reason: format!("Error: {}", e),
            },
        }
    }

    pub async fn confirm_removals(
        &self,
        candidates: &[RemovalCandidate],
        cancel: &CancelToken,
    ) -> Vec<RemovalVerification> {
        info!("Verifying {} removal candidates", candidates.len());
        let delay = Duration::from_secs_f64(HEAD_PROBE_DELAY_SECS);

        let mut results = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            results.push(self.verify_candidate(candidate).await);
            if i + 1 < candidates.len() {
                tokio::time::sleep(delay).await;
            }
        }

        let confirmed = results.iter().filter(|r| r.confirmed_removed).count();
        info!("Confirmed {}/{} removals", confirmed, candidates.len());
        results
    }

    /// Write verification outcomes back: confirmed candidates become
    /// `confirmed_removed`/`removed`, the rest get their missing counter
    /// reset.
    pub async fn apply_removal_results(&self, results: &[RemovalVerification]) -> Result<()> {
        let now = self.clock.now();
        let confirmed: Vec<&str> = results
            .iter()
            .filter(|r| r.confirmed_removed)
            .map(|r| r.property_id.as_str())
            .collect();
        let still_alive: Vec<&str> = results
            .iter()
            .filter(|r| !r.confirmed_removed)
            .map(|r| r.property_id.as_str())
            .collect();

        if !confirmed.is_empty() {
            let updated = self.db.mark_confirmed_removed(&confirmed, now).await?;
            info!("Marked {} properties as confirmed_removed", updated);
        }
        if !still_alive.is_empty() {
            let updated = self.db.reset_missing_counts(&still_alive, now).await?;
            info!("Reset missing count for {} properties", updated);
        }
        Ok(())
    }

    /// The complete diff: new, price, relist, and (optionally) missing-count
    /// maintenance plus removal confirmation.
    pub async fn run_full_diff(
        &self,
        run_id: &str,
        scanned_ops: &[OperationType],
        options: DiffOptions,
        cancel: &CancelToken,
    ) -> Result<DiffOutcome> {
        let started = self.clock.now();
        let mut outcome = DiffOutcome::default();

        info!("Running diff for run {}", run_id);

        outcome.new_properties = self.detect_new_properties(run_id).await?;
        outcome.price_changes = self.detect_price_changes(run_id).await?;
        outcome.relisted_properties = self.detect_relisted_properties(run_id).await?;

        if options.maintain_missing_counts {
            self.db
                .maintain_missing_counts(run_id, scanned_ops, self.clock.now())
                .await?;

            outcome.removal_candidates = self
                .db
                .removal_candidates(options.min_missing_count)
                .await?;
            info!(
                "Found {} removal candidates (missing >= {} consecutive scans)",
                outcome.removal_candidates.len(),
                options.min_missing_count
            );

            if options.verify_removals && !outcome.removal_candidates.is_empty() {
                outcome.confirmed_removals = self
                    .confirm_removals(&outcome.removal_candidates, cancel)
                    .await;
                if let Err(e) = self.apply_removal_results(&outcome.confirmed_removals).await {
                    // Batch errors are retried at the next tier execution.
                    warn!("Error applying removal results: {}", e);
                }
            }
        } else {
            debug!("Skipping missing-count maintenance for run {}", run_id);
        }

        if !outcome.relisted_properties.is_empty() {
            let ids: Vec<&str> = outcome
                .relisted_properties
                .iter()
                .map(String::as_str)
                .collect();
            self.db.mark_relisted(&ids, self.clock.now()).await?;
        }

        outcome.duration_ms = (self.clock.now() - started).num_milliseconds();
        info!(
            "Diff completed: {} new, {} price changes, {} relisted, {} confirmed removals",
            outcome.new_properties.len(),
            outcome.price_changes.len(),
            outcome.relisted_properties.len(),
            outcome.confirmed_removal_count()
        );

        Ok(outcome)
    }

    /// Copy observed listing prices onto the canonical rows.
    pub async fn update_manifest_prices(&self, run_id: &str) -> Result<u64> {
        let updated = self
            .db
            .update_manifest_prices(run_id, self.clock.now())
            .await?;
        info!("Updated manifest prices for {} properties", updated);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{FetchedPage, HeadResponse};
    use async_trait::async_trait;
    use chrono::Utc;
    use pincali_core::{ManifestEntry, ManualClock, ScrapeRecord, SyncConfig, SyncError};
    use std::collections::HashMap;

    struct HeadFetcher {
        responses: HashMap<String, (u16, Option<String>)>,
        error_urls: Vec<String>,
    }

    #[async_trait]
    impl crate::PageFetcher for HeadFetcher {
        async fn get(&self, _url: &str) -> Result<FetchedPage> {
            Ok(FetchedPage {
                status: 200,
                body: String::new(),
            })
        }

        async fn head(&self, url: &str) -> Result<HeadResponse> {
            if self.error_urls.iter().any(|u| u == url) {
                return Err(SyncError::Scrape("connection reset".to_string()));
            }
            let (status, location) = self
                .responses
                .get(url)
                .cloned()
                .unwrap_or((200, None));
            Ok(HeadResponse { status, location })
        }
    }

    async fn seed_property(db: &Database, id: &str, price: f64) {
        let record = ScrapeRecord {
            source_url: Some(format!("https://site.test/p/{}", id)),
            price: Some(price),
            title: Some(id.to_string()),
            operation_type: Some(OperationType::Sale),
            ..Default::default()
        };
        db.upsert_from_scrape(id, &record, Utc::now()).await.unwrap();
    }

    async fn observe(db: &Database, id: &str, run_id: &str, price: Option<f64>) {
        let entry = ManifestEntry {
            property_id: id.to_string(),
            source_url: format!("https://site.test/p/{}", id),
            listing_price: price,
            listing_title: None,
            latitude: None,
            longitude: None,
            operation_type: Some(OperationType::Sale),
        };
        db.upsert_manifest_entries(&[entry], run_id, &SyncConfig::default(), Utc::now())
            .await
            .unwrap();
    }

    fn detector(db: Arc<Database>, fetcher: HeadFetcher) -> DiffDetector {
        DiffDetector::new(
            db,
            Arc::new(fetcher),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    fn full_options() -> DiffOptions {
        DiffOptions {
            verify_removals: true,
            maintain_missing_counts: true,
            min_missing_count: 2,
        }
    }

    #[tokio::test]
    async fn test_price_change_detection() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        seed_property(&db, "p1", 100_000.0).await;
        observe(&db, "p1", "run-1", Some(105_000.0)).await;

        let detector = detector(
            Arc::clone(&db),
            HeadFetcher {
                responses: HashMap::new(),
                error_urls: vec![],
            },
        );

        let changes = detector.detect_price_changes("run-1").await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_price, 100_000.0);
        assert_eq!(changes[0].new_price, 105_000.0);
        assert!((changes[0].percent_change - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_head_status_mapping() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let candidates: Vec<RemovalCandidate> = ["gone", "moved", "alive", "weird", "broken"]
            .iter()
            .map(|id| RemovalCandidate {
                property_id: id.to_string(),
                source_url: format!("https://site.test/p/{}", id),
                last_manifest_seen_at: None,
                consecutive_missing_count: 2,
            })
            .collect();

        let mut responses = HashMap::new();
        responses.insert(
            "https://site.test/p/gone".to_string(),
            (404, None),
        );
        responses.insert(
            "https://site.test/p/moved".to_string(),
            (
                301,
                Some("https://site.test/en/properties/properties-for-sale".to_string()),
            ),
        );
        responses.insert("https://site.test/p/alive".to_string(), (200, None));
        responses.insert("https://site.test/p/weird".to_string(), (503, None));

        let detector = detector(
            db,
            HeadFetcher {
                responses,
                error_urls: vec!["https://site.test/p/broken".to_string()],
            },
        );

        let results = detector
            .confirm_removals(&candidates, &CancelToken::new())
            .await;
        let by_id: HashMap<&str, &RemovalVerification> = results
            .iter()
            .map(|r| (r.property_id.as_str(), r))
            .collect();

        assert!(by_id["gone"].confirmed_removed);
        assert!(by_id["moved"].confirmed_removed);
        assert!(!by_id["alive"].confirmed_removed);
        assert!(!by_id["weird"].confirmed_removed);
        assert!(!by_id["broken"].confirmed_removed);
        assert!(by_id["broken"].reason.starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_redirect_to_property_page_not_confirmed() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let candidate = RemovalCandidate {
            property_id: "p".to_string(),
            source_url: "https://site.test/p/p".to_string(),
            last_manifest_seen_at: None,
            consecutive_missing_count: 2,
        };

        let mut responses = HashMap::new();
        responses.insert(
            "https://site.test/p/p".to_string(),
            (302, Some("https://site.test/en/home/other-listing".to_string())),
        );

        let detector = detector(
            db,
            HeadFetcher {
                responses,
                error_urls: vec![],
            },
        );

        let result = detector.verify_candidate(&candidate).await;
        assert!(!result.confirmed_removed);
        assert_eq!(result.reason, "Redirected to another page");
    }

    #[tokio::test]
    async fn test_full_diff_confirms_removal_end_to_end() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        // "stays" is observed; "vanished" was missed once before and is
        // missed again this run.
        seed_property(&db, "stays", 1.0).await;
        seed_property(&db, "vanished", 1.0).await;
        db.maintain_missing_counts("warmup", &[OperationType::Sale], Utc::now())
            .await
            .unwrap();

        observe(&db, "stays", "run-d", Some(1.0)).await;

        let mut responses = HashMap::new();
        responses.insert("https://site.test/p/vanished".to_string(), (404, None));

        let detector = detector(
            Arc::clone(&db),
            HeadFetcher {
                responses,
                error_urls: vec![],
            },
        );

        let outcome = detector
            .run_full_diff(
                "run-d",
                &[OperationType::Sale],
                full_options(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.removal_candidates.len(), 1);
        assert_eq!(outcome.confirmed_removal_count(), 1);

        let gone = db.get_canonical("vanished").await.unwrap().unwrap();
        assert_eq!(gone.listing_status, pincali_core::ListingStatus::ConfirmedRemoved);
        assert_eq!(gone.status, pincali_core::RecordStatus::Removed);

        let kept = db.get_canonical("stays").await.unwrap().unwrap();
        assert_eq!(kept.consecutive_missing_count, 0);
    }

    #[tokio::test]
    async fn test_unconfirmed_candidate_gets_reset() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        seed_property(&db, "hidden", 1.0).await;
        // Missed twice without observation.
        db.maintain_missing_counts("w1", &[OperationType::Sale], Utc::now())
            .await
            .unwrap();

        let mut responses = HashMap::new();
        responses.insert("https://site.test/p/hidden".to_string(), (200, None));

        let detector = detector(
            Arc::clone(&db),
            HeadFetcher {
                responses,
                error_urls: vec![],
            },
        );

        let outcome = detector
            .run_full_diff(
                "run-u",
                &[OperationType::Sale],
                full_options(),
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.removal_candidates.len(), 1);
        assert_eq!(outcome.confirmed_removal_count(), 0);

        let still_here = db.get_canonical("hidden").await.unwrap().unwrap();
        assert_eq!(still_here.listing_status, pincali_core::ListingStatus::Active);
        assert_eq!(still_here.consecutive_missing_count, 0);
    }

    #[tokio::test]
    async fn test_relist_updates_canonical() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        seed_property(&db, "returned", 1.0).await;
        db.mark_confirmed_removed(&["returned"], Utc::now())
            .await
            .unwrap();
        observe(&db, "returned", "run-r", Some(1.0)).await;

        let detector = detector(
            Arc::clone(&db),
            HeadFetcher {
                responses: HashMap::new(),
                error_urls: vec![],
            },
        );

        let outcome = detector
            .run_full_diff(
                "run-r",
                &[OperationType::Sale],
                DiffOptions {
                    verify_removals: false,
                    maintain_missing_counts: false,
                    min_missing_count: 2,
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.relisted_properties, vec!["returned".to_string()]);
        let record = db.get_canonical("returned").await.unwrap().unwrap();
        assert_eq!(record.listing_status, pincali_core::ListingStatus::Relisted);
        assert_eq!(record.status, pincali_core::RecordStatus::Active);
        assert_eq!(record.consecutive_missing_count, 0);
    }
}
