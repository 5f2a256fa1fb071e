use crate::{CancelToken, DetailScraper};
use pincali_core::{db::ClaimStrategy, Clock, Database, Result, SyncConfig, SyncError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Entries claimed per round trip while draining.
const CLAIM_BATCH_SIZE: usize = 10;

#[derive(Debug, Default, Clone)]
pub struct QueueProcessResult {
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub duration_ms: i64,
}

/// Drains the scrape queue: claim a batch, scrape each entry, upsert the
/// canonical record, mark the entry done. One worker by default; running N
/// of them with distinct ids is safe because claiming is atomic.
pub struct QueueWorker {
    db: Arc<Database>,
    scraper: Arc<dyn DetailScraper>,
    claim: Arc<dyn ClaimStrategy>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl QueueWorker {
    pub fn new(
        db: Arc<Database>,
        scraper: Arc<dyn DetailScraper>,
        claim: Arc<dyn ClaimStrategy>,
        config: Arc<SyncConfig>,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            scraper,
            claim,
            config,
            clock,
            worker_id: worker_id.into(),
        }
    }

    pub async fn drain(
        &self,
        max_items: usize,
        rate_limit: Duration,
        cancel: &CancelToken,
    ) -> Result<QueueProcessResult> {
        let started = self.clock.now();
        let mut result = QueueProcessResult::default();

        info!("Processing scrape queue (max {} items)", max_items);

        self.db
            .release_stale_claims(self.config.queue_stale_claim_minutes, self.clock.now())
            .await?;

        while (result.processed as usize) < max_items {
            if cancel.is_cancelled() {
                info!("Queue drain cancelled after {} items", result.processed);
                break;
            }

            let batch_size = CLAIM_BATCH_SIZE.min(max_items - result.processed as usize);
            let claimed = self
                .claim
                .claim_batch(&self.db, batch_size, &self.worker_id, self.clock.now())
                .await?;

            if claimed.is_empty() {
                break;
            }

            for entry in claimed {
                if cancel.is_cancelled() {
                    break;
                }

                match self.process_entry(&entry.source_url, &entry.property_id).await {
                    Ok(()) => {
                        self.db
                            .complete_queue_entry(&entry.id, true, None, self.clock.now())
                            .await?;
                        result.succeeded += 1;
                    }
                    Err(e) => {
                        error!("Error scraping {}: {}", entry.property_id, e);
                        self.db
                            .complete_queue_entry(
                                &entry.id,
                                false,
                                Some(&e.to_string()),
                                self.clock.now(),
                            )
                            .await?;
                        result.failed += 1;
                    }
                }
                result.processed += 1;

                if result.processed % 50 == 0 {
                    info!(
                        "Queue progress: {}/{} ({} succeeded, {} failed)",
                        result.processed, max_items, result.succeeded, result.failed
                    );
                }

                if (result.processed as usize) < max_items {
                    tokio::time::sleep(rate_limit).await;
                }
            }
        }

        result.duration_ms = (self.clock.now() - started).num_milliseconds();
        info!(
            "Queue processing completed: {} processed, {} succeeded, {} failed",
            result.processed, result.succeeded, result.failed
        );

        Ok(result)
    }

    async fn process_entry(&self, source_url: &str, queued_property_id: &str) -> Result<()> {
        let mut record = self.scraper.scrape(source_url).await?;

        if record.is_empty() {
            return Err(SyncError::Scrape(
                "No data returned from scraper".to_string(),
            ));
        }

        if record.source_url.is_none() {
            record.source_url = Some(source_url.to_string());
        }

        // The scraper's computed id wins: it derives from the canonical URL.
        let final_id = match record.property_id.as_deref() {
            Some(id) if !id.is_empty() => {
                if id != queued_property_id {
                    warn!(
                        "Scraper id {} differs from queued id {}",
                        id, queued_property_id
                    );
                }
                id.to_string()
            }
            _ => queued_property_id.to_string(),
        };

        // Detail pages do not restate the operation the listing was filed
        // under; recover it from the manifest when the scraper left it unset.
        if record.operation_type.is_none() {
            if let Some(manifest) = self.db.get_manifest_entry(&final_id).await? {
                record.operation_type = manifest.operation_type;
            }
        }

        self.db
            .upsert_from_scrape(&final_id, &record, self.clock.now())
            .await?;
        Ok(())
    }
}
