use crate::diff::{DiffDetector, DiffOptions, PriceChange};
use crate::queue_worker::QueueWorker;
use crate::scanner::{ManifestScanner, ScanResult};
use crate::CancelToken;
use pincali_core::{
    db::RunCounters, Clock, Database, OperationType, QueueReason, Result, RunStatus, SyncConfig,
    TierSettings,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct TierResult {
    pub tier_level: i64,
    pub tier_name: String,
    pub success: bool,
    pub pages_scanned: i64,
    pub new_properties: i64,
    pub price_changes: i64,
    pub removals_confirmed: i64,
    pub relisted_count: i64,
    pub properties_queued: i64,
    pub properties_scraped: i64,
    pub duration_ms: i64,
    pub errors: Vec<String>,
    pub run_id: Option<String>,
}

impl TierResult {
    fn new(tier_level: i64, tier_name: &str) -> Self {
        Self {
            tier_level,
            tier_name: tier_name.to_string(),
            success: false,
            pages_scanned: 0,
            new_properties: 0,
            price_changes: 0,
            removals_confirmed: 0,
            relisted_count: 0,
            properties_queued: 0,
            properties_scraped: 0,
            duration_ms: 0,
            errors: Vec::new(),
            run_id: None,
        }
    }

    fn absorb_scan(&mut self, scan: ScanResult) {
        self.pages_scanned += scan.pages_scanned;
        self.new_properties += scan.new_properties;
        self.price_changes += scan.price_changes;
        self.errors.extend(scan.errors);
    }

    fn counters(&self) -> RunCounters {
        RunCounters {
            pages_scanned: self.pages_scanned,
            new_properties_found: self.new_properties,
            price_changes_detected: self.price_changes,
            removals_confirmed: self.removals_confirmed,
            properties_queued: self.properties_queued,
            properties_scraped: self.properties_scraped,
            properties_updated: self.properties_scraped,
            error_count: self.errors.len() as i64,
            error_summary: if self.errors.is_empty() {
                None
            } else {
                Some(self.errors[..self.errors.len().min(5)].join("; "))
            },
            execution_time_ms: self.duration_ms,
        }
    }
}

/// Runs the per-tier recipes end to end: scan, diff, enqueue, drain,
/// bookkeeping. One tier executes at a time; the scheduler enforces that.
pub struct TierOrchestrator {
    db: Arc<Database>,
    scanner: ManifestScanner,
    diff: DiffDetector,
    worker: QueueWorker,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
}

impl TierOrchestrator {
    pub fn new(
        db: Arc<Database>,
        scanner: ManifestScanner,
        diff: DiffDetector,
        worker: QueueWorker,
        config: Arc<SyncConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            scanner,
            diff,
            worker,
            config,
            clock,
        }
    }

    /// Execute one tier. Partial failures (pages, probes, scrapes) are
    /// counted in the result; only an error escaping the recipe itself flips
    /// `success` to false and the run to `failed`.
    pub async fn run_tier(&self, tier_level: i64, cancel: &CancelToken) -> Result<TierResult> {
        let tier = self.config.tier(tier_level)?.clone();
        let started = self.clock.now();
        let mut result = TierResult::new(tier_level, &tier.name);

        info!("Starting Tier {}: {}", tier_level, tier.display_name);

        let run_id = match self.db.create_sync_run(tier_level, &tier.name, started).await {
            Ok(id) => id,
            Err(e) => {
                let message = format!("Fatal error in tier {}: {}", tier_level, e);
                error!("{}", message);
                result.errors.push(message);
                result.duration_ms = (self.clock.now() - started).num_milliseconds();
                return Ok(result);
            }
        };
        result.run_id = Some(run_id.clone());

        let session_id = self
            .db
            .create_scraping_session(
                &format!("Tier Sync - {}", tier.name),
                &self.config.base_url,
                started,
            )
            .await
            .map_err(|e| warn!("Error creating scraping session: {}", e))
            .ok();

        let body = match tier_level {
            1 => self.tier_1_hot_listings(&tier, &run_id, &mut result, cancel).await,
            2 => self.tier_2_daily_sync(&tier, &run_id, &mut result, cancel).await,
            3 => self.tier_3_weekly_deep(&tier, &run_id, &mut result, cancel).await,
            _ => self.tier_4_monthly_refresh(&tier, &run_id, &mut result, cancel).await,
        };

        let status = match body {
            Ok(()) if cancel.is_cancelled() => {
                result.errors.push("Tier cancelled".to_string());
                RunStatus::Cancelled
            }
            Ok(()) => {
                result.success = true;
                RunStatus::Completed
            }
            Err(e) => {
                let message = format!("Error in tier {}: {}", tier_level, e);
                error!("{}", message);
                result.errors.push(message);
                RunStatus::Failed
            }
        };

        result.duration_ms = (self.clock.now() - started).num_milliseconds();

        if let Err(e) = self
            .db
            .finish_sync_run(&run_id, status, &result.counters(), self.clock.now())
            .await
        {
            error!("Error updating sync run {}: {}", run_id, e);
        }
        if let Some(session_id) = session_id {
            if let Err(e) = self
                .db
                .close_scraping_session(&session_id, status, self.clock.now())
                .await
            {
                warn!("Error closing scraping session: {}", e);
            }
        }

        info!(
            "Tier {} completed in {}ms: {} new, {} price changes, {} removals, {} scraped",
            tier_level,
            result.duration_ms,
            result.new_properties,
            result.price_changes,
            result.removals_confirmed,
            result.properties_scraped
        );

        Ok(result)
    }

    /// Tier 1: fast scan of the first pages of every source, new properties
    /// only, immediate drain.
    async fn tier_1_hot_listings(
        &self,
        tier: &TierSettings,
        run_id: &str,
        result: &mut TierResult,
        cancel: &CancelToken,
    ) -> Result<()> {
        let scan = self
            .scanner
            .run_multi_source(tier.pages_to_scan, run_id, tier, cancel)
            .await?;
        result.absorb_scan(scan);

        let new_ids = self.diff.detect_new_properties(run_id).await?;
        result.properties_queued = self
            .enqueue_ids(&new_ids, QueueReason::NewProperty, run_id)
            .await?;

        if result.properties_queued > 0 {
            self.drain_queue(tier, result, cancel).await?;
        }

        self.db
            .clear_manifest_flags(run_id, self.clock.now())
            .await?;
        Ok(())
    }

    /// Tier 2: first ~100 pages per source, new + price + relisted, no
    /// removal work.
    async fn tier_2_daily_sync(
        &self,
        tier: &TierSettings,
        run_id: &str,
        result: &mut TierResult,
        cancel: &CancelToken,
    ) -> Result<()> {
        let scan = self
            .scanner
            .run_multi_source(tier.pages_to_scan, run_id, tier, cancel)
            .await?;
        result.absorb_scan(scan);

        let outcome = self
            .diff
            .run_full_diff(
                run_id,
                &self.scanned_operation_types(),
                DiffOptions {
                    verify_removals: false,
                    maintain_missing_counts: false,
                    min_missing_count: self.config.min_missing_count_for_removal,
                },
                cancel,
            )
            .await?;
        result.relisted_count = outcome.relisted_properties.len() as i64;

        self.enqueue_ids(&outcome.new_properties, QueueReason::NewProperty, run_id)
            .await?;
        self.enqueue_price_changes(&outcome.price_changes, run_id).await?;
        self.enqueue_ids(&outcome.relisted_properties, QueueReason::Relisted, run_id)
            .await?;
        result.properties_queued = self.db.pending_count().await?;

        if result.properties_queued > 0 {
            self.drain_queue(tier, result, cancel).await?;
        }

        self.diff.update_manifest_prices(run_id).await?;
        self.db
            .clear_manifest_flags(run_id, self.clock.now())
            .await?;
        Ok(())
    }

    /// Tier 3: full manifest scan, complete diff with removal verification,
    /// stale backfill with half the queue budget.
    async fn tier_3_weekly_deep(
        &self,
        tier: &TierSettings,
        run_id: &str,
        result: &mut TierResult,
        cancel: &CancelToken,
    ) -> Result<()> {
        let scan = self
            .scanner
            .run_multi_source(0, run_id, tier, cancel)
            .await?;
        result.absorb_scan(scan);

        let outcome = self
            .diff
            .run_full_diff(
                run_id,
                &self.scanned_operation_types(),
                DiffOptions {
                    verify_removals: true,
                    maintain_missing_counts: true,
                    min_missing_count: self.config.min_missing_count_for_removal,
                },
                cancel,
            )
            .await?;
        result.removals_confirmed = outcome.confirmed_removal_count() as i64;
        result.relisted_count = outcome.relisted_properties.len() as i64;

        self.enqueue_ids(&outcome.new_properties, QueueReason::NewProperty, run_id)
            .await?;
        self.enqueue_price_changes(&outcome.price_changes, run_id).await?;
        self.enqueue_ids(&outcome.relisted_properties, QueueReason::Relisted, run_id)
            .await?;

        let stale_ids = self
            .db
            .stale_property_ids(
                tier.stale_days_threshold,
                (tier.max_queue_items / 2) as i64,
                self.clock.now(),
            )
            .await?;
        self.enqueue_ids(&stale_ids, QueueReason::StaleData, run_id).await?;

        // Weekly second chance for scrapes that failed with attempts left.
        self.db
            .retry_failed_entries(tier.retry_attempts as i64, tier.max_queue_items as i64)
            .await?;
        result.properties_queued = self.db.pending_count().await?;

        if result.properties_queued > 0 {
            self.drain_queue(tier, result, cancel).await?;
        }

        // Confirmed removals have no business keeping a manifest row.
        for removal in &outcome.confirmed_removals {
            if removal.confirmed_removed {
                if let Err(e) = self.db.delete_manifest_entry(&removal.property_id).await {
                    warn!(
                        "Could not remove {} from manifest: {}",
                        removal.property_id, e
                    );
                }
            }
        }

        self.db
            .clear_manifest_flags(run_id, self.clock.now())
            .await?;
        Ok(())
    }

    /// Tier 4: no manifest scan; refresh the stalest records plus a random
    /// sample of the active stock, at the tier's slower rate limit.
    async fn tier_4_monthly_refresh(
        &self,
        tier: &TierSettings,
        run_id: &str,
        result: &mut TierResult,
        cancel: &CancelToken,
    ) -> Result<()> {
        let stale_ids = self
            .db
            .stale_property_ids(
                tier.stale_days_threshold,
                tier.max_queue_items as i64,
                self.clock.now(),
            )
            .await?;
        self.enqueue_ids(&stale_ids, QueueReason::StaleData, run_id).await?;

        let total_active = self.db.count_active().await?;
        let sample_size = (total_active as f64 * tier.random_sample_percent / 100.0) as i64;
        if sample_size > 0 {
            let sample_ids = self.db.random_sample_ids(sample_size).await?;
            let queued = self
                .enqueue_ids(&sample_ids, QueueReason::RandomSample, run_id)
                .await?;
            info!(
                "Queued {} random sample properties ({}% of {} active)",
                queued, tier.random_sample_percent, total_active
            );
        }

        result.properties_queued = self.db.pending_count().await?;
        if result.properties_queued > 0 {
            self.drain_queue(tier, result, cancel).await?;
        }

        self.db
            .cleanup_queue_older_than(self.config.queue_cleanup_days, self.clock.now())
            .await?;

        let stale_now = self
            .db
            .count_stale(tier.stale_days_threshold, self.clock.now())
            .await?;
        let active_now = self.db.count_active().await?;
        info!(
            "Data quality: {} active, {} stale ({:.1}%)",
            active_now,
            stale_now,
            if active_now > 0 {
                stale_now as f64 / active_now as f64 * 100.0
            } else {
                0.0
            }
        );

        self.db
            .clear_manifest_flags(run_id, self.clock.now())
            .await?;
        Ok(())
    }

    async fn drain_queue(
        &self,
        tier: &TierSettings,
        result: &mut TierResult,
        cancel: &CancelToken,
    ) -> Result<()> {
        let drained = self
            .worker
            .drain(
                tier.max_queue_items,
                Duration::from_secs_f64(tier.delay_between_details_secs),
                cancel,
            )
            .await?;
        result.properties_scraped += drained.succeeded;
        if drained.failed > 0 {
            result
                .errors
                .push(format!("{} queue items failed to scrape", drained.failed));
        }
        Ok(())
    }

    async fn enqueue_ids(
        &self,
        ids: &[String],
        reason: QueueReason,
        run_id: &str,
    ) -> Result<i64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let queued = self
            .db
            .enqueue(
                ids,
                self.config.priority_for(reason),
                reason,
                run_id,
                None,
                self.config.queue_max_pending,
                self.clock.now(),
            )
            .await?;
        Ok(queued as i64)
    }

    async fn enqueue_price_changes(
        &self,
        changes: &[PriceChange],
        run_id: &str,
    ) -> Result<i64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = changes.iter().map(|c| c.property_id.clone()).collect();
        let metadata: HashMap<String, serde_json::Value> = changes
            .iter()
            .map(|c| {
                (
                    c.property_id.clone(),
                    json!({
                        "old_price": c.old_price,
                        "new_price": c.new_price,
                        "percent_change": c.percent_change,
                    }),
                )
            })
            .collect();

        let queued = self
            .db
            .enqueue(
                &ids,
                self.config.priority_for(QueueReason::PriceChange),
                QueueReason::PriceChange,
                run_id,
                Some(&metadata),
                self.config.queue_max_pending,
                self.clock.now(),
            )
            .await?;
        Ok(queued as i64)
    }

    fn scanned_operation_types(&self) -> Vec<OperationType> {
        let mut ops: Vec<OperationType> = Vec::new();
        for source in &self.config.listing_sources {
            if !ops.contains(&source.operation_type) {
                ops.push(source.operation_type);
            }
        }
        ops
    }
}
