use crate::orchestrator::{TierOrchestrator, TierResult};
use crate::CancelToken;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pincali_core::{
    db::SyncSummary, Clock, Database, Result, RunStatus, SyncConfig, SyncError, SyncRun,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TierScheduleStatus {
    pub tier_level: i64,
    pub tier_name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_success: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_due: bool,
    pub is_running: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub tiers: Vec<TierScheduleStatus>,
    pub current_running_tier: Option<i64>,
    pub last_updated: DateTime<Utc>,
}

/// Decides which tiers are due and serializes their execution: exactly one
/// tier runs at a time, guarded by a single mutex.
pub struct Scheduler {
    db: Arc<Database>,
    orchestrator: Arc<TierOrchestrator>,
    config: Arc<SyncConfig>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
    running_tier: AtomicI64,
    current_cancel: StdMutex<Option<CancelToken>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        orchestrator: Arc<TierOrchestrator>,
        config: Arc<SyncConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            orchestrator,
            config,
            clock,
            lock: Mutex::new(()),
            running_tier: AtomicI64::new(0),
            current_cancel: StdMutex::new(None),
        }
    }

    /// A tier is due when it has never completed successfully, or its
    /// frequency has elapsed since the start of the last successful run.
    pub async fn should_run(&self, tier_level: i64) -> Result<bool> {
        let tier = self.config.tier(tier_level)?;

        let Some(last_run) = self.db.last_successful_run_for_tier(tier_level).await? else {
            info!("Tier {} ({}) has never run, should execute", tier_level, tier.name);
            return Ok(true);
        };

        let elapsed = self.clock.now() - last_run.started_at;
        let hours_since = elapsed.num_seconds() as f64 / 3600.0;
        let due = hours_since >= tier.frequency_hours;

        if due {
            info!(
                "Tier {} ({}) is due: {:.1}h since last run (threshold: {}h)",
                tier_level, tier.name, hours_since, tier.frequency_hours
            );
        } else {
            debug!(
                "Tier {} ({}) not due: {:.1}h since last run (threshold: {}h)",
                tier_level, tier.name, hours_since, tier.frequency_hours
            );
        }
        Ok(due)
    }

    pub async fn next_scheduled_run(&self, tier_level: i64) -> Result<Option<DateTime<Utc>>> {
        let tier = self.config.tier(tier_level)?;
        let Some(last_run) = self.db.last_successful_run_for_tier(tier_level).await? else {
            return Ok(Some(self.clock.now()));
        };

        let next = last_run.started_at
            + ChronoDuration::seconds((tier.frequency_hours * 3600.0) as i64);
        Ok(Some(next.max(self.clock.now())))
    }

    /// Run every due tier in order (1 → 4). A failing tier is logged and the
    /// rest still run. Holds the scheduler mutex for the whole sweep.
    pub async fn run_scheduled(&self) -> Vec<TierResult> {
        let _guard = self.lock.lock().await;
        let mut results = Vec::new();

        for tier_level in 1..=4 {
            let due = match self.should_run(tier_level).await {
                Ok(due) => due,
                Err(e) => {
                    error!("Error checking tier {} schedule: {}", tier_level, e);
                    false
                }
            };
            if !due {
                continue;
            }

            info!("Tier {} is due, executing", tier_level);
            results.push(self.execute_tier(tier_level).await);
        }

        results
    }

    /// Run one tier regardless of schedule. Without `force`, fails fast when
    /// another tier holds the scheduler; with `force`, waits for it instead.
    /// Either way the scheduler mutex is held for the execution — tiers never
    /// interleave.
    pub async fn run_single(&self, tier_level: i64, force: bool) -> Result<TierResult> {
        self.config.tier(tier_level)?;

        if force {
            let _guard = self.lock.lock().await;
            return Ok(self.execute_tier(tier_level).await);
        }

        let Ok(_guard) = self.lock.try_lock() else {
            let running = self.running_tier.load(Ordering::SeqCst);
            warn!(
                "Cannot run tier {}: tier {} is running",
                tier_level, running
            );
            return Err(SyncError::TierBusy(running));
        };

        Ok(self.execute_tier(tier_level).await)
    }

    async fn execute_tier(&self, tier_level: i64) -> TierResult {
        let cancel = CancelToken::new();
        *self.current_cancel.lock().unwrap() = Some(cancel.clone());
        self.running_tier.store(tier_level, Ordering::SeqCst);

        let result = match self.orchestrator.run_tier(tier_level, &cancel).await {
            Ok(result) => {
                if !result.success {
                    warn!("Tier {} failed, continuing", tier_level);
                }
                result
            }
            Err(e) => {
                error!("Error running tier {}: {}", tier_level, e);
                TierResult {
                    tier_level,
                    tier_name: self
                        .config
                        .tier(tier_level)
                        .map(|t| t.name.clone())
                        .unwrap_or_default(),
                    success: false,
                    pages_scanned: 0,
                    new_properties: 0,
                    price_changes: 0,
                    removals_confirmed: 0,
                    relisted_count: 0,
                    properties_queued: 0,
                    properties_scraped: 0,
                    duration_ms: 0,
                    errors: vec![e.to_string()],
                    run_id: None,
                }
            }
        };

        self.running_tier.store(0, Ordering::SeqCst);
        *self.current_cancel.lock().unwrap() = None;
        result
    }

    /// Keep checking the schedule until cancelled (or the iteration budget
    /// runs out).
    pub async fn run_continuous(
        &self,
        check_interval: Duration,
        max_iterations: Option<u64>,
        cancel: &CancelToken,
    ) {
        info!(
            "Starting continuous scheduler (check interval: {:?})",
            check_interval
        );

        let mut iteration = 0u64;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let results = self.run_scheduled().await;
            for result in &results {
                info!(
                    "Completed tier {} ({}): {}",
                    result.tier_level,
                    result.tier_name,
                    if result.success { "success" } else { "failed" }
                );
            }

            iteration += 1;
            if let Some(max) = max_iterations {
                if iteration >= max {
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Scheduler stopped");
    }

    /// Soft-cancel the currently running tier, marking its sync run as
    /// cancelled. The tier returns at its next safe boundary.
    pub async fn cancel_current_run(&self) -> Result<bool> {
        let tier_level = self.running_tier.load(Ordering::SeqCst);
        if tier_level == 0 {
            return Ok(false);
        }

        warn!("Cancellation requested for tier {}", tier_level);
        if let Some(cancel) = self.current_cancel.lock().unwrap().as_ref() {
            cancel.cancel();
        }
        self.db.cancel_running_run(tier_level, self.clock.now()).await?;
        Ok(true)
    }

    pub fn running_tier(&self) -> Option<i64> {
        match self.running_tier.load(Ordering::SeqCst) {
            0 => None,
            tier => Some(tier),
        }
    }

    pub async fn status(&self) -> Result<ScheduleStatus> {
        let mut tiers = Vec::with_capacity(4);
        let running = self.running_tier();

        for tier_level in 1..=4 {
            let tier = self.config.tier(tier_level)?;
            let last_run = self.db.last_run_for_tier(tier_level).await?;
            let last_success = self.db.last_successful_run_for_tier(tier_level).await?;

            tiers.push(TierScheduleStatus {
                tier_level,
                tier_name: tier.name.clone(),
                last_run_at: last_run.as_ref().map(|r| r.started_at),
                last_run_success: last_run
                    .as_ref()
                    .map(|r| r.status == RunStatus::Completed)
                    .unwrap_or(false),
                last_success_at: last_success.as_ref().map(|r| r.started_at),
                next_run_at: self.next_scheduled_run(tier_level).await?,
                is_due: self.should_run(tier_level).await?,
                is_running: running == Some(tier_level),
            });
        }

        Ok(ScheduleStatus {
            tiers,
            current_running_tier: running,
            last_updated: self.clock.now(),
        })
    }

    pub async fn history(
        &self,
        tier_level: Option<i64>,
        limit: i64,
    ) -> Result<Vec<SyncRun>> {
        self.db.run_history(tier_level, limit).await
    }

    pub async fn summary(&self, days: i64) -> Result<SyncSummary> {
        self.db.sync_summary(days, self.clock.now()).await
    }
}
