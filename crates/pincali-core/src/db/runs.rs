use super::Database;
use crate::models::{RunStatus, SyncRun};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

/// Counter snapshot written back onto a sync run when it finishes.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    pub pages_scanned: i64,
    pub new_properties_found: i64,
    pub price_changes_detected: i64,
    pub removals_confirmed: i64,
    pub properties_queued: i64,
    pub properties_scraped: i64,
    pub properties_updated: i64,
    pub error_count: i64,
    pub error_summary: Option<String>,
    pub execution_time_ms: i64,
}

/// Aggregated view over recent sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub period_days: i64,
    pub total_runs: i64,
    pub successful_runs: i64,
    pub failed_runs: i64,
    pub total_new_properties: i64,
    pub total_price_changes: i64,
    pub total_removals: i64,
    pub total_scraped: i64,
    pub average_duration_ms: i64,
    pub by_tier: Vec<TierSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct TierSummary {
    pub tier_level: i64,
    pub tier_name: String,
    pub runs: i64,
    pub successful: i64,
    pub new_properties: i64,
    pub price_changes: i64,
}

impl Database {
    pub async fn create_sync_run(
        &self,
        tier_level: i64,
        tier_name: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sync_runs (id, tier_level, tier_name, status, started_at) \
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(&id)
        .bind(tier_level)
        .bind(tier_name)
        .bind(now)
        .execute(self.pool())
        .await?;

        debug!("Created sync run {} for tier {}", id, tier_level);
        Ok(id)
    }

    pub async fn finish_sync_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounters,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_runs SET status = ?, completed_at = ?, pages_scanned = ?, \
             new_properties_found = ?, price_changes_detected = ?, removals_confirmed = ?, \
             properties_queued = ?, properties_scraped = ?, properties_updated = ?, \
             error_count = ?, error_summary = ?, execution_time_ms = ? \
             WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(counters.pages_scanned)
        .bind(counters.new_properties_found)
        .bind(counters.price_changes_detected)
        .bind(counters.removals_confirmed)
        .bind(counters.properties_queued)
        .bind(counters.properties_scraped)
        .bind(counters.properties_updated)
        .bind(counters.error_count)
        .bind(&counters.error_summary)
        .bind(counters.execution_time_ms)
        .bind(run_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Mark the tier's currently running sync run as cancelled, if any.
    pub async fn cancel_running_run(
        &self,
        tier_level: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let run_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM sync_runs WHERE tier_level = ? AND status = 'running' \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(tier_level)
        .fetch_optional(self.pool())
        .await?;

        if let Some(id) = &run_id {
            sqlx::query(
                "UPDATE sync_runs SET status = 'cancelled', completed_at = ?, \
                 error_summary = 'Cancelled by user request' WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;
        }

        Ok(run_id)
    }

    pub async fn last_run_for_tier(&self, tier_level: i64) -> Result<Option<SyncRun>> {
        let run = sqlx::query_as::<_, SyncRun>(
            "SELECT * FROM sync_runs WHERE tier_level = ? \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(tier_level)
        .fetch_optional(self.pool())
        .await?;
        Ok(run)
    }

    pub async fn last_successful_run_for_tier(
        &self,
        tier_level: i64,
    ) -> Result<Option<SyncRun>> {
        let run = sqlx::query_as::<_, SyncRun>(
            "SELECT * FROM sync_runs WHERE tier_level = ? AND status = 'completed' \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(tier_level)
        .fetch_optional(self.pool())
        .await?;
        Ok(run)
    }

    pub async fn run_history(
        &self,
        tier_level: Option<i64>,
        limit: i64,
    ) -> Result<Vec<SyncRun>> {
        let runs = match tier_level {
            Some(level) => {
                sqlx::query_as::<_, SyncRun>(
                    "SELECT * FROM sync_runs WHERE tier_level = ? \
                     ORDER BY started_at DESC LIMIT ?",
                )
                .bind(level)
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, SyncRun>(
                    "SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(runs)
    }

    pub async fn sync_summary(&self, days: i64, now: DateTime<Utc>) -> Result<SyncSummary> {
        let cutoff = now - Duration::days(days);
        let runs = sqlx::query_as::<_, SyncRun>(
            "SELECT * FROM sync_runs WHERE started_at >= ? ORDER BY started_at",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        let mut summary = SyncSummary {
            period_days: days,
            total_runs: runs.len() as i64,
            ..Default::default()
        };

        for run in &runs {
            match run.status {
                RunStatus::Completed => summary.successful_runs += 1,
                RunStatus::Failed => summary.failed_runs += 1,
                _ => {}
            }
            summary.total_new_properties += run.new_properties_found;
            summary.total_price_changes += run.price_changes_detected;
            summary.total_removals += run.removals_confirmed;
            summary.total_scraped += run.properties_scraped;
        }
        if !runs.is_empty() {
            summary.average_duration_ms =
                runs.iter().map(|r| r.execution_time_ms).sum::<i64>() / runs.len() as i64;
        }

        for tier_level in 1..=4 {
            let tier_runs: Vec<&SyncRun> =
                runs.iter().filter(|r| r.tier_level == tier_level).collect();
            if tier_runs.is_empty() {
                continue;
            }
            summary.by_tier.push(TierSummary {
                tier_level,
                tier_name: tier_runs[0].tier_name.clone(),
                runs: tier_runs.len() as i64,
                successful: tier_runs
                    .iter()
                    .filter(|r| r.status == RunStatus::Completed)
                    .count() as i64,
                new_properties: tier_runs.iter().map(|r| r.new_properties_found).sum(),
                price_changes: tier_runs.iter().map(|r| r.price_changes_detected).sum(),
            });
        }

        Ok(summary)
    }

    pub async fn create_scraping_session(
        &self,
        session_name: &str,
        base_url: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO scraping_sessions (id, session_name, base_url, status, started_at) \
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(&id)
        .bind(session_name)
        .bind(base_url)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn close_scraping_session(
        &self,
        session_id: &str,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scraping_sessions SET status = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(session_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
