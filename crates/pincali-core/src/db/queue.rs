use super::Database;
use crate::models::{QueueEntry, QueueReason, QueueStats};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest error text persisted on a queue entry.
const MAX_ERROR_LEN: usize = 1000;

/// How a worker takes ownership of pending entries. Two implementations: the
/// atomic one relies on `UPDATE ... RETURNING`, the compare-and-swap one
/// emulates it with a two-step select + conditional update for stores without
/// row locking. Both guarantee a pending entry is claimed by at most one
/// worker.
#[async_trait]
pub trait ClaimStrategy: Send + Sync {
    async fn claim_batch(
        &self,
        db: &Database,
        batch_size: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>>;
}

#[derive(Debug, Default)]
pub struct AtomicClaim;

#[async_trait]
impl ClaimStrategy for AtomicClaim {
    async fn claim_batch(
        &self,
        db: &Database,
        batch_size: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let mut claimed = sqlx::query_as::<_, QueueEntry>(
            "UPDATE scrape_queue SET status = 'in_progress', claimed_at = ?, claimed_by = ?, \
             attempt_count = attempt_count + 1 \
             WHERE id IN (\
                 SELECT id FROM scrape_queue WHERE status = 'pending' \
                 ORDER BY priority ASC, queued_at ASC LIMIT ?) \
             AND status = 'pending' \
             RETURNING *",
        )
        .bind(now)
        .bind(worker_id)
        .bind(batch_size as i64)
        .fetch_all(db.pool())
        .await?;

        // RETURNING does not promise the subquery's order.
        claimed.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.queued_at.cmp(&b.queued_at))
        });

        if !claimed.is_empty() {
            info!("Claimed {} queue items for worker {}", claimed.len(), worker_id);
        }
        Ok(claimed)
    }
}

#[derive(Debug, Default)]
pub struct CompareAndSwapClaim;

#[async_trait]
impl ClaimStrategy for CompareAndSwapClaim {
    async fn claim_batch(
        &self,
        db: &Database,
        batch_size: usize,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let candidate_ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM scrape_queue WHERE status = 'pending' \
             ORDER BY priority ASC, queued_at ASC LIMIT ?",
        )
        .bind(batch_size as i64)
        .fetch_all(db.pool())
        .await?;

        let mut claimed = Vec::new();
        for id in candidate_ids {
            let result = sqlx::query(
                "UPDATE scrape_queue SET status = 'in_progress', claimed_at = ?, \
                 claimed_by = ?, attempt_count = attempt_count + 1 \
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(now)
            .bind(worker_id)
            .bind(&id)
            .execute(db.pool())
            .await?;

            // Zero rows affected means another worker won the race.
            if result.rows_affected() == 1 {
                if let Some(entry) = db.get_queue_entry(&id).await? {
                    claimed.push(entry);
                }
            } else {
                debug!("Lost claim race for queue entry {}", id);
            }
        }

        if !claimed.is_empty() {
            info!("Claimed {} queue items for worker {}", claimed.len(), worker_id);
        }
        Ok(claimed)
    }
}

impl Database {
    /// Add properties to the scrape queue.
    ///
    /// Source URLs are resolved from the manifest first, then the canonical
    /// table; ids without a URL are skipped. A property that already has a
    /// pending entry is silently left alone (unique partial index on
    /// `(property_id) WHERE status = 'pending'`).
    ///
    /// The `max_pending` cap is advisory: the check reads the pending count
    /// and then inserts, which is safe for the single-writer engine but soft
    /// under concurrent producers.
    pub async fn enqueue(
        &self,
        property_ids: &[String],
        priority: i64,
        reason: QueueReason,
        run_id: &str,
        metadata: Option<&HashMap<String, serde_json::Value>>,
        max_pending: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if property_ids.is_empty() {
            return Ok(0);
        }

        let pending = self.pending_count().await? as usize;
        if pending >= max_pending {
            warn!(
                "Queue at capacity ({} pending), dropping {} new items",
                pending,
                property_ids.len()
            );
            return Ok(0);
        }
        let capacity = max_pending - pending;

        let ids: Vec<&str> = property_ids.iter().map(String::as_str).collect();
        let mut urls = self.manifest_source_urls(&ids).await?;
        let missing: Vec<&str> = ids
            .iter()
            .copied()
            .filter(|id| !urls.contains_key(*id))
            .collect();
        if !missing.is_empty() {
            urls.extend(self.canonical_source_urls(&missing).await?);
        }

        let mut queued = 0;
        for property_id in property_ids {
            let Some(source_url) = urls.get(property_id) else {
                debug!("Skipping {}: no source URL", property_id);
                continue;
            };

            if queued >= capacity {
                warn!(
                    "Queue capacity reached while enqueuing ({} dropped)",
                    property_ids.len() - queued
                );
                break;
            }

            let metadata_json = metadata
                .and_then(|m| m.get(property_id))
                .map(|v| v.to_string());

            let result = sqlx::query(
                "INSERT OR IGNORE INTO scrape_queue \
                 (id, property_id, source_url, priority, queue_reason, status, metadata, \
                  attempt_count, run_id, queued_at) \
                 VALUES (?, ?, ?, ?, ?, 'pending', ?, 0, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(property_id)
            .bind(source_url)
            .bind(priority)
            .bind(reason)
            .bind(metadata_json)
            .bind(run_id)
            .bind(now)
            .execute(self.pool())
            .await?;

            if result.rows_affected() == 1 {
                queued += 1;
            } else {
                debug!("Property {} already pending in queue", property_id);
            }
        }

        info!(
            "Queued {} properties with priority {} ({})",
            queued, priority, reason
        );
        Ok(queued)
    }

    pub async fn get_queue_entry(&self, id: &str) -> Result<Option<QueueEntry>> {
        let entry = sqlx::query_as::<_, QueueEntry>("SELECT * FROM scrape_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(entry)
    }

    /// Mark a claimed entry as completed or failed. Error text is truncated
    /// before it hits the database.
    pub async fn complete_queue_entry(
        &self,
        id: &str,
        success: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let status = if success { "completed" } else { "failed" };
        let error = error.map(|e| {
            let mut e = e.to_string();
            if e.len() > MAX_ERROR_LEN {
                let mut cut = MAX_ERROR_LEN;
                while !e.is_char_boundary(cut) {
                    cut -= 1;
                }
                e.truncate(cut);
            }
            e
        });

        sqlx::query(
            "UPDATE scrape_queue SET status = ?, completed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Release `in_progress` entries whose worker never finished.
    pub async fn release_stale_claims(
        &self,
        minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = now - Duration::minutes(minutes);
        let released = sqlx::query(
            "UPDATE scrape_queue SET status = 'pending', claimed_at = NULL, claimed_by = NULL \
             WHERE status = 'in_progress' AND claimed_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();

        if released > 0 {
            info!("Released {} stale queue claims", released);
        }
        Ok(released)
    }

    /// Reset failed entries that still have attempts left.
    pub async fn retry_failed_entries(&self, max_attempts: i64, limit: i64) -> Result<u64> {
        let retried = sqlx::query(
            "UPDATE scrape_queue SET status = 'pending', claimed_at = NULL, claimed_by = NULL, \
             completed_at = NULL, last_error = NULL \
             WHERE id IN (\
                 SELECT id FROM scrape_queue \
                 WHERE status = 'failed' AND attempt_count < ? LIMIT ?)",
        )
        .bind(max_attempts)
        .bind(limit)
        .execute(self.pool())
        .await?
        .rows_affected();

        if retried > 0 {
            info!("Reset {} failed queue items for retry", retried);
        }
        Ok(retried)
    }

    pub async fn cancel_pending_by_reason(
        &self,
        reason: QueueReason,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cancelled = sqlx::query(
            "UPDATE scrape_queue SET status = 'cancelled', completed_at = ? \
             WHERE status = 'pending' AND queue_reason = ?",
        )
        .bind(now)
        .bind(reason)
        .execute(self.pool())
        .await?
        .rows_affected();

        if cancelled > 0 {
            info!("Cancelled {} pending items with reason {}", cancelled, reason);
        }
        Ok(cancelled)
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM scrape_queue WHERE status = 'pending'")
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM scrape_queue GROUP BY status")
            .fetch_all(self.pool())
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "pending" => stats.pending = n,
                "in_progress" => stats.in_progress = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                "cancelled" => stats.cancelled = n,
                _ => {}
            }
        }

        let rows = sqlx::query(
            "SELECT priority, COUNT(*) AS n FROM scrape_queue \
             WHERE status = 'pending' GROUP BY priority ORDER BY priority",
        )
        .fetch_all(self.pool())
        .await?;
        for row in rows {
            stats
                .by_priority
                .push((row.try_get("priority")?, row.try_get("n")?));
        }

        let rows = sqlx::query(
            "SELECT queue_reason, COUNT(*) AS n FROM scrape_queue \
             WHERE status = 'pending' GROUP BY queue_reason ORDER BY queue_reason",
        )
        .fetch_all(self.pool())
        .await?;
        for row in rows {
            stats
                .by_reason
                .push((row.try_get("queue_reason")?, row.try_get("n")?));
        }

        Ok(stats)
    }

    /// Delete completed and cancelled entries older than the threshold.
    pub async fn cleanup_queue_older_than(
        &self,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = now - Duration::days(days);
        let deleted = sqlx::query(
            "DELETE FROM scrape_queue \
             WHERE status IN ('completed', 'cancelled') AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();

        if deleted > 0 {
            info!("Cleaned up {} old queue entries", deleted);
        }
        Ok(deleted)
    }

    /// Pending-entry property ids, cheapest way for callers to check overlap.
    pub async fn pending_property_ids(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT property_id FROM scrape_queue WHERE status = 'pending'",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationType, ScrapeRecord};

    async fn seed_canonical(db: &Database, id: &str, now: DateTime<Utc>) {
        let record = ScrapeRecord {
            source_url: Some(format!("https://www.pincali.com/en/home/{}", id)),
            price: Some(100_000.0),
            title: Some(id.to_string()),
            operation_type: Some(OperationType::Sale),
            ..Default::default()
        };
        db.upsert_from_scrape(id, &record, now).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_resolves_urls_and_skips_unknown() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed_canonical(&db, "known", now).await;

        let queued = db
            .enqueue(
                &["known".to_string(), "unknown".to_string()],
                1,
                QueueReason::NewProperty,
                "run-1",
                None,
                10_000,
                now,
            )
            .await
            .unwrap();

        assert_eq!(queued, 1);
        assert_eq!(db.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_pending_per_property() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed_canonical(&db, "dup", now).await;

        let ids = vec!["dup".to_string()];
        let first = db
            .enqueue(&ids, 1, QueueReason::NewProperty, "run-1", None, 10_000, now)
            .await
            .unwrap();
        let second = db
            .enqueue(&ids, 2, QueueReason::PriceChange, "run-2", None, 10_000, now)
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(db.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capacity_cap_drops_excess() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        for i in 0..4 {
            seed_canonical(&db, &format!("cap{}", i), now).await;
        }

        let ids: Vec<String> = (0..4).map(|i| format!("cap{}", i)).collect();
        let queued = db
            .enqueue(&ids, 1, QueueReason::NewProperty, "run-1", None, 2, now)
            .await
            .unwrap();

        assert_eq!(queued, 2);
        assert_eq!(db.pending_count().await.unwrap(), 2);

        // Queue already at capacity: nothing further goes in.
        let queued = db
            .enqueue(
                &["cap3".to_string()],
                1,
                QueueReason::NewProperty,
                "run-1",
                None,
                2,
                now,
            )
            .await
            .unwrap();
        assert_eq!(queued, 0);
    }

    async fn claim_test(strategy: &dyn ClaimStrategy) {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        for (i, id) in ["low", "high", "mid"].iter().enumerate() {
            seed_canonical(&db, id, now).await;
            let priority = [4, 1, 2][i];
            let reason = [
                QueueReason::StaleData,
                QueueReason::NewProperty,
                QueueReason::PriceChange,
            ][i];
            db.enqueue(&[id.to_string()], priority, reason, "run-1", None, 100, now)
                .await
                .unwrap();
        }

        // Claims come back in priority order and flip to in_progress.
        let claimed = strategy.claim_batch(&db, 2, "worker-a", now).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].property_id, "high");
        assert_eq!(claimed[1].property_id, "mid");
        assert!(claimed.iter().all(|e| e.status == crate::models::QueueStatus::InProgress));
        assert!(claimed.iter().all(|e| e.claimed_by.as_deref() == Some("worker-a")));
        assert!(claimed.iter().all(|e| e.attempt_count == 1));

        // Claimed entries are not claimable again.
        let rest = strategy.claim_batch(&db, 10, "worker-b", now).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].property_id, "low");

        let empty = strategy.claim_batch(&db, 10, "worker-b", now).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_claim() {
        claim_test(&AtomicClaim).await;
    }

    #[tokio::test]
    async fn test_compare_and_swap_claim() {
        claim_test(&CompareAndSwapClaim).await;
    }

    #[tokio::test]
    async fn test_complete_and_error_truncation() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed_canonical(&db, "done", now).await;
        db.enqueue(
            &["done".to_string()],
            1,
            QueueReason::NewProperty,
            "run-1",
            None,
            100,
            now,
        )
        .await
        .unwrap();

        let claimed = AtomicClaim.claim_batch(&db, 1, "w", now).await.unwrap();
        let long_error = "x".repeat(5000);
        db.complete_queue_entry(&claimed[0].id, false, Some(&long_error), now)
            .await
            .unwrap();

        let entry = db.get_queue_entry(&claimed[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, crate::models::QueueStatus::Failed);
        assert_eq!(entry.last_error.unwrap().len(), 1000);
        assert!(entry.completed_at.is_some());

        // Completed/failed entries are never re-claimed.
        let again = AtomicClaim.claim_batch(&db, 10, "w", now).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed_canonical(&db, "stale", now).await;
        db.enqueue(
            &["stale".to_string()],
            1,
            QueueReason::NewProperty,
            "run-1",
            None,
            100,
            now,
        )
        .await
        .unwrap();

        let claimed_at = now - Duration::minutes(31);
        let claimed = AtomicClaim.claim_batch(&db, 1, "w", claimed_at).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let released = db.release_stale_claims(30, now).await.unwrap();
        assert_eq!(released, 1);

        let entry = db.get_queue_entry(&claimed[0].id).await.unwrap().unwrap();
        assert_eq!(entry.status, crate::models::QueueStatus::Pending);
        assert!(entry.claimed_at.is_none());
        assert!(entry.claimed_by.is_none());

        // And it can be claimed again.
        let reclaimed = AtomicClaim.claim_batch(&db, 1, "w2", now).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[0].id);
    }

    #[tokio::test]
    async fn test_retry_failed_respects_max_attempts() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        seed_canonical(&db, "flaky", now).await;
        db.enqueue(
            &["flaky".to_string()],
            1,
            QueueReason::NewProperty,
            "run-1",
            None,
            100,
            now,
        )
        .await
        .unwrap();

        for attempt in 1..=3 {
            let claimed = AtomicClaim.claim_batch(&db, 1, "w", now).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {}", attempt);
            db.complete_queue_entry(&claimed[0].id, false, Some("boom"), now)
                .await
                .unwrap();
            db.retry_failed_entries(3, 100).await.unwrap();
        }

        // attempt_count reached 3; no retries left.
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats_cancel_and_cleanup() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            seed_canonical(&db, id, now).await;
        }
        db.enqueue(
            &["a".to_string()],
            1,
            QueueReason::NewProperty,
            "run-1",
            None,
            100,
            now,
        )
        .await
        .unwrap();
        db.enqueue(
            &["b".to_string(), "c".to_string()],
            4,
            QueueReason::StaleData,
            "run-1",
            None,
            100,
            now,
        )
        .await
        .unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.by_priority, vec![(1, 1), (4, 2)]);

        let cancelled = db
            .cancel_pending_by_reason(QueueReason::StaleData, now)
            .await
            .unwrap();
        assert_eq!(cancelled, 2);

        let deleted = db
            .cleanup_queue_older_than(7, now + Duration::days(8))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.pending_count().await.unwrap(), 1);
    }
}
