use super::{Database, QUERY_BATCH_SIZE, UPSERT_BATCH_SIZE};
use crate::config::SyncConfig;
use crate::models::{ManifestEntry, ManifestRecord};
use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row};
use std::collections::HashMap;
use tracing::{debug, info, warn};

impl Database {
    /// Upsert scan observations into the manifest, flagging what downstream
    /// consumers need: `is_new` when the canonical store has no record,
    /// `price_changed` when the listing price moved significantly against the
    /// canonical price, `needs_full_scrape` as the union of both.
    ///
    /// Returns `(new_count, price_change_count)`. `first_seen_at` is only set
    /// when a manifest row is first inserted.
    pub async fn upsert_manifest_entries(
        &self,
        entries: &[ManifestEntry],
        run_id: &str,
        config: &SyncConfig,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        if entries.is_empty() {
            return Ok((0, 0));
        }

        let ids: Vec<&str> = entries.iter().map(|e| e.property_id.as_str()).collect();
        let live_prices = self.canonical_prices(&ids).await?;

        let mut new_count = 0;
        let mut price_change_count = 0;

        struct Flagged<'a> {
            entry: &'a ManifestEntry,
            is_new: bool,
            price_changed: bool,
        }

        let flagged: Vec<Flagged> = entries
            .iter()
            .map(|entry| {
                let live_price = live_prices.get(entry.property_id.as_str());
                let is_new = live_price.is_none();
                let price_changed = match (live_price, entry.listing_price) {
                    (Some(Some(old)), Some(new)) => {
                        config.is_significant_price_change(*old, new)
                    }
                    _ => false,
                };
                Flagged {
                    entry,
                    is_new,
                    price_changed,
                }
            })
            .collect();

        for batch in flagged.chunks(UPSERT_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO property_manifest (property_id, source_url, listing_price, \
                 listing_title, latitude, longitude, operation_type, is_new, price_changed, \
                 needs_full_scrape, first_seen_at, last_seen_at, seen_in_run_id, updated_at) ",
            );
            builder.push_values(batch, |mut b, item| {
                b.push_bind(&item.entry.property_id)
                    .push_bind(&item.entry.source_url)
                    .push_bind(item.entry.listing_price)
                    .push_bind(&item.entry.listing_title)
                    .push_bind(item.entry.latitude)
                    .push_bind(item.entry.longitude)
                    .push_bind(item.entry.operation_type)
                    .push_bind(item.is_new)
                    .push_bind(item.price_changed)
                    .push_bind(item.is_new || item.price_changed)
                    .push_bind(now)
                    .push_bind(now)
                    .push_bind(run_id)
                    .push_bind(now);
            });
            builder.push(
                " ON CONFLICT(property_id) DO UPDATE SET \
                 source_url = excluded.source_url, \
                 listing_price = excluded.listing_price, \
                 listing_title = excluded.listing_title, \
                 latitude = excluded.latitude, \
                 longitude = excluded.longitude, \
                 operation_type = excluded.operation_type, \
                 is_new = excluded.is_new, \
                 price_changed = excluded.price_changed, \
                 needs_full_scrape = excluded.needs_full_scrape, \
                 last_seen_at = excluded.last_seen_at, \
                 seen_in_run_id = excluded.seen_in_run_id, \
                 updated_at = excluded.updated_at",
            );

            match builder.build().execute(self.pool()).await {
                Ok(_) => {
                    new_count += batch.iter().filter(|f| f.is_new).count();
                    price_change_count += batch.iter().filter(|f| f.price_changed).count();
                }
                Err(e) => {
                    warn!("Error upserting manifest batch: {}", e);
                }
            }
        }

        info!(
            "Upserted {} manifest entries: {} new, {} price changes",
            entries.len(),
            new_count,
            price_change_count
        );

        Ok((new_count, price_change_count))
    }

    /// Reset the scan flags for all entries observed in a run, once the
    /// queue has been drained.
    pub async fn clear_manifest_flags(&self, run_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE property_manifest SET is_new = 0, price_changed = 0, \
             needs_full_scrape = 0, updated_at = ? WHERE seen_in_run_id = ?",
        )
        .bind(now)
        .bind(run_id)
        .execute(self.pool())
        .await?;

        debug!("Cleared manifest flags for run {}", run_id);
        Ok(result.rows_affected())
    }

    pub async fn delete_manifest_entry(&self, property_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM property_manifest WHERE property_id = ?")
            .bind(property_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_manifest_entry(&self, property_id: &str) -> Result<Option<ManifestRecord>> {
        let record = sqlx::query_as::<_, ManifestRecord>(
            "SELECT * FROM property_manifest WHERE property_id = ?",
        )
        .bind(property_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// Map of property id to source URL for the given ids, chunked to keep
    /// IN-clauses bounded.
    pub async fn manifest_source_urls(&self, ids: &[&str]) -> Result<HashMap<String, String>> {
        let mut urls = HashMap::new();
        for chunk in ids.chunks(QUERY_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT property_id, source_url FROM property_manifest WHERE property_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            builder.push(")");

            let rows = builder.build().fetch_all(self.pool()).await?;
            for row in rows {
                urls.insert(row.try_get("property_id")?, row.try_get("source_url")?);
            }
        }
        Ok(urls)
    }

    pub async fn new_property_ids(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT property_id FROM property_manifest \
             WHERE is_new = 1 AND seen_in_run_id = ?",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }

    pub async fn price_changed_entries(&self, run_id: &str) -> Result<Vec<ManifestRecord>> {
        let records = sqlx::query_as::<_, ManifestRecord>(
            "SELECT * FROM property_manifest \
             WHERE price_changed = 1 AND seen_in_run_id = ?",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    pub async fn observed_property_ids(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT property_id FROM property_manifest WHERE seen_in_run_id = ?",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }

    pub async fn manifest_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM property_manifest")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
