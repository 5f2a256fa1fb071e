use super::{Database, QUERY_BATCH_SIZE};
use crate::models::{CanonicalProperty, ListingStatus, OperationType, RecordStatus, ScrapeRecord};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, QueryBuilder, Row};
use std::collections::HashMap;
use tracing::{debug, info};

/// An active canonical property that has gone unobserved long enough to be
/// checked against the live site.
#[derive(Debug, Clone, FromRow)]
pub struct RemovalCandidate {
    pub property_id: String,
    pub source_url: String,
    pub last_manifest_seen_at: Option<DateTime<Utc>>,
    pub consecutive_missing_count: i64,
}

fn encode_string_list(values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        serde_json::to_string(values).ok()
    }
}

impl Database {
    /// Canonical prices for the given ids. A key being present means the
    /// canonical record exists (its price may still be null).
    pub async fn canonical_prices(&self, ids: &[&str]) -> Result<HashMap<String, Option<f64>>> {
        let mut prices = HashMap::new();
        for chunk in ids.chunks(QUERY_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT property_id, price FROM properties_live WHERE property_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            builder.push(")");

            let rows = builder.build().fetch_all(self.pool()).await?;
            for row in rows {
                prices.insert(row.try_get("property_id")?, row.try_get("price")?);
            }
        }
        Ok(prices)
    }

    pub async fn get_canonical(&self, property_id: &str) -> Result<Option<CanonicalProperty>> {
        let property = sqlx::query_as::<_, CanonicalProperty>(
            "SELECT * FROM properties_live WHERE property_id = ?",
        )
        .bind(property_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(property)
    }

    /// Map of property id to source URL from the canonical table, used as the
    /// fallback when a queued id has no manifest row.
    pub async fn canonical_source_urls(&self, ids: &[&str]) -> Result<HashMap<String, String>> {
        let mut urls = HashMap::new();
        for chunk in ids.chunks(QUERY_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT property_id, source_url FROM properties_live WHERE property_id IN (",
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

    /// Insert or update the canonical record from a detail scrape.
    ///
    /// Merge policy: scraped values overwrite when present, absent values
    /// never clobber existing data, list fields replace wholesale. Every
    /// successful scrape resets the record to active and clears the missing
    /// counter.
    pub async fn upsert_from_scrape(
        &self,
        property_id: &str,
        record: &ScrapeRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let existing = self.get_canonical(property_id).await?;

        let merged = match existing {
            Some(mut current) => {
                if let Some(url) = &record.source_url {
                    current.source_url = url.clone();
                }
                if record.price.is_some() {
                    current.price = record.price;
                }
                if record.currency.is_some() {
                    current.currency = record.currency.clone();
                }
                if record.title.is_some() {
                    current.title = record.title.clone();
                }
                if record.description.is_some() {
                    current.description = record.description.clone();
                }
                if record.property_type.is_some() {
                    current.property_type = record.property_type.clone();
                }
                if record.operation_type.is_some() {
                    current.operation_type = record.operation_type;
                }
                if record.bedrooms.is_some() {
                    current.bedrooms = record.bedrooms;
                }
                if record.bathrooms.is_some() {
                    current.bathrooms = record.bathrooms;
                }
                if record.half_bathrooms.is_some() {
                    current.half_bathrooms = record.half_bathrooms;
                }
                if record.parking_spaces.is_some() {
                    current.parking_spaces = record.parking_spaces;
                }
                if record.total_area_m2.is_some() {
                    current.total_area_m2 = record.total_area_m2;
                }
                if record.covered_area_m2.is_some() {
                    current.covered_area_m2 = record.covered_area_m2;
                }
                if record.lot_size_m2.is_some() {
                    current.lot_size_m2 = record.lot_size_m2;
                }
                if record.construction_year.is_some() {
                    current.construction_year = record.construction_year;
                }
                if record.address.is_some() {
                    current.address = record.address.clone();
                }
                if record.neighborhood.is_some() {
                    current.neighborhood = record.neighborhood.clone();
                }
                if record.city.is_some() {
                    current.city = record.city.clone();
                }
                if record.state.is_some() {
                    current.state = record.state.clone();
                }
                if record.postal_code.is_some() {
                    current.postal_code = record.postal_code.clone();
                }
                if record.latitude.is_some() {
                    current.latitude = record.latitude;
                }
                if record.longitude.is_some() {
                    current.longitude = record.longitude;
                }
                // Lists replace wholesale.
                if let Some(amenities) = &record.amenities {
                    current.amenities = amenities.clone();
                }
                if let Some(features) = &record.features {
                    current.features = features.clone();
                }
                if let Some(images) = &record.image_urls {
                    current.image_urls = images.clone();
                }
                if record.main_image_url.is_some() {
                    current.main_image_url = record.main_image_url.clone();
                }
                if record.agent_name.is_some() {
                    current.agent_name = record.agent_name.clone();
                }
                if record.agent_phone.is_some() {
                    current.agent_phone = record.agent_phone.clone();
                }
                if record.agent_email.is_some() {
                    current.agent_email = record.agent_email.clone();
                }
                if record.agency_name.is_some() {
                    current.agency_name = record.agency_name.clone();
                }
                current
            }
            None => CanonicalProperty {
                property_id: property_id.to_string(),
                source_url: record.source_url.clone().unwrap_or_default(),
                price: record.price,
                price_at_last_manifest: None,
                currency: record.currency.clone(),
                title: record.title.clone(),
                description: record.description.clone(),
                property_type: record.property_type.clone(),
                operation_type: record.operation_type,
                bedrooms: record.bedrooms,
                bathrooms: record.bathrooms,
                half_bathrooms: record.half_bathrooms,
                parking_spaces: record.parking_spaces,
                total_area_m2: record.total_area_m2,
                covered_area_m2: record.covered_area_m2,
                lot_size_m2: record.lot_size_m2,
                construction_year: record.construction_year,
                address: record.address.clone(),
                neighborhood: record.neighborhood.clone(),
                city: record.city.clone(),
                state: record.state.clone(),
                postal_code: record.postal_code.clone(),
                latitude: record.latitude,
                longitude: record.longitude,
                amenities: record.amenities.clone().unwrap_or_default(),
                features: record.features.clone().unwrap_or_default(),
                image_urls: record.image_urls.clone().unwrap_or_default(),
                main_image_url: record.main_image_url.clone(),
                agent_name: record.agent_name.clone(),
                agent_phone: record.agent_phone.clone(),
                agent_email: record.agent_email.clone(),
                agency_name: record.agency_name.clone(),
                listing_status: ListingStatus::Active,
                status: RecordStatus::Active,
                consecutive_missing_count: 0,
                scrape_priority: 3,
                last_full_scrape_at: None,
                last_manifest_seen_at: None,
                last_seen_at: None,
                first_seen_at: now,
                last_updated_at: now,
            },
        };

        sqlx::query(
            r#"
            INSERT INTO properties_live (
                property_id, source_url, price, price_at_last_manifest, currency,
                title, description, property_type, operation_type,
                bedrooms, bathrooms, half_bathrooms, parking_spaces,
                total_area_m2, covered_area_m2, lot_size_m2, construction_year,
                address, neighborhood, city, state, postal_code, latitude, longitude,
                amenities, features, image_urls, main_image_url,
                agent_name, agent_phone, agent_email, agency_name,
                listing_status, status, consecutive_missing_count, scrape_priority,
                last_full_scrape_at, last_manifest_seen_at, last_seen_at,
                first_seen_at, last_updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                      ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', 'active', 0, 3, ?, ?, ?, ?, ?)
            ON CONFLICT(property_id) DO UPDATE SET
                source_url = excluded.source_url,
                price = excluded.price,
                currency = excluded.currency,
                title = excluded.title,
                description = excluded.description,
                property_type = excluded.property_type,
                operation_type = excluded.operation_type,
                bedrooms = excluded.bedrooms,
                bathrooms = excluded.bathrooms,
                half_bathrooms = excluded.half_bathrooms,
                parking_spaces = excluded.parking_spaces,
                total_area_m2 = excluded.total_area_m2,
                covered_area_m2 = excluded.covered_area_m2,
                lot_size_m2 = excluded.lot_size_m2,
                construction_year = excluded.construction_year,
                address = excluded.address,
                neighborhood = excluded.neighborhood,
                city = excluded.city,
                state = excluded.state,
                postal_code = excluded.postal_code,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                amenities = excluded.amenities,
                features = excluded.features,
                image_urls = excluded.image_urls,
                main_image_url = excluded.main_image_url,
                agent_name = excluded.agent_name,
                agent_phone = excluded.agent_phone,
                agent_email = excluded.agent_email,
                agency_name = excluded.agency_name,
                listing_status = 'active',
                status = 'active',
                consecutive_missing_count = 0,
                scrape_priority = 3,
                last_full_scrape_at = excluded.last_full_scrape_at,
                last_manifest_seen_at = excluded.last_manifest_seen_at,
                last_seen_at = excluded.last_seen_at,
                last_updated_at = excluded.last_updated_at
            "#,
        )
        .bind(&merged.property_id)
        .bind(&merged.source_url)
        .bind(merged.price)
        .bind(merged.price_at_last_manifest)
        .bind(&merged.currency)
        .bind(&merged.title)
        .bind(&merged.description)
        .bind(&merged.property_type)
        .bind(merged.operation_type)
        .bind(merged.bedrooms)
        .bind(merged.bathrooms)
        .bind(merged.half_bathrooms)
        .bind(merged.parking_spaces)
        .bind(merged.total_area_m2)
        .bind(merged.covered_area_m2)
        .bind(merged.lot_size_m2)
        .bind(merged.construction_year)
        .bind(&merged.address)
        .bind(&merged.neighborhood)
        .bind(&merged.city)
        .bind(&merged.state)
        .bind(&merged.postal_code)
        .bind(merged.latitude)
        .bind(merged.longitude)
        .bind(encode_string_list(&merged.amenities))
        .bind(encode_string_list(&merged.features))
        .bind(encode_string_list(&merged.image_urls))
        .bind(&merged.main_image_url)
        .bind(&merged.agent_name)
        .bind(&merged.agent_phone)
        .bind(&merged.agent_email)
        .bind(&merged.agency_name)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        debug!("Upserted canonical record for {}", property_id);
        Ok(())
    }

    /// Maintain `consecutive_missing_count` after a scan: increment it for
    /// every active canonical record whose source was scanned but which was
    /// not observed, then reset it for everything that was. Both updates run
    /// in one transaction so the counters cannot be half-applied.
    ///
    /// Records without an operation type cannot be attributed to a source and
    /// are skipped by the increment.
    pub async fn maintain_missing_counts(
        &self,
        run_id: &str,
        scanned_ops: &[OperationType],
        now: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        if scanned_ops.is_empty() {
            return Ok((0, 0));
        }

        let mut tx = self.pool().begin().await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "UPDATE properties_live SET \
             consecutive_missing_count = consecutive_missing_count + 1, \
             last_updated_at = ",
        );
        builder.push_bind(now);
        builder.push(" WHERE listing_status = 'active' AND operation_type IN (");
        let mut separated = builder.separated(", ");
        for op in scanned_ops {
            separated.push_bind(*op);
        }
        builder.push(
            ") AND property_id NOT IN \
             (SELECT property_id FROM property_manifest WHERE seen_in_run_id = ",
        );
        builder.push_bind(run_id);
        builder.push(")");

        let incremented = builder.build().execute(&mut *tx).await?.rows_affected();

        let reset = sqlx::query(
            "UPDATE properties_live SET consecutive_missing_count = 0, \
             last_manifest_seen_at = ?, last_updated_at = ? \
             WHERE property_id IN \
             (SELECT property_id FROM property_manifest WHERE seen_in_run_id = ?)",
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            "Missing-count maintenance: {} incremented, {} reset",
            incremented, reset
        );
        Ok((incremented, reset))
    }

    /// Active canonical records that have been missing from at least
    /// `min_missing_count` consecutive scans.
    pub async fn removal_candidates(
        &self,
        min_missing_count: i64,
    ) -> Result<Vec<RemovalCandidate>> {
        let candidates = sqlx::query_as::<_, RemovalCandidate>(
            "SELECT property_id, source_url, last_manifest_seen_at, consecutive_missing_count \
             FROM properties_live \
             WHERE listing_status = 'active' AND consecutive_missing_count >= ?",
        )
        .bind(min_missing_count)
        .fetch_all(self.pool())
        .await?;

        Ok(candidates)
    }

    pub async fn mark_confirmed_removed(
        &self,
        ids: &[&str],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut updated = 0;
        for chunk in ids.chunks(QUERY_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "UPDATE properties_live SET listing_status = 'confirmed_removed', \
                 status = 'removed', last_updated_at = ",
            );
            builder.push_bind(now);
            builder.push(" WHERE property_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            builder.push(")");

            updated += builder.build().execute(self.pool()).await?.rows_affected();
        }
        Ok(updated)
    }

    /// Clear the missing counter for properties whose URLs turned out to be
    /// alive after all.
    pub async fn reset_missing_counts(&self, ids: &[&str], now: DateTime<Utc>) -> Result<u64> {
        let mut updated = 0;
        for chunk in ids.chunks(QUERY_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "UPDATE properties_live SET consecutive_missing_count = 0, \
                 last_manifest_seen_at = ",
            );
            builder.push_bind(now);
            builder.push(", last_updated_at = ");
            builder.push_bind(now);
            builder.push(" WHERE property_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            builder.push(")");

            updated += builder.build().execute(self.pool()).await?.rows_affected();
        }
        Ok(updated)
    }

    /// Properties observed in this run whose canonical record says they were
    /// gone: the relist set.
    pub async fn relisted_property_ids(&self, run_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT property_id FROM properties_live \
             WHERE listing_status IN ('confirmed_removed', 'sold', 'likely_removed') \
             AND property_id IN \
             (SELECT property_id FROM property_manifest WHERE seen_in_run_id = ?)",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }

    pub async fn mark_relisted(&self, ids: &[&str], now: DateTime<Utc>) -> Result<u64> {
        let mut updated = 0;
        for chunk in ids.chunks(QUERY_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "UPDATE properties_live SET listing_status = 'relisted', status = 'active', \
                 consecutive_missing_count = 0, last_manifest_seen_at = ",
            );
            builder.push_bind(now);
            builder.push(", last_updated_at = ");
            builder.push_bind(now);
            builder.push(" WHERE property_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            builder.push(")");

            updated += builder.build().execute(self.pool()).await?.rows_affected();
        }
        Ok(updated)
    }

    /// Copy listing prices observed in this run into
    /// `price_at_last_manifest` on the canonical rows.
    pub async fn update_manifest_prices(&self, run_id: &str, now: DateTime<Utc>) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE properties_live SET \
             price_at_last_manifest = (\
                 SELECT m.listing_price FROM property_manifest m \
                 WHERE m.property_id = properties_live.property_id \
                 AND m.seen_in_run_id = ?1 AND m.listing_price IS NOT NULL), \
             last_manifest_seen_at = ?2 \
             WHERE property_id IN (\
                 SELECT property_id FROM property_manifest \
                 WHERE seen_in_run_id = ?1 AND listing_price IS NOT NULL)",
        )
        .bind(run_id)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(updated)
    }

    /// Active properties whose last full scrape is older than the threshold,
    /// never-scraped rows first.
    pub async fn stale_property_ids(
        &self,
        days_threshold: i64,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let cutoff = now - Duration::days(days_threshold);
        let ids = sqlx::query_scalar(
            "SELECT property_id FROM properties_live \
             WHERE listing_status = 'active' \
             AND (last_full_scrape_at IS NULL OR last_full_scrape_at < ?) \
             ORDER BY last_full_scrape_at IS NOT NULL, last_full_scrape_at \
             LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }

    pub async fn random_sample_ids(&self, sample_size: i64) -> Result<Vec<String>> {
        if sample_size <= 0 {
            return Ok(Vec::new());
        }
        let ids = sqlx::query_scalar(
            "SELECT property_id FROM properties_live \
             WHERE listing_status = 'active' ORDER BY RANDOM() LIMIT ?",
        )
        .bind(sample_size)
        .fetch_all(self.pool())
        .await?;

        Ok(ids)
    }

    pub async fn count_active(&self) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM properties_live WHERE listing_status = 'active'",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn count_stale(&self, days_threshold: i64, now: DateTime<Utc>) -> Result<i64> {
        let cutoff = now - Duration::days(days_threshold);
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM properties_live \
             WHERE listing_status = 'active' \
             AND (last_full_scrape_at IS NULL OR last_full_scrape_at < ?)",
        )
        .bind(cutoff)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}
