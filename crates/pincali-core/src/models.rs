use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use std::str::FromStr;

/// Which kind of listing index a property was observed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sale,
    Rent,
    Foreclosure,
    NewConstruction,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Sale => "sale",
            OperationType::Rent => "rent",
            OperationType::Foreclosure => "foreclosure",
            OperationType::NewConstruction => "new_construction",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sale" => Ok(OperationType::Sale),
            "rent" => Ok(OperationType::Rent),
            "foreclosure" => Ok(OperationType::Foreclosure),
            "new_construction" => Ok(OperationType::NewConstruction),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

/// Lifecycle of a canonical listing as seen from the site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    LikelyRemoved,
    ConfirmedRemoved,
    Sold,
    Relisted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::LikelyRemoved => "likely_removed",
            ListingStatus::ConfirmedRemoved => "confirmed_removed",
            ListingStatus::Sold => "sold",
            ListingStatus::Relisted => "relisted",
        }
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ListingStatus::Active),
            "likely_removed" => Ok(ListingStatus::LikelyRemoved),
            "confirmed_removed" => Ok(ListingStatus::ConfirmedRemoved),
            "sold" => Ok(ListingStatus::Sold),
            "relisted" => Ok(ListingStatus::Relisted),
            _ => Err(format!("Unknown listing status: {}", s)),
        }
    }
}

/// Coarse record status; `confirmed_removed` listings are always `removed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Removed,
    Inactive,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Removed => "removed",
            RecordStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(RecordStatus::Active),
            "removed" => Ok(RecordStatus::Removed),
            "inactive" => Ok(RecordStatus::Inactive),
            _ => Err(format!("Unknown record status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_progress" => Ok(QueueStatus::InProgress),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            _ => Err(format!("Unknown queue status: {}", s)),
        }
    }
}

/// Business cause for putting a property on the scrape queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueReason {
    NewProperty,
    PriceChange,
    Relisted,
    Verification,
    StaleData,
    RandomSample,
}

impl QueueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueReason::NewProperty => "new_property",
            QueueReason::PriceChange => "price_change",
            QueueReason::Relisted => "relisted",
            QueueReason::Verification => "verification",
            QueueReason::StaleData => "stale_data",
            QueueReason::RandomSample => "random_sample",
        }
    }
}

impl std::fmt::Display for QueueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new_property" => Ok(QueueReason::NewProperty),
            "price_change" => Ok(QueueReason::PriceChange),
            "relisted" => Ok(QueueReason::Relisted),
            "verification" => Ok(QueueReason::Verification),
            "stale_data" => Ok(QueueReason::StaleData),
            "random_sample" => Ok(QueueReason::RandomSample),
            _ => Err(format!("Unknown queue reason: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

// SQLx support for the string-backed enums: stored as TEXT, round-tripped
// through as_str/FromStr.
macro_rules! sqlx_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl sqlx::Type<sqlx::Sqlite> for $ty {
                fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                    <String as sqlx::Type<sqlx::Sqlite>>::type_info()
                }
            }

            impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
                fn decode(
                    value: sqlx::sqlite::SqliteValueRef<'r>,
                ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                    let text = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                    text.parse().map_err(|e: String| e.into())
                }
            }

            impl sqlx::Encode<'_, sqlx::Sqlite> for $ty {
                fn encode_by_ref(
                    &self,
                    args: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'_>>,
                ) -> sqlx::encode::IsNull {
                    args.push(sqlx::sqlite::SqliteArgumentValue::Text(
                        self.as_str().into(),
                    ));
                    sqlx::encode::IsNull::No
                }
            }
        )+
    };
}

sqlx_text_enum!(
    OperationType,
    ListingStatus,
    RecordStatus,
    QueueStatus,
    QueueReason,
    RunStatus,
);

/// A single property observation extracted from one listing page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub property_id: String,
    pub source_url: String,
    pub listing_price: Option<f64>,
    pub listing_title: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub operation_type: Option<OperationType>,
}

impl ManifestEntry {
    pub fn new(property_id: String, source_url: String, operation_type: OperationType) -> Self {
        Self {
            property_id,
            source_url,
            listing_price: None,
            listing_title: None,
            latitude: None,
            longitude: None,
            operation_type: Some(operation_type),
        }
    }

    /// How many optional fields carry data; used when deduplicating the same
    /// property seen on several pages.
    pub fn populated_fields(&self) -> usize {
        self.listing_price.is_some() as usize
            + self.listing_title.is_some() as usize
            + self.latitude.is_some() as usize
            + self.longitude.is_some() as usize
    }
}

/// A persisted manifest row, flags included.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestRecord {
    pub property_id: String,
    pub source_url: String,
    pub listing_price: Option<f64>,
    pub listing_title: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub operation_type: Option<OperationType>,
    pub is_new: bool,
    pub price_changed: bool,
    pub needs_full_scrape: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub seen_in_run_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// The authoritative per-property record maintained from detail scrapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalProperty {
    pub property_id: String,
    pub source_url: String,
    pub price: Option<f64>,
    pub price_at_last_manifest: Option<f64>,
    pub currency: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub property_type: Option<String>,
    pub operation_type: Option<OperationType>,
    pub bedrooms: Option<i64>,
    pub bathrooms: Option<f64>,
    pub half_bathrooms: Option<i64>,
    pub parking_spaces: Option<i64>,
    pub total_area_m2: Option<f64>,
    pub covered_area_m2: Option<f64>,
    pub lot_size_m2: Option<f64>,
    pub construction_year: Option<i64>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub amenities: Vec<String>,
    pub features: Vec<String>,
    pub image_urls: Vec<String>,
    pub main_image_url: Option<String>,
    pub agent_name: Option<String>,
    pub agent_phone: Option<String>,
    pub agent_email: Option<String>,
    pub agency_name: Option<String>,
    pub listing_status: ListingStatus,
    pub status: RecordStatus,
    pub consecutive_missing_count: i64,
    pub scrape_priority: i64,
    pub last_full_scrape_at: Option<DateTime<Utc>>,
    pub last_manifest_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

fn decode_string_list(raw: Option<String>) -> Vec<String> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for CanonicalProperty {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(CanonicalProperty {
            property_id: row.try_get("property_id")?,
            source_url: row.try_get("source_url")?,
            price: row.try_get("price")?,
            price_at_last_manifest: row.try_get("price_at_last_manifest")?,
            currency: row.try_get("currency")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            property_type: row.try_get("property_type")?,
            operation_type: row.try_get("operation_type")?,
            bedrooms: row.try_get("bedrooms")?,
            bathrooms: row.try_get("bathrooms")?,
            half_bathrooms: row.try_get("half_bathrooms")?,
            parking_spaces: row.try_get("parking_spaces")?,
            total_area_m2: row.try_get("total_area_m2")?,
            covered_area_m2: row.try_get("covered_area_m2")?,
            lot_size_m2: row.try_get("lot_size_m2")?,
            construction_year: row.try_get("construction_year")?,
            address: row.try_get("address")?,
            neighborhood: row.try_get("neighborhood")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            postal_code: row.try_get("postal_code")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            amenities: decode_string_list(row.try_get("amenities")?),
            features: decode_string_list(row.try_get("features")?),
            image_urls: decode_string_list(row.try_get("image_urls")?),
            main_image_url: row.try_get("main_image_url")?,
            agent_name: row.try_get("agent_name")?,
            agent_phone: row.try_get("agent_phone")?,
            agent_email: row.try_get("agent_email")?,
            agency_name: row.try_get("agency_name")?,
            listing_status: row.try_get("listing_status")?,
            status: row.try_get("status")?,
            consecutive_missing_count: row.try_get("consecutive_missing_count")?,
            scrape_priority: row.try_get("scrape_priority")?,
            last_full_scrape_at: row.try_get("last_full_scrape_at")?,
            last_manifest_seen_at: row.try_get("last_manifest_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }
}

/// What a detail scrape produced. Every field is optional; the canonical
/// merge only overwrites with values that are present. `extra` carries
/// attributes the typed record has no column for yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapeRecord {
    pub property_id: Option<String>,
    pub source_url: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub property_type: Option<String>,
    pub operation_type: Option<OperationType>,
    pub bedrooms: Option<i64>,
    pub bathrooms: Option<f64>,
    pub half_bathrooms: Option<i64>,
    pub parking_spaces: Option<i64>,
    pub total_area_m2: Option<f64>,
    pub covered_area_m2: Option<f64>,
    pub lot_size_m2: Option<f64>,
    pub construction_year: Option<i64>,
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub amenities: Option<Vec<String>>,
    pub features: Option<Vec<String>>,
    pub image_urls: Option<Vec<String>>,
    pub main_image_url: Option<String>,
    pub agent_name: Option<String>,
    pub agent_phone: Option<String>,
    pub agent_email: Option<String>,
    pub agency_name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ScrapeRecord {
    /// A record with neither a title nor a price carries nothing worth
    /// persisting; the worker marks such scrapes as failed.
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.price.is_none() && self.description.is_none()
    }
}

/// One entry in the scrape queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub property_id: String,
    pub source_url: String,
    pub priority: i64,
    pub queue_reason: QueueReason,
    pub status: QueueStatus,
    pub metadata: serde_json::Value,
    pub attempt_count: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub run_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for QueueEntry {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let metadata: Option<String> = row.try_get("metadata")?;
        let metadata = metadata
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null);

        Ok(QueueEntry {
            id: row.try_get("id")?,
            property_id: row.try_get("property_id")?,
            source_url: row.try_get("source_url")?,
            priority: row.try_get("priority")?,
            queue_reason: row.try_get("queue_reason")?,
            status: row.try_get("status")?,
            metadata,
            attempt_count: row.try_get("attempt_count")?,
            claimed_at: row.try_get("claimed_at")?,
            claimed_by: row.try_get("claimed_by")?,
            last_error: row.try_get("last_error")?,
            run_id: row.try_get("run_id")?,
            queued_at: row.try_get("queued_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

/// Durable record of one tier execution.
#[derive(Debug, Clone, FromRow)]
pub struct SyncRun {
    pub id: String,
    pub tier_level: i64,
    pub tier_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
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

/// Current queue composition.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub by_priority: Vec<(i64, i64)>,
    pub by_reason: Vec<(String, i64)>,
}
