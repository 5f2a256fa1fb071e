pub mod clock;
pub mod config;
pub mod db;
pub mod fingerprint;
pub mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ListingSource, Priorities, SyncConfig, TierSettings};
pub use db::Database;
pub use fingerprint::{normalize_url, property_id};
pub use models::{
    CanonicalProperty, ListingStatus, ManifestEntry, ManifestRecord, OperationType, QueueEntry,
    QueueReason, QueueStats, QueueStatus, RecordStatus, RunStatus, ScrapeRecord, SyncRun,
};

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Scrape error: {0}")]
    Scrape(String),
    #[error("Invalid tier level: {0}")]
    InvalidTier(i64),
    #[error("Tier {0} is currently running")]
    TierBusy(i64),
}
