use crate::models::{OperationType, QueueReason};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// One listing index to walk during manifest scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSource {
    pub name: String,
    pub url: String,
    pub operation_type: OperationType,
}

/// Settings for a single sync tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSettings {
    pub level: i64,
    pub name: String,
    pub display_name: String,
    pub frequency_hours: f64,
    /// Pages to scan per source; 0 means all pages.
    pub pages_to_scan: u32,
    pub delay_between_pages_secs: f64,
    pub delay_between_details_secs: f64,
    /// Days before canonical data counts as stale; 0 = not applicable.
    pub stale_days_threshold: i64,
    pub random_sample_percent: f64,
    pub max_page_failures: usize,
    pub max_error_percent: f64,
    pub retry_attempts: u32,
    pub retry_delay_secs: f64,
    pub max_queue_items: usize,
    pub batch_size: usize,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            level: 1,
            name: "hot_listings".to_string(),
            display_name: "Hot Listings".to_string(),
            frequency_hours: 6.0,
            pages_to_scan: 10,
            delay_between_pages_secs: 2.0,
            delay_between_details_secs: 1.0,
            stale_days_threshold: 0,
            random_sample_percent: 0.0,
            max_page_failures: 10,
            max_error_percent: 10.0,
            retry_attempts: 3,
            retry_delay_secs: 5.0,
            max_queue_items: 10_000,
            batch_size: 50,
        }
    }
}

impl TierSettings {
    fn tier_default(level: i64) -> Self {
        let base = Self::default();
        match level {
            1 => base,
            2 => Self {
                level: 2,
                name: "daily_sync".to_string(),
                display_name: "Daily Sync".to_string(),
                frequency_hours: 24.0,
                pages_to_scan: 100,
                ..base
            },
            3 => Self {
                level: 3,
                name: "weekly_deep".to_string(),
                display_name: "Weekly Deep Scan".to_string(),
                frequency_hours: 168.0,
                pages_to_scan: 0,
                stale_days_threshold: 7,
                ..base
            },
            4 => Self {
                level: 4,
                name: "monthly_refresh".to_string(),
                display_name: "Monthly Refresh".to_string(),
                frequency_hours: 720.0,
                pages_to_scan: 0,
                stale_days_threshold: 30,
                random_sample_percent: 10.0,
                delay_between_details_secs: 2.0,
                ..base
            },
            _ => base,
        }
    }
}

/// Priority assigned to each queue reason; 1 is highest, 5 lowest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Priorities {
    pub new_property: i64,
    pub price_change: i64,
    pub relisted: i64,
    pub verification: i64,
    pub stale_data: i64,
    pub random_sample: i64,
}

impl Default for Priorities {
    fn default() -> Self {
        Self {
            new_property: 1,
            price_change: 2,
            relisted: 2,
            verification: 3,
            stale_data: 4,
            random_sample: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub listing_sources: Vec<ListingSource>,
    pub tiers: Vec<TierSettings>,

    pub user_agent: String,
    pub request_timeout_secs: u64,

    pub manifest_price_change_threshold_percent: f64,
    pub manifest_price_change_threshold_absolute: f64,

    pub min_missing_count_for_removal: i64,

    pub queue_max_pending: usize,
    pub queue_stale_claim_minutes: i64,
    pub queue_cleanup_days: i64,

    pub priorities: Priorities,

    pub max_concurrent_scrapers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.pincali.com".to_string(),
            listing_sources: vec![
                ListingSource {
                    name: "For Sale".to_string(),
                    url: "https://www.pincali.com/en/properties/properties-for-sale".to_string(),
                    operation_type: OperationType::Sale,
                },
                ListingSource {
                    name: "For Rent".to_string(),
                    url: "https://www.pincali.com/en/properties/properties-for-rent".to_string(),
                    operation_type: OperationType::Rent,
                },
                ListingSource {
                    name: "Foreclosure".to_string(),
                    url: "https://www.pincali.com/en/properties/properties-for-foreclosure"
                        .to_string(),
                    operation_type: OperationType::Foreclosure,
                },
                ListingSource {
                    name: "New Construction".to_string(),
                    url: "https://www.pincali.com/en/properties/under-construction".to_string(),
                    operation_type: OperationType::NewConstruction,
                },
            ],
            tiers: (1..=4).map(TierSettings::tier_default).collect(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            request_timeout_secs: 30,
            manifest_price_change_threshold_percent: 1.0,
            manifest_price_change_threshold_absolute: 1000.0,
            min_missing_count_for_removal: 2,
            queue_max_pending: 10_000,
            queue_stale_claim_minutes: 30,
            queue_cleanup_days: 7,
            priorities: Priorities::default(),
            max_concurrent_scrapers: 1,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist. Environment overrides for tier frequencies and
    /// page counts win over file values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let config: SyncConfig = toml::from_str(&raw)
                .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            warn!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            SyncConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        for tier in &mut self.tiers {
            if let Ok(raw) = std::env::var(format!("TIER_{}_FREQUENCY_HOURS", tier.level)) {
                match raw.parse::<f64>() {
                    Ok(hours) if hours > 0.0 => tier.frequency_hours = hours,
                    _ => warn!("Ignoring invalid TIER_{}_FREQUENCY_HOURS={}", tier.level, raw),
                }
            }
            if let Ok(raw) = std::env::var(format!("TIER_{}_PAGES", tier.level)) {
                match raw.parse::<u32>() {
                    Ok(pages) => tier.pages_to_scan = pages,
                    Err(_) => warn!("Ignoring invalid TIER_{}_PAGES={}", tier.level, raw),
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        for level in 1..=4 {
            self.tier(level)?;
        }
        if self.listing_sources.is_empty() {
            return Err(SyncError::Config("no listing sources configured".to_string()));
        }
        for tier in &self.tiers {
            if tier.frequency_hours <= 0.0 {
                return Err(SyncError::Config(format!(
                    "tier {} frequency must be positive",
                    tier.level
                )));
            }
        }
        Ok(())
    }

    pub fn tier(&self, level: i64) -> Result<&TierSettings> {
        self.tiers
            .iter()
            .find(|t| t.level == level)
            .ok_or(SyncError::InvalidTier(level))
    }

    /// Whether a listing-page price differs enough from the canonical price to
    /// count as a change. A zero or negative old price disables the
    /// percentage test.
    pub fn is_significant_price_change(&self, old_price: f64, new_price: f64) -> bool {
        let abs_diff = (new_price - old_price).abs();
        if abs_diff > self.manifest_price_change_threshold_absolute {
            return true;
        }
        if old_price <= 0.0 {
            return false;
        }
        abs_diff / old_price * 100.0 > self.manifest_price_change_threshold_percent
    }

    pub fn priority_for(&self, reason: QueueReason) -> i64 {
        match reason {
            QueueReason::NewProperty => self.priorities.new_property,
            QueueReason::PriceChange => self.priorities.price_change,
            QueueReason::Relisted => self.priorities.relisted,
            QueueReason::Verification => self.priorities.verification,
            QueueReason::StaleData => self.priorities.stale_data,
            QueueReason::RandomSample => self.priorities.random_sample,
        }
    }
}
