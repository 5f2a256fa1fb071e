use sqlx::sqlite::SqlitePool;
use std::fmt;

#[derive(Clone, Debug)]
pub struct Migration {
    version: i32,
    up: &'static str,
    down: &'static str,
}

impl Migration {
    pub const fn new(version: i32, up: &'static str, down: &'static str) -> Self {
        Self { version, up, down }
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Migration {}", self.version)
    }
}

pub const MIGRATIONS: &[Migration] = &[
    Migration::new(
        1,
        r#"
        CREATE TABLE IF NOT EXISTS property_manifest (
            property_id TEXT PRIMARY KEY,
            source_url TEXT NOT NULL,
            listing_price REAL,
            listing_title TEXT,
            latitude REAL,
            longitude REAL,
            operation_type TEXT,
            is_new INTEGER NOT NULL DEFAULT 0,
            price_changed INTEGER NOT NULL DEFAULT 0,
            needs_full_scrape INTEGER NOT NULL DEFAULT 0,
            first_seen_at DATETIME NOT NULL,
            last_seen_at DATETIME NOT NULL,
            seen_in_run_id TEXT,
            updated_at DATETIME NOT NULL
        );

        CREATE INDEX idx_manifest_seen_in_run ON property_manifest(seen_in_run_id);

        CREATE TABLE IF NOT EXISTS properties_live (
            property_id TEXT PRIMARY KEY,
            source_url TEXT NOT NULL,
            price REAL,
            price_at_last_manifest REAL,
            currency TEXT,
            title TEXT,
            description TEXT,
            property_type TEXT,
            operation_type TEXT,
            bedrooms INTEGER,
            bathrooms REAL,
            half_bathrooms INTEGER,
            parking_spaces INTEGER,
            total_area_m2 REAL,
            covered_area_m2 REAL,
            lot_size_m2 REAL,
            construction_year INTEGER,
            address TEXT,
            neighborhood TEXT,
            city TEXT,
            state TEXT,
            postal_code TEXT,
            latitude REAL,
            longitude REAL,
            amenities TEXT,
            features TEXT,
            image_urls TEXT,
            main_image_url TEXT,
            agent_name TEXT,
            agent_phone TEXT,
            agent_email TEXT,
            agency_name TEXT,
            listing_status TEXT NOT NULL DEFAULT 'active',
            status TEXT NOT NULL DEFAULT 'active',
            consecutive_missing_count INTEGER NOT NULL DEFAULT 0,
            scrape_priority INTEGER NOT NULL DEFAULT 3,
            last_full_scrape_at DATETIME,
            last_manifest_seen_at DATETIME,
            last_seen_at DATETIME,
            first_seen_at DATETIME NOT NULL,
            last_updated_at DATETIME NOT NULL
        );

        CREATE INDEX idx_live_listing_status_seen
            ON properties_live(listing_status, last_manifest_seen_at);
        CREATE INDEX idx_live_status ON properties_live(status);
        "#,
        r#"
        DROP INDEX IF EXISTS idx_live_status;
        DROP INDEX IF EXISTS idx_live_listing_status_seen;
        DROP TABLE IF EXISTS properties_live;
        DROP INDEX IF EXISTS idx_manifest_seen_in_run;
        DROP TABLE IF EXISTS property_manifest;
        "#,
    ),
    Migration::new(
        2,
        r#"
        CREATE TABLE IF NOT EXISTS scrape_queue (
            id TEXT PRIMARY KEY,
            property_id TEXT NOT NULL,
            source_url TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 3,
            queue_reason TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            metadata TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            claimed_at DATETIME,
            claimed_by TEXT,
            last_error TEXT,
            run_id TEXT,
            queued_at DATETIME NOT NULL,
            completed_at DATETIME
        );

        CREATE INDEX idx_queue_status_priority
            ON scrape_queue(status, priority, queued_at);

        -- One pending entry per property, duplicate enqueues are no-ops.
        CREATE UNIQUE INDEX idx_queue_pending_property
            ON scrape_queue(property_id) WHERE status = 'pending';
        "#,
        r#"
        DROP INDEX IF EXISTS idx_queue_pending_property;
        DROP INDEX IF EXISTS idx_queue_status_priority;
        DROP TABLE IF EXISTS scrape_queue;
        "#,
    ),
    Migration::new(
        3,
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            tier_level INTEGER NOT NULL,
            tier_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at DATETIME NOT NULL,
            completed_at DATETIME,
            pages_scanned INTEGER NOT NULL DEFAULT 0,
            new_properties_found INTEGER NOT NULL DEFAULT 0,
            price_changes_detected INTEGER NOT NULL DEFAULT 0,
            removals_confirmed INTEGER NOT NULL DEFAULT 0,
            properties_queued INTEGER NOT NULL DEFAULT 0,
            properties_scraped INTEGER NOT NULL DEFAULT 0,
            properties_updated INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            error_summary TEXT,
            execution_time_ms INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_sync_runs_tier_started ON sync_runs(tier_level, started_at);

        CREATE TABLE IF NOT EXISTS scraping_sessions (
            id TEXT PRIMARY KEY,
            session_name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at DATETIME NOT NULL,
            completed_at DATETIME
        );
        "#,
        r#"
        DROP TABLE IF EXISTS scraping_sessions;
        DROP INDEX IF EXISTS idx_sync_runs_tier_started;
        DROP TABLE IF EXISTS sync_runs;
        "#,
    ),
];

pub async fn apply_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at DATETIME NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let applied_versions: Vec<i32> =
        sqlx::query_scalar("SELECT version FROM migrations ORDER BY version")
            .fetch_all(pool)
            .await?;

    for migration in MIGRATIONS {
        if !applied_versions.contains(&migration.version) {
            // SQLite runs one statement per call; split the migration body.
            for statement in split_statements(migration.up) {
                sqlx::query(&statement).execute(pool).await?;
            }

            sqlx::query("INSERT INTO migrations (version, applied_at) VALUES (?, ?)")
                .bind(migration.version)
                .bind(chrono::Utc::now())
                .execute(pool)
                .await?;
        }
    }

    Ok(())
}

pub async fn rollback_migration(pool: &SqlitePool, version: i32) -> Result<(), sqlx::Error> {
    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == version)
        .ok_or_else(|| sqlx::Error::Decode("Migration not found".into()))?;

    for statement in split_statements(migration.down) {
        sqlx::query(&statement).execute(pool).await?;
    }

    sqlx::query("DELETE FROM migrations WHERE version = ?")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}
