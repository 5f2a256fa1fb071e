use crate::fixtures::{detail_url, prop_id, Harness};
use pincali_core::{
    Clock, ListingStatus, OperationType, QueueEntry, QueueReason, QueueStatus, RecordStatus,
};

#[tokio::test]
async fn fresh_install_tier_1_scrapes_everything() {
    let harness = Harness::new().await;
    harness.serve_listings(&[
        &[("casa-a", 100_000.0), ("casa-b", 200_000.0), ("casa-c", 300_000.0)],
        &[("casa-d", 400_000.0), ("casa-e", 500_000.0), ("casa-f", 600_000.0)],
    ]);

    let result = harness.scheduler.run_single(1, false).await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.pages_scanned, 2);
    assert_eq!(result.new_properties, 6);
    assert_eq!(result.properties_queued, 6);
    assert_eq!(result.properties_scraped, 6);

    // All six went through the queue at new-property priority.
    let completed_high_priority: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM scrape_queue WHERE priority = 1 AND status = 'completed'",
    )
    .fetch_one(harness.db.pool())
    .await
    .unwrap();
    assert_eq!(completed_high_priority, 6);

    assert_eq!(harness.db.count_active().await.unwrap(), 6);
    let one = harness
        .db
        .get_canonical(&prop_id("casa-a"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.status, RecordStatus::Active);
    assert_eq!(one.price, Some(100_000.0));
    assert!(one.last_full_scrape_at.is_some());
}

#[tokio::test]
async fn tier_2_detects_and_applies_price_change() {
    let harness = Harness::new().await;
    harness.seed_canonical("repriced", 100_000.0).await;
    harness.serve_listings(&[
        &[("repriced", 105_000.0)],
        &[("fresh", 90_000.0)],
    ]);

    let result = harness.scheduler.run_single(2, false).await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.price_changes, 1);
    assert_eq!(result.new_properties, 1);

    let entry = sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM scrape_queue WHERE property_id = ?",
    )
    .bind(prop_id("repriced"))
    .fetch_one(harness.db.pool())
    .await
    .unwrap();
    assert_eq!(entry.queue_reason, QueueReason::PriceChange);
    assert_eq!(entry.priority, 2);
    assert_eq!(entry.status, QueueStatus::Completed);
    assert_eq!(entry.metadata["old_price"], 100_000.0);
    assert_eq!(entry.metadata["new_price"], 105_000.0);

    let canonical = harness
        .db
        .get_canonical(&prop_id("repriced"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canonical.price, Some(105_000.0));
    // The observed listing price was copied over after the drain.
    assert_eq!(canonical.price_at_last_manifest, Some(105_000.0));
}

#[tokio::test]
async fn tier_3_confirms_removal_via_head_probe() {
    let harness = Harness::new().await;
    harness.seed_canonical("gone", 250_000.0).await;
    // One earlier full scan already missed it.
    harness
        .db
        .maintain_missing_counts("warmup", &[OperationType::Sale], harness.clock.now())
        .await
        .unwrap();

    harness.serve_listings(&[&[("other", 300_000.0)]]);
    harness.fetcher.set_head(&detail_url("gone"), 404, None);

    let result = harness.scheduler.run_single(3, false).await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.removals_confirmed, 1);

    let gone = harness
        .db
        .get_canonical(&prop_id("gone"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone.listing_status, ListingStatus::ConfirmedRemoved);
    assert_eq!(gone.status, RecordStatus::Removed);
    assert_eq!(gone.consecutive_missing_count, 2);
    assert!(harness
        .db
        .get_manifest_entry(&prop_id("gone"))
        .await
        .unwrap()
        .is_none());

    // The observed property is untouched.
    let other = harness
        .db
        .get_canonical(&prop_id("other"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(other.status, RecordStatus::Active);
}

#[tokio::test]
async fn tier_3_survives_probe_that_finds_page_alive() {
    let harness = Harness::new().await;
    harness.seed_canonical("hiding", 250_000.0).await;
    harness
        .db
        .maintain_missing_counts("warmup", &[OperationType::Sale], harness.clock.now())
        .await
        .unwrap();

    harness.serve_listings(&[&[("other", 300_000.0)]]);
    // Page still answers 200: not a removal.
    harness.fetcher.set_head(&detail_url("hiding"), 200, None);

    let result = harness.scheduler.run_single(3, false).await.unwrap();

    assert!(result.success);
    assert_eq!(result.removals_confirmed, 0);

    let hiding = harness
        .db
        .get_canonical(&prop_id("hiding"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hiding.listing_status, ListingStatus::Active);
    assert_eq!(hiding.consecutive_missing_count, 0);
}

#[tokio::test]
async fn tier_2_marks_relisted_property() {
    let harness = Harness::new().await;
    harness.seed_canonical("back", 150_000.0).await;
    harness
        .db
        .mark_confirmed_removed(&[prop_id("back").as_str()], harness.clock.now())
        .await
        .unwrap();

    harness.serve_listings(&[
        &[("back", 150_000.0)],
        &[("filler", 90_000.0)],
    ]);
    // Keep the drain from overwriting the relist marking so it stays visible.
    harness.scraper.fail_url(&detail_url("back"));

    let result = harness.scheduler.run_single(2, false).await.unwrap();

    assert!(result.success);
    assert_eq!(result.relisted_count, 1);

    let entry = sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM scrape_queue WHERE property_id = ?",
    )
    .bind(prop_id("back"))
    .fetch_one(harness.db.pool())
    .await
    .unwrap();
    assert_eq!(entry.queue_reason, QueueReason::Relisted);
    assert_eq!(entry.priority, 2);

    let back = harness
        .db
        .get_canonical(&prop_id("back"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(back.listing_status, ListingStatus::Relisted);
    assert_eq!(back.status, RecordStatus::Active);
    assert_eq!(back.consecutive_missing_count, 0);
}

#[tokio::test]
async fn rerunning_a_tier_with_no_upstream_changes_is_idempotent() {
    let harness = Harness::new().await;
    harness.serve_listings(&[
        &[("stable-a", 100_000.0)],
        &[("stable-b", 200_000.0)],
    ]);

    let first = harness.scheduler.run_single(2, false).await.unwrap();
    assert!(first.success);
    assert_eq!(first.new_properties, 2);
    assert_eq!(first.properties_scraped, 2);

    let second = harness.scheduler.run_single(2, false).await.unwrap();
    assert!(second.success);
    assert_eq!(second.new_properties, 0);
    assert_eq!(second.price_changes, 0);
    assert_eq!(second.removals_confirmed, 0);
    assert_eq!(second.properties_queued, 0);

    assert_eq!(harness.db.count_active().await.unwrap(), 2);
}

#[tokio::test]
async fn tier_run_with_no_reachable_pages_still_produces_a_run_row() {
    let harness = Harness::new().await;
    // Nothing served: every page fetch 404s.

    let result = harness.scheduler.run_single(1, false).await.unwrap();

    assert!(result.success);
    assert_eq!(result.pages_scanned, 0);
    assert_eq!(result.new_properties, 0);
    assert_eq!(result.properties_queued, 0);

    let run = harness
        .db
        .last_run_for_tier(1)
        .await
        .unwrap()
        .expect("sync run row must exist");
    assert_eq!(run.id, result.run_id.unwrap());
    assert!(run.error_count > 0);
}

#[tokio::test]
async fn tier_3_on_empty_store_reports_all_found_as_new() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[
        ("n1", 100_000.0),
        ("n2", 200_000.0),
        ("n3", 300_000.0),
    ]]);

    let result = harness.scheduler.run_single(3, false).await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.new_properties, 3);
    assert_eq!(result.removals_confirmed, 0);
    assert_eq!(harness.db.count_active().await.unwrap(), 3);
}

#[tokio::test]
async fn failed_scrape_leaves_entry_failed_and_tier_successful() {
    let harness = Harness::new().await;
    harness.serve_listings(&[
        &[("good", 100_000.0)],
        &[("broken", 200_000.0)],
    ]);
    harness.scraper.fail_url(&detail_url("broken"));

    let result = harness.scheduler.run_single(1, false).await.unwrap();

    // Individual scrape failures are counted, not fatal.
    assert!(result.success);
    assert_eq!(result.properties_scraped, 1);
    assert!(result.errors.iter().any(|e| e.contains("failed to scrape")));

    let entry = sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM scrape_queue WHERE property_id = ?",
    )
    .bind(prop_id("broken"))
    .fetch_one(harness.db.pool())
    .await
    .unwrap();
    assert_eq!(entry.status, QueueStatus::Failed);
    assert!(entry.last_error.is_some());

    assert!(harness
        .db
        .get_canonical(&prop_id("broken"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn tier_4_refreshes_stale_records() {
    let harness = Harness::new().await;
    harness.seed_canonical("dusty", 100_000.0).await;
    harness.seed_canonical("dustier", 200_000.0).await;
    harness.scraper.stock_listing("dusty", 110_000.0);
    harness.scraper.stock_listing("dustier", 210_000.0);

    // Let both records age past the tier-4 staleness threshold.
    harness.clock.advance(chrono::Duration::days(31));

    let result = harness.scheduler.run_single(4, false).await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.pages_scanned, 0);
    assert_eq!(result.properties_queued, 2);
    assert_eq!(result.properties_scraped, 2);

    let reasons: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT queue_reason FROM scrape_queue ORDER BY queue_reason",
    )
    .fetch_all(harness.db.pool())
    .await
    .unwrap();
    assert!(reasons.contains(&"stale_data".to_string()));

    let dusty = harness
        .db
        .get_canonical(&prop_id("dusty"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dusty.price, Some(110_000.0));
}
