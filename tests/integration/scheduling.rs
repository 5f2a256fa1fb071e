use crate::fixtures::Harness;
use chrono::Duration as ChronoDuration;
use pincali_core::{db::RunCounters, Clock, RunStatus, SyncError};
use std::time::Duration;

#[tokio::test]
async fn run_scheduled_executes_due_tiers_in_order() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("listing", 100_000.0)]]);

    // T2 and T4 completed moments ago; T1 and T3 have never run.
    for (tier, name) in [(2, "daily_sync"), (4, "monthly_refresh")] {
        let run_id = harness
            .db
            .create_sync_run(tier, name, harness.clock.now())
            .await
            .unwrap();
        harness
            .db
            .finish_sync_run(
                &run_id,
                RunStatus::Completed,
                &RunCounters::default(),
                harness.clock.now(),
            )
            .await
            .unwrap();
    }

    let results = harness.scheduler.run_scheduled().await;

    let levels: Vec<i64> = results.iter().map(|r| r.tier_level).collect();
    assert_eq!(levels, vec![1, 3]);
    assert!(results.iter().all(|r| r.success));
    assert!(harness.scheduler.running_tier().is_none());
}

#[tokio::test]
async fn should_run_follows_tier_frequency() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("listing", 100_000.0)]]);

    assert!(harness.scheduler.should_run(1).await.unwrap());

    let result = harness.scheduler.run_single(1, false).await.unwrap();
    assert!(result.success);
    assert!(!harness.scheduler.should_run(1).await.unwrap());

    harness.clock.advance(ChronoDuration::hours(5));
    assert!(!harness.scheduler.should_run(1).await.unwrap());

    harness.clock.advance(ChronoDuration::minutes(61));
    assert!(harness.scheduler.should_run(1).await.unwrap());
}

#[tokio::test]
async fn failed_runs_do_not_satisfy_the_schedule() {
    let harness = Harness::new().await;
    let run_id = harness
        .db
        .create_sync_run(2, "daily_sync", harness.clock.now())
        .await
        .unwrap();
    harness
        .db
        .finish_sync_run(
            &run_id,
            RunStatus::Failed,
            &RunCounters::default(),
            harness.clock.now(),
        )
        .await
        .unwrap();

    // A failed run is not a successful run; the tier is still due.
    assert!(harness.scheduler.should_run(2).await.unwrap());
}

#[tokio::test]
async fn run_single_fails_fast_when_another_tier_is_running() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("slow", 100_000.0)]]);
    harness.scraper.set_delay(Duration::from_millis(500));

    let scheduler = harness.scheduler.clone();
    let running = tokio::spawn(async move { scheduler.run_single(1, false).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let blocked = harness.scheduler.run_single(2, false).await;
    assert!(matches!(blocked, Err(SyncError::TierBusy(1))));

    let first = running.await.unwrap().unwrap();
    assert!(first.success);
    assert!(harness.scheduler.running_tier().is_none());
}

#[tokio::test]
async fn run_single_with_force_waits_for_the_running_tier() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("slow", 100_000.0)]]);
    harness.scraper.set_delay(Duration::from_millis(500));

    let scheduler = harness.scheduler.clone();
    let running = tokio::spawn(async move { scheduler.run_single(1, false).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    // Force does not fail fast, but it still serializes behind the mutex:
    // by the time it returns, the first tier must have finished.
    let forced = harness.scheduler.run_single(2, true).await.unwrap();
    assert!(forced.success);

    let tier_1_run = harness.db.last_run_for_tier(1).await.unwrap().unwrap();
    assert_eq!(tier_1_run.status, RunStatus::Completed);

    let first = running.await.unwrap().unwrap();
    assert!(first.success);
    assert!(harness.scheduler.running_tier().is_none());
}

#[tokio::test]
async fn cancel_current_run_marks_run_cancelled() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("slow-a", 1.0), ("slow-b", 2.0)]]);
    harness.scraper.set_delay(Duration::from_millis(400));

    let scheduler = harness.scheduler.clone();
    let running = tokio::spawn(async move { scheduler.run_single(1, false).await });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(harness.scheduler.cancel_current_run().await.unwrap());

    let result = running.await.unwrap().unwrap();
    assert!(!result.success);
    assert!(result.errors.iter().any(|e| e.contains("cancelled")));

    let run = harness.db.last_run_for_tier(1).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    // Nothing to cancel once the tier returned.
    assert!(!harness.scheduler.cancel_current_run().await.unwrap());
}

#[tokio::test]
async fn status_reports_per_tier_schedule() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("listing", 100_000.0)]]);

    let result = harness.scheduler.run_single(1, false).await.unwrap();
    assert!(result.success);

    let status = harness.scheduler.status().await.unwrap();
    assert_eq!(status.tiers.len(), 4);
    assert!(status.current_running_tier.is_none());

    let tier_1 = &status.tiers[0];
    assert!(tier_1.last_run_success);
    assert!(!tier_1.is_due);
    assert!(!tier_1.is_running);
    let expected_next = tier_1.last_success_at.unwrap() + ChronoDuration::hours(6);
    assert_eq!(tier_1.next_run_at.unwrap(), expected_next);

    // The other tiers have never run and are due immediately.
    for tier in &status.tiers[1..] {
        assert!(tier.is_due);
        assert!(tier.last_run_at.is_none());
    }
}

#[tokio::test]
async fn run_continuous_respects_iteration_budget_and_cancel() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("listing", 100_000.0)]]);

    let cancel = pincali_engine::CancelToken::new();
    harness
        .scheduler
        .run_continuous(Duration::from_millis(1), Some(2), &cancel)
        .await;
    // Two sweeps ran; the first did all the work.
    assert!(harness.db.last_run_for_tier(1).await.unwrap().is_some());

    let cancelled = pincali_engine::CancelToken::new();
    cancelled.cancel();
    tokio::time::timeout(
        Duration::from_secs(1),
        harness
            .scheduler
            .run_continuous(Duration::from_secs(3600), None, &cancelled),
    )
    .await
    .expect("cancelled scheduler must return promptly");
}

#[tokio::test]
async fn history_and_summary_surface_runs() {
    let harness = Harness::new().await;
    harness.serve_listings(&[&[("listing", 100_000.0)]]);

    harness.scheduler.run_single(1, false).await.unwrap();
    harness.scheduler.run_single(2, false).await.unwrap();

    let all = harness.scheduler.history(None, 10).await.unwrap();
    assert_eq!(all.len(), 2);
    let only_t1 = harness.scheduler.history(Some(1), 10).await.unwrap();
    assert_eq!(only_t1.len(), 1);
    assert_eq!(only_t1[0].tier_level, 1);

    let summary = harness.scheduler.summary(7).await.unwrap();
    assert_eq!(summary.total_runs, 2);
    assert_eq!(summary.successful_runs, 2);
    assert_eq!(summary.total_new_properties, 1);
}
