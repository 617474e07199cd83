//! Deletion passes, delete order processing and orphan sweeps against a
//! real archive index and real files.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::config::Configuration;
use common::queue::{HEADER_DEAD_LETTER_REASON, Message, publish_message};
use helpers::{TestArchive, days, drain_events};
use ntest::timeout;
use storage_manager::deletion::{
    DELETE_ORDER_QUEUE, DeleteOrder, DeleteOrderProcessor, DeletionScheduler,
    ExternalRetrieveChecker, NoExternalArchive, PassOutcome, PassReport, ProcessOutcome,
    SchedulerSettings,
};
use storage_manager::store::{ArchiveIndex, CandidateLevel, CandidateQuery, Watermark};
use storage_manager::testing::{FlakyIndex, GatedIndex, StaticRetrieveChecker};
use storage_manager::{ArchiveEvent, DeletionMetrics, SweepOutcome};

fn max_age(days: u64) -> impl FnOnce(&mut Configuration) {
    move |config| {
        config.retention.delete_if_not_accessed_for = Duration::from_secs(days * 86_400);
    }
}

fn report(outcome: PassOutcome) -> PassReport {
    match outcome {
        PassOutcome::Completed(report) => report,
        PassOutcome::Skipped => panic!("pass was skipped"),
    }
}

/// Instance UIDs of unclaimed units still on the group.
async fn unclaimed(archive: &TestArchive, level: CandidateLevel) -> Vec<String> {
    archive
        .manager
        .index()
        .find_candidates(&CandidateQuery {
            group_id: archive.manager.config().group.id.clone(),
            level,
            after: Watermark::START,
            before: Utc::now() + days(1),
            limit: 100,
        })
        .await
        .unwrap()
        .into_iter()
        .map(|candidate| candidate.iuid)
        .collect()
}

fn scheduler_with(
    archive: &TestArchive,
    index: Arc<dyn ArchiveIndex>,
    external: Arc<dyn ExternalRetrieveChecker>,
) -> Arc<DeletionScheduler> {
    let manager = &archive.manager;
    let config = manager.config();
    Arc::new(DeletionScheduler::new(
        SchedulerSettings::from_config(&config.group, &config.scheduler),
        manager.policy().clone(),
        index,
        manager.selector().clone(),
        manager.queue().clone(),
        external,
        DeletionMetrics::new(),
    ))
}

fn processor_with(
    archive: &TestArchive,
    index: Arc<dyn ArchiveIndex>,
    retry_intervals: &str,
) -> DeleteOrderProcessor {
    let manager = &archive.manager;
    DeleteOrderProcessor::new(
        manager.queue().clone(),
        index,
        manager.registry().clone(),
        manager.selector().clone(),
        manager.events().clone(),
        manager.metrics().clone(),
        retry_intervals.parse().unwrap(),
        Duration::from_millis(10),
    )
}

/// Age pass → delete orders → files unlinked → events
#[tokio::test]
async fn test_age_pass_deletes_old_studies() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let old_a = archive.store("1.1", "1.1.1", 100, days(40)).await;
    let old_b = archive.store("1.1", "1.1.2", 200, days(40)).await;
    let old_c = archive.store("1.2", "1.2.1", 300, days(35)).await;
    let recent = archive.store("1.3", "1.3.1", 400, days(1)).await;
    let mut rx = archive.manager.events().subscribe();

    let cycle = archive.manager.run_once().await.unwrap();

    let pass = report(cycle.pass);
    assert_eq!(pass.orders_created, 2);
    assert_eq!(pass.bytes_claimed, 600);
    assert_eq!(cycle.orders_processed, 2);
    assert!(matches!(cycle.sweep, SweepOutcome::Completed(ref sweep) if sweep.files_deleted == 0));

    assert!(!old_a.exists());
    assert!(!old_b.exists());
    assert!(!old_c.exists());
    assert!(recent.exists());

    let mut deleted: Vec<(String, usize, u64)> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ArchiveEvent::StudyDeleted {
                study_iuid,
                series_iuid: None,
                files,
                bytes,
                ..
            } => Some((study_iuid, files, bytes)),
            _ => None,
        })
        .collect();
    deleted.sort();
    assert_eq!(
        deleted,
        vec![("1.1".to_string(), 2, 300), ("1.2".to_string(), 1, 300)]
    );

    assert_eq!(unclaimed(&archive, CandidateLevel::Study).await, vec!["1.3"]);
    let summary = archive.manager.metrics().summary();
    assert_eq!(summary.files_deleted, 3);
    assert_eq!(summary.bytes_freed, 600);
}

fn capacity(daily: &'static str) -> impl FnOnce(&mut Configuration) {
    move |config| {
        config.retention.free_space_thresholds = "0-23=50%".to_string();
        config.retention.expected_daily_volume = daily.to_string();
        config.retention.adjust_expected_daily_volume = false;
    }
}

#[tokio::test]
async fn test_capacity_pass_frees_deficit_oldest_first() {
    let archive = TestArchive::new(1, capacity("100000")).await;
    archive.gauge.set(archive.volume_path(0), 30_000, 1_000_000);
    for (i, age) in [10, 9, 8, 7].into_iter().enumerate() {
        archive
            .store(&format!("2.{i}"), &format!("2.{i}.1"), 8_000, days(age))
            .await;
    }

    // 50% of 100000 minus 30000 usable leaves 20000 to free
    let pass = report(archive.manager.scheduler().run_pass().await.unwrap());
    assert_eq!(pass.orders_created, 3);
    assert_eq!(pass.bytes_claimed, 24_000);
    assert!(pass.target_met);
    assert_eq!(unclaimed(&archive, CandidateLevel::Study).await, vec!["2.3"]);
}

#[tokio::test]
#[timeout(10000)]
async fn test_unmet_capacity_target_ends_pass() {
    let archive = TestArchive::new(1, capacity("10000000")).await;
    archive.gauge.set(archive.volume_path(0), 30_000, 1_000_000);
    archive.store("3.1", "3.1.1", 8_000, days(3)).await;
    archive.store("3.2", "3.2.1", 8_000, days(2)).await;

    let pass = report(archive.manager.scheduler().run_pass().await.unwrap());
    assert_eq!(pass.orders_created, 2);
    assert!(!pass.target_met);
    assert!(!pass.cancelled);
}

#[tokio::test]
#[timeout(10000)]
async fn test_unknown_usable_space_skips_capacity_pass() {
    let archive = TestArchive::new(1, capacity("100000")).await;
    archive.gauge.set(archive.volume_path(0), 30_000, 1_000_000);
    let file = archive.store("14.1", "14.1.1", 8_000, days(10)).await;

    // Volume rows no longer load
    sqlx::query("ALTER TABLE volumes DROP COLUMN free_checked_at")
        .execute(archive.manager.database().pool())
        .await
        .unwrap();

    let pass = report(archive.manager.scheduler().run_pass().await.unwrap());
    assert!(pass.usable_space_unknown);
    assert!(!pass.target_met);
    assert_eq!(pass.orders_created, 0);
    assert_eq!(pass.batches, 0);
    assert!(file.exists());
    assert_eq!(unclaimed(&archive, CandidateLevel::Study).await, vec!["14.1"]);
}

#[tokio::test]
#[timeout(10000)]
async fn test_unqualifiable_records_do_not_stall_pass() {
    let archive = TestArchive::new(1, |config| {
        max_age(1)(config);
        config.scheduler.delete_only_if_external_retrievable = true;
        config.scheduler.batch_size = 2;
    })
    .await;

    // A full batch sharing one access time, none retrievable elsewhere
    let tied = Utc::now() - days(10);
    for i in 0..4 {
        archive
            .store_at(&format!("4.{i}"), &format!("4.{i}.1"), 10, tied, Some("FAR"))
            .await;
    }
    archive
        .store_at("4.9", "4.9.1", 10, tied + days(1), Some("FAR"))
        .await;

    let scheduler = scheduler_with(
        &archive,
        archive.manager.index().clone(),
        Arc::new(StaticRetrieveChecker::new(["4.9"])),
    );
    let pass = report(scheduler.run_pass().await.unwrap());

    assert_eq!(pass.orders_created, 1);
    assert_eq!(pass.skipped_candidates, 4);
    assert!(!unclaimed(&archive, CandidateLevel::Study).await.contains(&"4.9".to_string()));
}

#[tokio::test]
async fn test_unreachable_external_archive_keeps_study() {
    let archive = TestArchive::new(1, |config| {
        max_age(1)(config);
        config.scheduler.delete_only_if_external_retrievable = true;
    })
    .await;
    archive
        .store_at("4.5", "4.5.1", 10, Utc::now() - days(10), Some("FAR"))
        .await;

    let scheduler = scheduler_with(
        &archive,
        archive.manager.index().clone(),
        Arc::new(StaticRetrieveChecker::unreachable()),
    );
    let pass = report(scheduler.run_pass().await.unwrap());

    assert_eq!(pass.orders_created, 0);
    assert_eq!(pass.failed_candidates, 1);
    assert_eq!(unclaimed(&archive, CandidateLevel::Study).await, vec!["4.5"]);
}

#[tokio::test]
#[timeout(10000)]
async fn test_only_one_pass_runs_at_a_time() {
    let archive = TestArchive::new(1, max_age(30)).await;
    archive.store("5.1", "5.1.1", 100, days(40)).await;

    let gated = Arc::new(GatedIndex::new(archive.manager.index().clone()));
    let scheduler = scheduler_with(&archive, gated.clone(), Arc::new(NoExternalArchive));

    let first = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run_pass().await }
    });
    gated.wait_entered().await;

    assert_eq!(scheduler.run_pass().await.unwrap(), PassOutcome::Skipped);

    gated.release();
    let pass = report(first.await.unwrap().unwrap());
    assert_eq!(pass.orders_created, 1);
}

#[tokio::test]
#[timeout(10000)]
async fn test_cancel_stops_pass_at_batch_boundary() {
    let archive = TestArchive::new(1, |config| {
        max_age(30)(config);
        config.scheduler.batch_size = 1;
    })
    .await;
    for i in 0..3 {
        archive
            .store(&format!("15.{i}"), &format!("15.{i}.1"), 10, days(40 + i))
            .await;
    }

    let gated = Arc::new(GatedIndex::new(archive.manager.index().clone()));
    let scheduler = scheduler_with(&archive, gated.clone(), Arc::new(NoExternalArchive));
    let running = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.run_pass().await }
    });
    gated.wait_entered().await;
    scheduler.cancel();
    gated.release();

    let pass = report(running.await.unwrap().unwrap());
    assert!(pass.cancelled);
    assert_eq!(pass.orders_created, 1);
    assert_eq!(pass.batches, 1);
    assert_eq!(gated.find_calls(), 1);
    assert_eq!(unclaimed(&archive, CandidateLevel::Study).await.len(), 2);
}

#[tokio::test]
async fn test_cancel_holds_until_resumed() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let file = archive.store("15.5", "15.5.1", 10, days(40)).await;
    let scheduler = archive.manager.scheduler();

    scheduler.cancel();
    let pass = report(scheduler.run_pass().await.unwrap());
    assert!(pass.cancelled);
    assert_eq!(pass.batches, 0);
    assert_eq!(pass.orders_created, 0);

    scheduler.resume();
    let pass = report(scheduler.run_pass().await.unwrap());
    assert!(!pass.cancelled);
    assert_eq!(pass.orders_created, 1);
    assert_eq!(archive.manager.processor().drain().await.unwrap(), 1);
    assert!(!file.exists());
}

#[tokio::test]
async fn test_claims_are_exclusive_across_schedulers() {
    let archive = TestArchive::new(1, |config| {
        max_age(30)(config);
        config.scheduler.batch_size = 3;
    })
    .await;
    for i in 0..10 {
        archive
            .store(&format!("6.{i}"), &format!("6.{i}.1"), 10, days(40 + i))
            .await;
    }

    let a = scheduler_with(&archive, archive.manager.index().clone(), Arc::new(NoExternalArchive));
    let b = scheduler_with(&archive, archive.manager.index().clone(), Arc::new(NoExternalArchive));
    let (first, second) = tokio::join!(a.run_pass(), b.run_pass());

    let orders = report(first.unwrap()).orders_created + report(second.unwrap()).orders_created;
    assert_eq!(orders, 10);
    assert_eq!(
        archive.manager.queue().pending(DELETE_ORDER_QUEUE).await.unwrap(),
        10
    );
    assert!(unclaimed(&archive, CandidateLevel::Study).await.is_empty());

    assert_eq!(archive.manager.processor().drain().await.unwrap(), 10);
}

#[tokio::test]
async fn test_replayed_order_reports_already_gone() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let file = archive.store("7.1", "7.1.1", 100, days(40)).await;
    archive.manager.scheduler().run_pass().await.unwrap();

    // Deliver the same order twice
    let queue = archive.manager.queue();
    let envelope = queue.receive(DELETE_ORDER_QUEUE).await.unwrap().unwrap();
    let order = Message::<DeleteOrder>::from_envelope(&envelope).unwrap().payload;
    queue.ack(DELETE_ORDER_QUEUE, envelope.id).await.unwrap();
    for _ in 0..2 {
        publish_message(
            queue.as_ref(),
            &Message::new(DELETE_ORDER_QUEUE, order.clone()),
        )
        .await
        .unwrap();
    }
    let mut rx = archive.manager.events().subscribe();

    let processor = archive.manager.processor();
    assert_eq!(
        processor.process_next().await.unwrap(),
        Some(ProcessOutcome::Completed {
            files: 1,
            bytes: 100
        })
    );
    assert_eq!(
        processor.process_next().await.unwrap(),
        Some(ProcessOutcome::AlreadyGone)
    );
    assert_eq!(processor.process_next().await.unwrap(), None);

    assert!(!file.exists());
    let deletions = drain_events(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, ArchiveEvent::StudyDeleted { .. }))
        .count();
    assert_eq!(deletions, 1);
}

#[tokio::test]
async fn test_write_after_claim_keeps_study() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let written = archive.store("16.1", "16.1.1", 100, days(40)).await;
    let accessed = archive.store("16.2", "16.2.1", 100, days(45)).await;
    let pass = report(archive.manager.scheduler().run_pass().await.unwrap());
    assert_eq!(pass.orders_created, 2);

    // Both orders are queued when the study is touched again
    let fresh = archive.store("16.1", "16.1.2", 50, days(0)).await;
    archive
        .manager
        .index()
        .record_access("16.2", Utc::now())
        .await
        .unwrap();

    let processor = archive.manager.processor();
    for _ in 0..2 {
        assert_eq!(
            processor.process_next().await.unwrap(),
            Some(ProcessOutcome::ClaimRevoked)
        );
    }
    assert_eq!(processor.process_next().await.unwrap(), None);

    assert!(written.exists());
    assert!(fresh.exists());
    assert!(accessed.exists());
    assert_eq!(archive.manager.metrics().summary().orders_revoked, 2);
    assert_eq!(
        archive.manager.queue().pending(DELETE_ORDER_QUEUE).await.unwrap(),
        0
    );

    // Fresh again, so the next pass leaves them alone
    let pass = report(archive.manager.scheduler().run_pass().await.unwrap());
    assert_eq!(pass.orders_created, 0);
}

#[tokio::test]
async fn test_failed_order_is_retried_on_schedule() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let file = archive.store("8.1", "8.1.1", 100, days(40)).await;
    archive.manager.scheduler().run_pass().await.unwrap();

    let flaky = Arc::new(FlakyIndex::always_failing(archive.manager.index().clone()));
    let processor = processor_with(&archive, flaky.clone(), "0s,1m,NEVER");

    assert_eq!(
        processor.process_next().await.unwrap(),
        Some(ProcessOutcome::Retried {
            failure_count: 1,
            delay: Duration::ZERO
        })
    );
    assert_eq!(
        processor.process_next().await.unwrap(),
        Some(ProcessOutcome::Retried {
            failure_count: 2,
            delay: Duration::from_secs(60)
        })
    );
    // Next delivery is a minute away
    assert_eq!(processor.process_next().await.unwrap(), None);

    assert_eq!(flaky.attempts(), 2);
    assert_eq!(
        archive.manager.queue().pending(DELETE_ORDER_QUEUE).await.unwrap(),
        1
    );
    assert!(file.exists());
}

#[tokio::test]
#[timeout(10000)]
async fn test_order_is_dead_lettered_after_last_retry() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let file = archive.store("9.1", "9.1.1", 100, days(40)).await;
    archive.manager.scheduler().run_pass().await.unwrap();
    let mut rx = archive.manager.events().subscribe();

    let flaky = Arc::new(FlakyIndex::always_failing(archive.manager.index().clone()));
    let processor = processor_with(&archive, flaky.clone(), "0s,0s,NEVER");

    assert_eq!(processor.drain().await.unwrap(), 3);
    assert_eq!(flaky.attempts(), 3);

    let queue = archive.manager.queue();
    assert_eq!(queue.pending(DELETE_ORDER_QUEUE).await.unwrap(), 0);
    let dead = queue.dead_letters(DELETE_ORDER_QUEUE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].headers[HEADER_DEAD_LETTER_REASON].starts_with("failed 3 times"));
    let order = Message::<DeleteOrder>::from_envelope(&dead[0]).unwrap().payload;
    assert_eq!(order.failure_count, 3);
    assert!(order.last_error.is_some());

    let failures: Vec<u32> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ArchiveEvent::DeleteOrderFailed { failure_count, .. } => Some(failure_count),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![3]);

    // The claim stays until an operator intervenes
    assert!(file.exists());
    assert!(unclaimed(&archive, CandidateLevel::Study).await.is_empty());
    let summary = archive.manager.metrics().summary();
    assert_eq!(summary.orders_retried, 2);
    assert_eq!(summary.orders_dead_lettered, 1);
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let file = archive.store("10.1", "10.1.1", 100, days(40)).await;
    archive.manager.scheduler().run_pass().await.unwrap();

    let flaky = Arc::new(FlakyIndex::failing(archive.manager.index().clone(), 1));
    let processor = processor_with(&archive, flaky.clone(), "0s");

    assert_eq!(processor.drain().await.unwrap(), 2);
    assert_eq!(flaky.attempts(), 2);
    assert!(!file.exists());
}

#[tokio::test]
async fn test_dry_run_leaves_everything_in_place() {
    let archive = TestArchive::new(1, |config| {
        max_age(30)(config);
        config.scheduler.dry_run = true;
    })
    .await;
    let a = archive.store("11.1", "11.1.1", 100, days(40)).await;
    let b = archive.store("11.2", "11.2.1", 100, days(50)).await;

    let cycle = archive.manager.run_once().await.unwrap();
    let pass = report(cycle.pass);
    assert_eq!(pass.dry_run_candidates, 2);
    assert_eq!(pass.orders_created, 0);
    assert_eq!(cycle.orders_processed, 0);

    assert!(a.exists() && b.exists());
    assert_eq!(
        unclaimed(&archive, CandidateLevel::Study).await,
        vec!["11.2", "11.1"]
    );
}

#[tokio::test]
async fn test_series_mode_deletes_single_series() {
    let archive = TestArchive::new(1, |config| {
        max_age(30)(config);
        config.scheduler.delete_series_individually = true;
    })
    .await;
    let old = archive.store("12.1", "12.1.1", 100, days(40)).await;
    let recent = archive.store("12.1", "12.1.2", 100, days(1)).await;
    let mut rx = archive.manager.events().subscribe();

    let cycle = archive.manager.run_once().await.unwrap();
    assert_eq!(report(cycle.pass).orders_created, 1);

    assert!(!old.exists());
    assert!(recent.exists());
    let deleted: Vec<(String, Option<String>)> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ArchiveEvent::StudyDeleted {
                study_iuid,
                series_iuid,
                ..
            } => Some((study_iuid, series_iuid)),
            _ => None,
        })
        .collect();
    assert_eq!(
        deleted,
        vec![("12.1".to_string(), Some("12.1.1".to_string()))]
    );
    assert_eq!(unclaimed(&archive, CandidateLevel::Series).await, vec!["12.1.2"]);
    assert_eq!(unclaimed(&archive, CandidateLevel::Study).await, vec!["12.1"]);
}

#[tokio::test]
#[timeout(10000)]
async fn test_unlink_failures_are_left_for_orphan_sweep() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let first = archive.store("13.1", "13.1.1", 100, days(40)).await;
    let second = archive.store("13.1", "13.1.2", 50, days(40)).await;
    let group_id = archive.manager.config().group.id.clone();

    // Volume looks unmounted while the order is processed
    let marker = archive.volume_path(0).join("NO_MOUNT");
    std::fs::write(&marker, b"").unwrap();
    archive.manager.scheduler().run_pass().await.unwrap();
    assert_eq!(
        archive.manager.processor().process_next().await.unwrap(),
        Some(ProcessOutcome::Completed { files: 0, bytes: 0 })
    );
    assert_eq!(archive.manager.metrics().summary().unlink_failures, 2);
    let orphans = archive
        .manager
        .index()
        .orphaned_files(&group_id, 0, 10)
        .await
        .unwrap();
    assert_eq!(orphans.len(), 2);

    // Still unmounted: the sweep ends and keeps the rows
    let SweepOutcome::Completed(sweep) = archive.manager.sweeper().sweep().await.unwrap() else {
        panic!("sweep was skipped");
    };
    assert_eq!(sweep.failed, 2);
    assert_eq!(sweep.files_deleted, 0);
    let summary = archive.manager.metrics().summary();
    assert_eq!(summary.orphan_failures, 2);
    assert_eq!(summary.orphans_deleted, 0);

    std::fs::remove_file(&marker).unwrap();
    let mut rx = archive.manager.events().subscribe();
    let SweepOutcome::Completed(sweep) = archive.manager.sweeper().sweep().await.unwrap() else {
        panic!("sweep was skipped");
    };
    assert_eq!(sweep.files_deleted, 2);
    assert_eq!(sweep.bytes_freed, 150);
    let summary = archive.manager.metrics().summary();
    assert_eq!(summary.orphans_deleted, 2);
    assert_eq!(summary.orphan_bytes_freed, 150);
    assert_eq!(summary.orphan_failures, 2);

    assert!(!first.exists());
    assert!(!second.exists());
    assert!(
        archive
            .manager
            .index()
            .orphaned_files(&group_id, 0, 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(drain_events(&mut rx).contains(&ArchiveEvent::OrphanFilesDeleted {
        group_id,
        files: 2,
        bytes: 150,
    }));
}

#[tokio::test]
#[timeout(10000)]
async fn test_cancelled_sweeper_waits_for_resume() {
    let archive = TestArchive::new(1, max_age(30)).await;
    let file = archive.store("17.1", "17.1.1", 100, days(40)).await;
    let marker = archive.volume_path(0).join("NO_MOUNT");
    std::fs::write(&marker, b"").unwrap();
    archive.manager.run_once().await.unwrap();
    std::fs::remove_file(&marker).unwrap();

    let sweeper = archive.manager.sweeper();
    sweeper.cancel();
    let SweepOutcome::Completed(sweep) = sweeper.sweep().await.unwrap() else {
        panic!("sweep was skipped");
    };
    assert!(sweep.cancelled);
    assert_eq!(sweep.batches, 0);
    assert!(file.exists());

    sweeper.resume();
    let SweepOutcome::Completed(sweep) = sweeper.sweep().await.unwrap() else {
        panic!("sweep was skipped");
    };
    assert!(!sweep.cancelled);
    assert_eq!(sweep.files_deleted, 1);
    assert!(!file.exists());
}
