mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{Harness, PATIENCE, drain};
use kestrel_engine::EngineError;
use kestrel_events::{Event, TaskState};
use kestrel_test_support::{FixtureManifest, PANIC_MARKER, magnet_uri, wait_until};
use kestrel_torrent_core::{PiecePriority, TaskId, TaskKind, TorrentError};

#[tokio::test]
async fn overflow_beyond_limit_is_queued_in_order() -> Result<()> {
    let harness = Harness::start(|cfg| cfg.max_concurrent_tasks = 2).await?;
    let engine = &harness.engine;

    engine.add_magnet(&magnet_uri("aa", "first")).await?;
    engine.add_magnet(&magnet_uri("bb", "second")).await?;
    match engine.add_magnet(&magnet_uri("cc", "third")).await {
        Err(EngineError::MaxConcurrentReached { task_id, position }) => {
            assert_eq!(task_id.as_str(), "cc");
            assert_eq!(position, 0, "positions count from the head of the wait list");
        }
        other => panic!("expected the third task to be queued, got {other:?}"),
    }
    let err = engine
        .add_magnet(&magnet_uri("dd", "fourth"))
        .await
        .expect_err("fourth task queues behind the third");
    assert!(matches!(err, EngineError::MaxConcurrentReached { position: 1, .. }));

    let protocol = harness.protocol()?;
    assert_eq!(protocol.added_ids(), vec![TaskId::new("aa"), TaskId::new("bb")]);
    assert_eq!(engine.queued().await, vec![TaskId::new("cc"), TaskId::new("dd")]);
    let queued = harness.snapshot(&TaskId::new("cc")).await?;
    assert_eq!(queued.state, TaskState::Queued);
    assert_eq!(queued.name, "third");

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.active_tasks, 2);
    assert_eq!(snapshot.queue_depth, 2);
    assert_eq!(snapshot.tasks_queued_total, 2);
    Ok(())
}

#[tokio::test]
async fn deleting_an_active_task_admits_the_oldest_queued() -> Result<()> {
    let harness = Harness::start(|cfg| cfg.max_concurrent_tasks = 1).await?;
    let engine = &harness.engine;
    let first = engine.add_magnet(&magnet_uri("aa", "first")).await?;
    let _ = engine.add_magnet(&magnet_uri("bb", "second")).await;
    let second = TaskId::new("bb");

    harness.scripted(&first)?.resolve("first", &[("first.bin", 8)]);
    harness
        .wait_for_task("first task started", &first, |task| task.state == TaskState::Started)
        .await?;
    assert_eq!(harness.snapshot(&second).await?.state, TaskState::Queued);

    engine.delete_task(&first).await?;
    let protocol = harness.protocol()?;
    wait_until("second task admitted", PATIENCE, || {
        let protocol = protocol.clone();
        async move { protocol.added_ids().len() == 2 }
    })
    .await?;
    assert!(engine.queued().await.is_empty());
    assert_eq!(harness.scripted(&first)?.release_count(), 1);

    harness.scripted(&second)?.resolve("second", &[("second.bin", 4)]);
    harness
        .wait_for_task("second task started", &second, |task| task.state == TaskState::Started)
        .await?;
    Ok(())
}

#[tokio::test]
async fn deleting_a_queued_task_never_reaches_the_protocol() -> Result<()> {
    let harness = Harness::start(|cfg| cfg.max_concurrent_tasks = 1).await?;
    let engine = &harness.engine;
    engine.add_magnet(&magnet_uri("aa", "first")).await?;
    let _ = engine.add_magnet(&magnet_uri("bb", "second")).await;
    let queued = TaskId::new("bb");
    let cache_file = harness.root.path().join(".cachedTorrents").join("bb.magnet");
    assert!(cache_file.exists());

    engine.delete_task(&queued).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.protocol()?.added_ids(), vec![TaskId::new("aa")]);
    assert!(engine.queued().await.is_empty());
    assert!(!cache_file.exists());
    assert!(matches!(
        engine.task(&queued).await,
        Err(EngineError::TaskNotFound { .. })
    ));
    assert!(matches!(
        engine.delete_task(&queued).await,
        Err(EngineError::TaskNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn repeated_start_and_stop_leave_state_untouched() -> Result<()> {
    let harness = Harness::start(|cfg| cfg.auto_start = false).await?;
    let engine = &harness.engine;
    let id = engine.add_magnet(&magnet_uri("aa", "idle")).await?;
    let scripted = harness.scripted(&id)?;
    scripted.resolve("idle", &[("idle.bin", 16)]);
    harness
        .wait_for_task("metadata attached", &id, |task| task.state == TaskState::Stopped)
        .await?;
    assert!(!scripted.download_allowed());

    engine.start_task(&id).await?;
    let started = harness.snapshot(&id).await?;
    assert!(scripted.download_allowed() && scripted.upload_allowed());
    assert_eq!(scripted.file(0).context("file")?.priority(), PiecePriority::Normal);

    assert!(matches!(
        engine.start_task(&id).await,
        Err(EngineError::AlreadyStarted { path: None, .. })
    ));
    assert!(matches!(
        engine.manual_start_task(&id).await,
        Err(EngineError::AlreadyStarted { .. })
    ));
    let after = harness.snapshot(&id).await?;
    assert_eq!(after.started_at, started.started_at);
    assert!(!after.manual_started);

    engine.stop_task(&id).await?;
    let stopped = harness.snapshot(&id).await?;
    assert_eq!(stopped.state, TaskState::Stopped);
    assert!(!scripted.download_allowed());
    assert_eq!(scripted.file(0).context("file")?.priority(), PiecePriority::None);

    assert!(matches!(
        engine.stop_task(&id).await,
        Err(EngineError::AlreadyStopped { .. })
    ));
    assert_eq!(harness.snapshot(&id).await?.stopped_at, stopped.stopped_at);
    Ok(())
}

#[tokio::test]
async fn stopping_the_last_file_stops_the_task() -> Result<()> {
    let harness = Harness::start(|_| {}).await?;
    let engine = &harness.engine;
    let manifest = FixtureManifest::new("ee", "album")
        .with_file("album/a.flac", 10)
        .with_file("album/b.flac", 20);
    let id = engine.add_manifest(&manifest.encode()).await?;
    harness
        .wait_for_task("task auto-started", &id, |task| {
            task.state == TaskState::Started && task.files.iter().all(|file| file.started)
        })
        .await?;

    engine.stop_file(&id, "album/a.flac").await?;
    assert!(harness.snapshot(&id).await?.started, "one file still selected");
    assert!(matches!(
        engine.stop_file(&id, "album/a.flac").await,
        Err(EngineError::AlreadyStopped { path: Some(_), .. })
    ));
    assert!(matches!(
        engine.stop_file(&id, "album/missing.flac").await,
        Err(EngineError::MissingFile { .. })
    ));

    engine.stop_file(&id, "album/b.flac").await?;
    harness
        .wait_for_task("cascaded stop", &id, |task| task.state == TaskState::Stopped)
        .await?;

    engine.start_file(&id, "album/a.flac").await?;
    let snapshot = harness.snapshot(&id).await?;
    assert!(!snapshot.started, "starting a file leaves the task stopped");
    assert!(snapshot.files[0].started);
    let scripted = harness.scripted(&id)?;
    assert_eq!(scripted.file(0).context("file")?.priority(), PiecePriority::Normal);
    assert!(matches!(
        engine.start_file(&id, "album/a.flac").await,
        Err(EngineError::AlreadyStarted { path: Some(_), .. })
    ));
    Ok(())
}

#[tokio::test]
async fn malformed_descriptors_are_rejected_without_side_effects() -> Result<()> {
    let harness = Harness::start(|_| {}).await?;
    let engine = &harness.engine;

    match engine.add_magnet(&magnet_uri("aa", PANIC_MARKER)).await {
        Err(EngineError::MalformedDescriptor { kind, reason }) => {
            assert_eq!(kind, TaskKind::Magnet);
            assert!(reason.contains("exploded"), "panic message kept: {reason}");
        }
        other => panic!("expected a malformed descriptor, got {other:?}"),
    }
    assert!(matches!(
        engine.add_magnet("http://not-a-magnet").await,
        Err(EngineError::MalformedDescriptor { .. })
    ));
    assert!(matches!(
        engine.add_manifest(b"name=orphan").await,
        Err(EngineError::MalformedDescriptor {
            kind: TaskKind::Manifest,
            ..
        })
    ));
    assert!(engine.tasks().await.is_empty());
    assert!(harness.protocol()?.added_ids().is_empty());

    engine.add_magnet(&magnet_uri("bb", "healthy")).await?;
    assert_eq!(engine.tasks().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn duplicates_and_unconfigured_engines_are_refused() -> Result<()> {
    let harness = Harness::start(|_| {}).await?;
    let engine = &harness.engine;
    engine.add_magnet(&magnet_uri("AA", "first")).await?;
    assert!(matches!(
        engine.add_magnet(&magnet_uri("aa", "again")).await,
        Err(EngineError::AlreadyExists { .. })
    ));

    engine.shutdown().await;
    assert!(matches!(
        engine.add_magnet(&magnet_uri("bb", "late")).await,
        Err(EngineError::NotConfigured)
    ));
    Ok(())
}

#[tokio::test]
async fn drop_takes_precedence_over_metadata() -> Result<()> {
    let harness = Harness::start(|_| {}).await?;
    let engine = &harness.engine;
    let mut events = engine.events().subscribe(None);
    let id = engine.add_magnet(&magnet_uri("aa", "racing")).await?;
    let scripted = harness.scripted(&id)?;
    let dropped = engine.drop_signal(&id).await?;

    // The worker cannot run between these two calls on the test runtime.
    scripted.resolve("racing", &[("racing.bin", 1)]);
    engine.delete_task(&id).await?;
    assert!(dropped.is_cancelled());

    wait_until("handle released", PATIENCE, || {
        let scripted = scripted.clone();
        async move { scripted.release_count() == 1 }
    })
    .await?;
    let seen = drain(&mut events).await;
    assert!(
        !seen
            .iter()
            .any(|event| matches!(event, Event::FilesDiscovered { .. })),
        "metadata handling must not run after a drop: {seen:?}"
    );
    assert!(
        seen.iter()
            .any(|event| matches!(event, Event::TaskRemoved { task_id } if task_id == "aa"))
    );
    let cache_dir = harness.root.path().join(".cachedTorrents");
    assert!(!cache_dir.join("aa.torrent").exists());
    assert!(!cache_dir.join("aa.magnet").exists());
    assert_eq!(scripted.release_count(), 1);
    Ok(())
}

#[tokio::test]
async fn public_trackers_are_added_to_bare_magnets() -> Result<()> {
    let tracker = "udp://tracker.example:1337/announce";
    let harness = Harness::start(|cfg| cfg.trackers = vec![tracker.to_string()]).await?;
    let engine = &harness.engine;

    let bare = engine.add_magnet(&magnet_uri("aa", "bare")).await?;
    assert_eq!(harness.scripted(&bare)?.trackers(), vec![tracker.to_string()]);

    let announced = format!("{}&tr=udp://own.example:1", magnet_uri("bb", "announced"));
    let id = engine.add_magnet(&announced).await?;
    assert!(harness.scripted(&id)?.trackers().is_empty());
    Ok(())
}

#[tokio::test]
async fn protocol_refusal_leaves_no_task_behind() -> Result<()> {
    let harness = Harness::start(|cfg| cfg.max_concurrent_tasks = 1).await?;
    let engine = &harness.engine;
    let protocol = harness.protocol()?;
    protocol.reject_adds(true);

    match engine.add_magnet(&magnet_uri("aa", "refused")).await {
        Err(EngineError::Protocol(TorrentError::OperationFailed {
            operation, task_id, ..
        })) => {
            assert_eq!(operation, "add_task");
            assert_eq!(task_id, Some(TaskId::new("aa")));
        }
        other => panic!("expected a protocol failure, got {other:?}"),
    }
    assert!(engine.tasks().await.is_empty());

    protocol.reject_adds(false);
    let id = engine.add_magnet(&magnet_uri("aa", "accepted")).await?;
    assert_eq!(harness.snapshot(&id).await?.state, TaskState::Pending);
    Ok(())
}

#[tokio::test]
async fn change_notifications_coalesce() -> Result<()> {
    let harness = Harness::start(|_| {}).await?;
    let engine = &harness.engine;
    let changes = engine.changes();
    while changes.try_take() {}

    engine.add_magnet(&magnet_uri("aa", "one")).await?;
    engine.add_magnet(&magnet_uri("bb", "two")).await?;
    assert!(changes.try_take(), "a change is pending");
    assert!(!changes.try_take(), "notifications coalesce into one slot");

    engine.delete_task(&TaskId::new("aa")).await?;
    tokio::time::timeout(PATIENCE, changes.changed()).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_never_exceed_the_limit() -> Result<()> {
    let harness = Harness::start(|cfg| cfg.max_concurrent_tasks = 2).await?;
    let submissions: Vec<_> = (0..6)
        .map(|index| {
            let engine = Arc::clone(&harness.engine);
            tokio::spawn(async move {
                engine
                    .add_magnet(&magnet_uri(&format!("{index:02x}"), "burst"))
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    let mut queued = 0;
    for submission in submissions {
        match submission.await? {
            Ok(_) => admitted += 1,
            Err(EngineError::MaxConcurrentReached { .. }) => queued += 1,
            Err(other) => panic!("unexpected submission failure: {other}"),
        }
    }
    assert_eq!((admitted, queued), (2, 4));
    assert_eq!(harness.protocol()?.added_ids().len(), 2);
    assert_eq!(harness.engine.queued().await.len(), 4);
    Ok(())
}

#[tokio::test]
async fn resolved_tasks_skip_the_metadata_wait() -> Result<()> {
    let harness = Harness::start(|_| {}).await?;
    let engine = &harness.engine;
    let manifest = FixtureManifest::new("ee", "ready").with_file("ready.bin", 4);
    let ready = engine.add_manifest(&manifest.encode()).await?;
    harness
        .wait_for_task("manifest task started", &ready, |task| task.state == TaskState::Started)
        .await?;
    assert_eq!(harness.scripted(&ready)?.metadata_waits(), 0);

    let pending = engine.add_magnet(&magnet_uri("ff", "later")).await?;
    let scripted = harness.scripted(&pending)?;
    wait_until("worker waiting on metadata", PATIENCE, || {
        let scripted = scripted.clone();
        async move { scripted.metadata_waits() == 1 }
    })
    .await?;
    assert_eq!(harness.snapshot(&pending).await?.state, TaskState::Pending);
    Ok(())
}
