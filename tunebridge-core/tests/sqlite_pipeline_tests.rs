//! Playlist pipeline over the on-disk SQLite task store

mod helpers;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tunebridge_common::{EntityKind, ErrorKind, Platform, TaskOutcome, TaskStatus};

use helpers::*;
use tunebridge_core::adapters::PlatformAdapter;
use tunebridge_core::db::{init_database_pool, SqliteTaskStore, TaskStore};
use tunebridge_core::models::{conversion_checksum, LinkInfo, Task};
use tunebridge_core::TaskTracker;

async fn sqlite_store(dir: &TempDir) -> Arc<dyn TaskStore> {
    let pool = init_database_pool(&dir.path().join("tunebridge.db")).await.unwrap();
    Arc::new(SqliteTaskStore::new(pool, 2_000))
}

fn road_trip_link() -> LinkInfo {
    LinkInfo::new(
        Platform::Deezer,
        EntityKind::Playlist,
        "908622995",
        "https://www.deezer.com/playlist/908622995",
    )
}

fn road_trip_deezer() -> Arc<MockAdapter> {
    Arc::new(MockAdapter::new(Platform::Deezer).with_playlist(playlist_meta("908622995", "Road trip"), road_trip_tracks()))
}

/// Leave a processing task behind, as a process killed mid-run would
async fn stranded_task(store: &Arc<dyn TaskStore>) -> Task {
    let tracker = TaskTracker::new(store.clone(), 3);
    let candidate = Task::new(
        conversion_checksum(Platform::Deezer, "908622995", &[Platform::Tidal], None),
        Platform::Deezer,
        "908622995",
        EntityKind::Playlist,
        vec![Platform::Tidal],
        None,
    );
    let (task, _) = tracker.get_or_create(candidate).await.unwrap();
    tracker.advance(task.id, TaskStatus::Processing, None).await.unwrap()
}

fn adapters(deezer: &Arc<MockAdapter>) -> Vec<Arc<dyn PlatformAdapter>> {
    vec![
        deezer.clone(),
        Arc::new(MockAdapter::new(Platform::Tidal).with_catalog(tidal_catalog())),
    ]
}

#[tokio::test]
async fn test_completed_conversion_survives_restart() {
    let dir = TempDir::new().unwrap();
    let link = LinkInfo::new(
        Platform::Deezer,
        EntityKind::Playlist,
        "908622995",
        "https://www.deezer.com/playlist/908622995",
    );

    let deezer = Arc::new(
        MockAdapter::new(Platform::Deezer).with_playlist(playlist_meta("908622995", "Road trip"), road_trip_tracks()),
    );

    let task_id = {
        let (engine, delivery) =
            build_engine_with_store(adapters(&deezer), fast_settings(), 3, sqlite_store(&dir).await);
        let task = engine.convert_playlist(&link, &[Platform::Tidal], None).await.unwrap();
        delivery.wait_for_terminal(task.id).await;
        task.id
    };

    // fresh engine, same database
    let (engine, delivery) =
        build_engine_with_store(adapters(&deezer), fast_settings(), 3, sqlite_store(&dir).await);
    let task = engine.convert_playlist(&link, &[Platform::Tidal], None).await.unwrap();

    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(delivery.events().is_empty());
    assert_eq!(deezer.playlist_fetches(), 1);

    let conversion = engine.playlist_result(&task.checksum).await.unwrap().unwrap();
    assert_eq!(conversion.meta.title, "Road trip");
    assert_eq!(conversion.platforms[&Platform::Tidal].len(), 2);
    assert_eq!(conversion.omitted_tracks.len(), 1);
}

#[tokio::test]
async fn test_concurrent_submissions_share_one_row() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let deezer = Arc::new(
        MockAdapter::new(Platform::Deezer).with_playlist(playlist_meta("908622995", "Road trip"), road_trip_tracks()),
    );
    let (engine, delivery) = build_engine_with_store(adapters(&deezer), fast_settings(), 3, store);

    let link = LinkInfo::new(
        Platform::Deezer,
        EntityKind::Playlist,
        "908622995",
        "https://www.deezer.com/playlist/908622995",
    );

    let submissions = (0..8).map(|_| {
        let engine = engine.clone();
        let link = link.clone();
        tokio::spawn(async move { engine.convert_playlist(&link, &[Platform::Tidal], None).await })
    });
    let tasks: Vec<_> = futures::future::join_all(submissions)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let id = tasks[0].id;
    assert!(tasks.iter().all(|t| t.id == id));

    delivery.wait_for_terminal(id).await;
    assert_eq!(deezer.playlist_fetches(), 1);
    assert_eq!(engine.task(id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_abandoned_task_is_restarted() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let stranded = stranded_task(&store).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let deezer = road_trip_deezer();
    let (engine, delivery) =
        build_engine_with_lease(adapters(&deezer), fast_settings(), 3, store, Duration::from_millis(50));
    let task = engine.convert_playlist(&road_trip_link(), &[Platform::Tidal], None).await.unwrap();

    assert_eq!(task.id, stranded.id);
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.retry_count, 1);

    delivery.wait_for_terminal(task.id).await;
    let stored = engine.task(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(deezer.playlist_fetches(), 1);
    assert!(delivery.events_for(task.id).iter().all(|e| e.run() == 1));
}

#[tokio::test]
async fn test_abandoned_task_without_retries_stays_failed() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let stranded = stranded_task(&store).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let deezer = road_trip_deezer();
    let (engine, delivery) =
        build_engine_with_lease(adapters(&deezer), fast_settings(), 0, store, Duration::from_millis(50));
    let task = engine.convert_playlist(&road_trip_link(), &[Platform::Tidal], None).await.unwrap();

    assert_eq!(task.id, stranded.id);
    assert_eq!(task.status, TaskStatus::Failed);
    let Some(TaskOutcome::Failed(failure)) = &task.outcome else {
        panic!("expected failed outcome, got {:?}", task.outcome);
    };
    assert_eq!(failure.kind, ErrorKind::TaskFatal);
    assert!(failure.reason.starts_with("abandoned"));
    assert_eq!(deezer.playlist_fetches(), 0);
    assert!(delivery.events().is_empty());
}

#[tokio::test]
async fn test_task_within_lease_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let stranded = stranded_task(&store).await;

    let deezer = road_trip_deezer();
    let (engine, delivery) = build_engine_with_store(adapters(&deezer), fast_settings(), 3, store);
    let task = engine.convert_playlist(&road_trip_link(), &[Platform::Tidal], None).await.unwrap();

    assert_eq!(task.id, stranded.id);
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.retry_count, 0);
    assert_eq!(deezer.playlist_fetches(), 0);
    assert!(delivery.events().is_empty());

    // owned elsewhere: not ours to cancel
    assert!(!engine.cancel(task.id).await.unwrap());
}

#[tokio::test]
async fn test_abandoned_task_can_be_cancelled() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let stranded = stranded_task(&store).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let deezer = road_trip_deezer();
    let (engine, _delivery) =
        build_engine_with_lease(adapters(&deezer), fast_settings(), 3, store, Duration::from_millis(50));

    assert!(engine.cancel(stranded.id).await.unwrap());
    let stored = engine.task(stranded.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(!engine.cancel(stranded.id).await.unwrap());
}

#[tokio::test]
async fn test_live_run_keeps_its_lease() {
    let dir = TempDir::new().unwrap();
    let store = sqlite_store(&dir).await;
    let lease = Duration::from_millis(150);

    let gate = Arc::new(Semaphore::new(0));
    let owner_deezer = road_trip_deezer();
    let owner_tidal = Arc::new(MockAdapter::new(Platform::Tidal).with_catalog(tidal_catalog()).with_search_gate(gate.clone()));
    let (owner, owner_delivery) = build_engine_with_lease(
        vec![owner_deezer.clone(), owner_tidal.clone()],
        fast_settings(),
        3,
        store.clone(),
        lease,
    );
    let task = owner.convert_playlist(&road_trip_link(), &[Platform::Tidal], None).await.unwrap();
    while owner_tidal.searches() == 0 {
        tokio::task::yield_now().await;
    }

    // well past the lease; renewals keep it owned
    tokio::time::sleep(Duration::from_millis(400)).await;

    let other_deezer = road_trip_deezer();
    let (other, other_delivery) =
        build_engine_with_lease(adapters(&other_deezer), fast_settings(), 3, store, lease);
    let seen = other.convert_playlist(&road_trip_link(), &[Platform::Tidal], None).await.unwrap();
    assert_eq!(seen.id, task.id);
    assert_eq!(seen.status, TaskStatus::Processing);
    assert_eq!(seen.retry_count, 0);
    assert_eq!(other_deezer.playlist_fetches(), 0);
    assert!(other_delivery.events().is_empty());

    gate.add_permits(16);
    owner_delivery.wait_for_terminal(task.id).await;
    assert_eq!(owner.task(task.id).await.unwrap().status, TaskStatus::Completed);
}
