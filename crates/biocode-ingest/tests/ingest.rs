//! End-to-end ingestion over in-memory and directory stores

use biocode_core::{identify_chunks, identify_planes, PlaneCoord, RetryPolicy};
use biocode_declare::{Keypair, RegistryConfig};
use biocode_ingest::{
    build_declarer, stop_channel, Annotation, DirectoryStore, FailurePolicy, HashMode,
    IngestError, IngestSession, IngestState, MemoryFile, MemoryImage, MemoryStore,
    ServiceConfig, StopSignal, CURSOR_FILE, DEFAULT_NAMESPACE, KEY_ID, KEY_MODE,
    KEY_SOURCE_FILE, KEY_SUM,
};
use biocode_test_utils::{
    scenario_a_plane, two_scene_planes, u8_plane, unreachable_url, FakeRegistry, TEST_HUB_ID,
    TEST_PUBLIC_URL, TEST_SEED,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::time::Duration;

const SCENARIO_A_CODE: &str = "ISCC:K4AEW64CYHVCEPNB2X5O3CS3PMXEJ4YPLKZI7YCHSBADP533NWSP5II";

fn config(state_dir: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::new()
        .with_state_dir(state_dir)
        .with_poll_interval(Duration::from_millis(10))
        .with_connection_retry(
            RetryPolicy::connection()
                .with_max_attempts(3)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        )
        .with_image_retry(
            RetryPolicy::submission()
                .with_max_attempts(3)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        );
    config.submission_retry = RetryPolicy::none();
    config.request_timeout_secs = 5;
    config
}

fn with_registry(config: ServiceConfig, url: &str) -> ServiceConfig {
    config.with_registry(
        RegistryConfig::new()
            .with_hub_id(TEST_HUB_ID)
            .with_hub_url(url)
            .with_public_url(TEST_PUBLIC_URL),
    )
}

fn session<S: biocode_ingest::ImageSource>(source: S, config: ServiceConfig) -> IngestSession<S> {
    let declarer = build_declarer(&config, Ok(Keypair::from_seed(TEST_SEED)));
    IngestSession::new(source, declarer, config, StopSignal::never()).unwrap()
}

fn sum_of(store: &MemoryStore, id: u64) -> Option<String> {
    store
        .annotations_of(id)
        .first()
        .and_then(|a| a.get(KEY_SUM).map(str::to_string))
}

fn scenario_a_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.insert(MemoryImage::new(1, "a.tif").with_scene(vec![scenario_a_plane()]));
    store
}

#[tokio::test]
async fn single_plane_is_declared_and_annotated() {
    let state = tempfile::tempdir().unwrap();
    let registry = FakeRegistry::start();
    let store = scenario_a_store();

    let mut session = session(store.clone(), with_registry(config(state.path()), &registry.url()));
    let stats = session.drain().await.unwrap();

    assert_eq!((stats.processed, stats.declared), (1, 1));
    assert_eq!(session.watermark(), 1);
    let ann = &store.annotations_of(1)[0];
    assert_eq!(ann.namespace, DEFAULT_NAMESPACE);
    assert_eq!(ann.get(KEY_SUM), Some(SCENARIO_A_CODE));
    assert_eq!(ann.get(KEY_ID), Some("ISCC:MAIWFAKE00000001"));
    assert_eq!(ann.get(KEY_MODE), Some("pixels"));
    assert_eq!(ann.get(KEY_SOURCE_FILE), None);
}

#[tokio::test]
async fn redeclaring_after_reset_reuses_external_id() {
    let state = tempfile::tempdir().unwrap();
    let registry = FakeRegistry::start();

    let first = scenario_a_store();
    session(first.clone(), with_registry(config(state.path()), &registry.url()))
        .drain()
        .await
        .unwrap();

    // same content, fresh store without annotations
    let second = scenario_a_store();
    let mut rerun = session(second.clone(), with_registry(config(state.path()), &registry.url()));
    assert_eq!(rerun.watermark(), 1);
    rerun.reset_cursor().unwrap();
    rerun.drain().await.unwrap();

    assert_eq!(registry.declared_count(), 1);
    assert_eq!(registry.submissions().len(), 2);
    assert_eq!(
        second.annotations_of(1)[0].get(KEY_ID),
        first.annotations_of(1)[0].get(KEY_ID)
    );
}

#[tokio::test]
async fn scenes_hash_in_traversal_order() {
    let state = tempfile::tempdir().unwrap();
    let scenes = two_scene_planes();
    let expected = identify_planes(scenes.iter().flatten()).unwrap();

    let store = MemoryStore::new();
    let mut image = MemoryImage::new(1, "multi.czi");
    for planes in scenes {
        image = image.with_scene(planes);
    }
    store.insert(image);

    session(store.clone(), config(state.path())).drain().await.unwrap();

    assert_eq!(sum_of(&store, 1), Some(expected.content_code));
    assert_eq!(store.plane_reads(), 4);
}

#[tokio::test]
async fn unreachable_registry_still_annotates() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();

    let mut session = session(store.clone(), with_registry(config(state.path()), &unreachable_url()));
    let stats = session.drain().await.unwrap();

    assert_eq!((stats.processed, stats.declared, stats.failed), (1, 0, 0));
    let ann = &store.annotations_of(1)[0];
    assert_eq!(ann.get(KEY_SUM), Some(SCENARIO_A_CODE));
    assert_eq!(ann.get(KEY_ID), None);
    assert_eq!(session.watermark(), 1);
}

#[tokio::test]
async fn restart_resumes_after_watermark() {
    let state = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    for id in 1..=3u8 {
        store.insert(MemoryImage::new(u64::from(id), format!("img{id}")).with_file(MemoryFile::new(
            u64::from(id),
            "f",
            vec![id; 8],
        )));
    }
    let cfg = config(state.path()).with_hash_mode(HashMode::File).with_batch_size(2);

    let stats = session(store.clone(), cfg.clone()).drain().await.unwrap();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.pages, 3);
    let reads_before = store.chunk_reads();

    store.insert(MemoryImage::new(4, "img4").with_file(MemoryFile::new(4, "f", vec![4; 8])));
    let mut resumed = session(store.clone(), cfg);
    assert_eq!(resumed.watermark(), 3);
    let stats = resumed.drain().await.unwrap();

    assert_eq!((stats.processed, stats.skipped), (1, 0));
    assert_eq!(store.chunk_reads(), reads_before + 1);
    assert_eq!(resumed.watermark(), 4);
}

#[tokio::test]
async fn annotated_images_are_never_rehashed() {
    let state = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    store.insert(
        MemoryImage::new(5, "done.tif")
            .with_scene(vec![scenario_a_plane()])
            .with_annotation(Annotation::new(DEFAULT_NAMESPACE).with(KEY_SUM, "ISCC:EARLIER")),
    );

    let mut session = session(store.clone(), config(state.path()));
    let stats = session.drain().await.unwrap();

    assert_eq!((stats.processed, stats.skipped), (0, 1));
    assert_eq!(store.plane_reads(), 0);
    assert_eq!(store.annotations_of(5).len(), 1);
    assert_eq!(session.watermark(), 5);
}

#[tokio::test]
async fn lost_connection_retries_the_interrupted_image() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.insert(MemoryImage::new(2, "b.tif").with_scene(vec![scenario_a_plane()]));

    let mut session = session(store.clone(), config(state.path()));
    // listing, annotations and files succeed; the scene query drops the link
    store.drop_connection_after(3);
    let stats = session.drain().await.unwrap();

    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.processed, 2);
    assert_eq!(store.connects(), 2);
    assert_eq!(store.annotations_of(1).len(), 1);
    assert_eq!(sum_of(&store, 1).as_deref(), Some(SCENARIO_A_CODE));
    assert_eq!(session.watermark(), 2);
}

#[tokio::test]
async fn image_that_keeps_dropping_the_connection_is_given_up() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.insert(MemoryImage::new(2, "b.tif").with_scene(vec![scenario_a_plane()]));
    store.drop_connection_on(1);

    let mut session = session(store.clone(), config(state.path()));
    let stats = tokio::time::timeout(Duration::from_secs(10), session.drain())
        .await
        .expect("drain loops on a poisoned image")
        .unwrap();

    assert_eq!((stats.processed, stats.failed), (1, 1));
    assert_eq!(stats.reconnects, 3);
    assert_eq!(store.connects(), 4);
    assert!(store.annotations_of(1).is_empty());
    assert_eq!(sum_of(&store, 2).as_deref(), Some(SCENARIO_A_CODE));
    assert_eq!(session.watermark(), 2);
    let letters = session.dead_letters().read_all().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].image_id, 1);
    assert!(letters[0].reason.contains("connection lost 3 times"));
}

#[tokio::test]
async fn listing_that_keeps_dropping_the_connection_is_fatal() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.lose_listings(true);

    let mut session = session(store.clone(), config(state.path()));
    let err = tokio::time::timeout(Duration::from_secs(10), session.drain())
        .await
        .expect("drain loops on a dropping listing")
        .unwrap_err();

    assert!(matches!(err, IngestError::ConnectionExhausted { attempts: 3, .. }));
    assert_eq!(store.connects(), 3);
    assert_eq!(session.watermark(), 0);
    assert_eq!(session.state(), IngestState::Stopped);
}

#[tokio::test]
async fn broken_image_is_dead_lettered_and_passed() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.insert(MemoryImage::new(2, "b.tif").with_scene(vec![scenario_a_plane()]));
    store.fail_image(1, "unreadable pixels");

    let mut session = session(store.clone(), config(state.path()));
    let stats = session.drain().await.unwrap();

    assert_eq!((stats.processed, stats.failed), (1, 1));
    assert!(store.annotations_of(1).is_empty());
    assert_eq!(session.watermark(), 2);
    let letters = session.dead_letters().read_all().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].image_id, 1);
    assert!(letters[0].reason.contains("unreadable pixels"));
}

#[tokio::test]
async fn skip_policy_leaves_no_dead_letters() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.fail_image(1, "unreadable pixels");

    let cfg = config(state.path()).with_failure_policy(FailurePolicy::Skip);
    let mut session = session(store, cfg);
    let stats = session.drain().await.unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(session.dead_letters().count().unwrap(), 0);
    assert_eq!(session.watermark(), 1);
}

#[tokio::test]
async fn series_of_one_file_keep_their_own_pixels() {
    let state = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let shared = || MemoryFile::new(100, "stack.lif", vec![0; 16]).with_hash("sha1-abc");
    store.insert(
        MemoryImage::new(1, "series1")
            .with_scene(vec![scenario_a_plane()])
            .with_file(shared()),
    );
    store.insert(
        MemoryImage::new(2, "series2")
            .with_scene(vec![u8_plane(PlaneCoord::new(0, 0, 0, 0), 2, 2, vec![9; 4])])
            .with_file(shared()),
    );

    let stats = session(store.clone(), config(state.path())).drain().await.unwrap();

    assert_eq!((stats.processed, stats.cache_hits), (2, 0));
    assert_eq!(store.plane_reads(), 2);
    assert_eq!(sum_of(&store, 1).as_deref(), Some(SCENARIO_A_CODE));
    assert_ne!(sum_of(&store, 1), sum_of(&store, 2));
}

#[tokio::test]
async fn shared_file_is_hashed_once_in_file_mode() {
    let state = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let bytes: Vec<u8> = (0..64u8).collect();
    for id in [1, 2] {
        store.insert(
            MemoryImage::new(id, format!("series{id}"))
                .with_file(MemoryFile::new(100, "stack.lif", bytes.clone()).with_hash("sha1-abc")),
        );
    }
    let cfg = config(state.path()).with_hash_mode(HashMode::File).with_chunk_size(16);

    let stats = session(store.clone(), cfg).drain().await.unwrap();

    assert_eq!((stats.processed, stats.cache_hits), (2, 1));
    assert_eq!(store.chunk_reads(), 4);
    assert_eq!(sum_of(&store, 1), sum_of(&store, 2));
    assert_eq!(sum_of(&store, 1), Some(identify_chunks([&bytes]).content_code));
}

#[tokio::test]
async fn directory_files_hash_as_raw_bytes() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    std::fs::write(root.path().join("scan.ome.tif"), &bytes).unwrap();

    let store = DirectoryStore::open(root.path(), state.path()).unwrap();
    let cfg = config(state.path()).with_hash_mode(HashMode::File).with_chunk_size(7);
    session(store.clone(), cfg).drain().await.unwrap();

    let ann = &store.annotations_of(1)[0];
    assert_eq!(ann.get(KEY_SUM), Some(identify_chunks([&bytes]).content_code.as_str()));
    assert_eq!(ann.get(KEY_SOURCE_FILE), Some("scan.ome.tif"));
    assert_eq!(ann.get(KEY_MODE), Some("file"));
}

#[tokio::test]
async fn directory_in_pixel_mode_dead_letters_instead_of_skipping() {
    let root = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("scan.ome.tif"), b"not pixels").unwrap();

    let store = DirectoryStore::open(root.path(), state.path()).unwrap();
    let mut session = session(store.clone(), config(state.path()).with_hash_mode(HashMode::Pixels));
    let stats = session.drain().await.unwrap();

    assert_eq!((stats.processed, stats.skipped, stats.failed), (0, 0, 1));
    assert!(store.annotations_of(1).is_empty());
    let letters = session.dead_letters().read_all().unwrap();
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("unsupported"));
}

#[tokio::test]
async fn corrupt_cursor_restarts_from_origin() {
    let state = tempfile::tempdir().unwrap();
    std::fs::write(state.path().join(CURSOR_FILE), b"{not json").unwrap();
    let store = scenario_a_store();

    let mut session = session(store.clone(), config(state.path()));
    assert_eq!(session.watermark(), 0);
    session.drain().await.unwrap();
    assert_eq!(session.watermark(), 1);
}

#[tokio::test]
async fn unreachable_source_exhausts_retries() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.fail_connects(10);

    let err = session(store.clone(), config(state.path())).run().await.unwrap_err();

    assert!(matches!(err, IngestError::ConnectionExhausted { attempts: 3, .. }));
    assert_eq!(store.connects(), 3);
}

#[tokio::test]
async fn refused_connects_are_retried() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    store.fail_connects(2);

    let mut session = session(store.clone(), config(state.path()));
    session.drain().await.unwrap();

    assert_eq!(store.connects(), 3);
    assert_eq!(session.state(), IngestState::Polling);
    assert!(sum_of(&store, 1).is_some());
}

#[tokio::test]
async fn stop_ends_a_polling_run() {
    let state = tempfile::tempdir().unwrap();
    let store = scenario_a_store();
    let cfg = config(state.path()).with_poll_interval(Duration::from_secs(60));
    let declarer = build_declarer(&cfg, Ok(Keypair::from_seed(TEST_SEED)));
    let (handle, signal) = stop_channel();
    let session = IngestSession::new(store.clone(), declarer, cfg, signal).unwrap();

    let run = tokio::spawn(session.run());
    while sum_of(&store, 1).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.stop();

    let stats = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.processed, 1);
}
