//! End-to-end pipeline scenarios.
//!
//! These tests drive the full stage graph (dispatcher, worker pool,
//! aggregation sink) through the caller-owned source used by tooling,
//! and observe the pipeline only through its real outputs: files on
//! disk, the UI message stream, and the status endpoint payload.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stxm_map::codec::{CborValue, PixelArray, PixelGrid, RawFrame, RawMessage};
use stxm_map::config::{AppConfig, DEFAULT_THRESHOLDS};
use stxm_map::pipeline::{self, UiMessage};

fn test_config(output_dir: &Path, grid_x: usize, grid_y: usize, ui_rate: Duration) -> AppConfig {
    AppConfig {
        port: 0,
        detector_ip: String::new(),
        api_port: 80,
        api_version: "1.8.0".to_string(),
        zmq_port: 31001,
        endpoint: "tcp://localhost:31001".to_string(),
        simplon_base_url: String::new(),
        simplon_interval: Duration::from_secs(1),
        workers: 4,
        grid_x,
        grid_y,
        debug: false,
        debug_acq_rate: 100.0,
        ui_rate,
        output_dir: output_dir.to_path_buf(),
        raw_log_enabled: false,
        raw_log_dir: output_dir.join("rawlog"),
        ingest_log_every: 100,
        ingest_fallback: false,
        thresholds: DEFAULT_THRESHOLDS.iter().map(|s| s.to_string()).collect(),
    }
}

/// A 2-D u16 frame whose reduction yields `count` (the remaining pixels
/// are saturated).
fn image(image_id: u64, count: usize, rows: usize, cols: usize) -> RawMessage {
    let total = rows * cols;
    assert!(count <= total);
    let mut pixels = vec![1u16; count];
    pixels.resize(total, u16::MAX);
    let mut data = HashMap::new();
    data.insert(
        "threshold_0".to_string(),
        PixelGrid {
            rows,
            cols,
            pixels: PixelArray::U16(pixels),
        },
    );
    RawMessage::Image(RawFrame {
        image_id,
        start_time: image_id as f64 * 0.5,
        data,
    })
}

fn control(kind: &str, meta: Vec<(&str, CborValue)>) -> RawMessage {
    let mut map = BTreeMap::new();
    for (key, value) in meta {
        map.insert(key.to_string(), value);
    }
    RawMessage::Control {
        kind: kind.to_string(),
        meta: map,
    }
}

fn find_files(dir: &Path, needle: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(needle))
        })
        .collect();
    found.sort();
    found
}

/// Poll until the condition holds or the deadline passes.
async fn wait_until<F: FnMut() -> bool>(mut condition: F, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_run_writes_series_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 2, 2, Duration::from_secs(30));
    let token = CancellationToken::new();
    let (mut pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();

    tx.send(control(
        "start",
        vec![(
            "channels",
            CborValue::Array(vec![CborValue::Text("threshold_0".into())]),
        )],
    ))
    .await
    .unwrap();

    // The declared channel list reaches the UI as a config event.
    let config_event = pipeline.ui_rx.recv().await.unwrap();
    match config_event {
        UiMessage::Config {
            grid_x,
            grid_y,
            thresholds,
        } => {
            assert_eq!((grid_x, grid_y), (2, 2));
            assert_eq!(thresholds, vec!["threshold_0"]);
        }
        other => panic!("expected config event, got {other:?}"),
    }

    for (image_id, count) in [(0u64, 1usize), (1, 2), (2, 3), (3, 4)] {
        tx.send(image(image_id, count, 2, 2)).await.unwrap();
    }

    let out = dir.path().to_path_buf();
    wait_until(
        || !find_files(&out, "_output_threshold_0_data.txt").is_empty(),
        "series file",
    )
    .await;

    tx.send(control("end", vec![("reason", CborValue::Text("done".into()))]))
        .await
        .unwrap();
    wait_until(
        || !find_files(&out, "_end_data.txt").is_empty(),
        "end metadata file",
    )
    .await;

    let series = find_files(&out, "_output_threshold_0_data.txt");
    assert_eq!(series.len(), 1, "expected exactly one series file");
    let text = std::fs::read_to_string(&series[0]).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "image_index, x, y, timestamp, value");
    assert_eq!(lines.len(), 5, "four data rows for a full 2x2 map");
    assert_eq!(lines[1], "0, 0, 0, 0.000000, 1");
    assert_eq!(lines[2], "1, 1, 0, 0.500000, 2");
    assert_eq!(lines[3], "2, 0, 1, 1.000000, 3");
    assert_eq!(lines[4], "3, 1, 1, 1.500000, 4");

    assert_eq!(find_files(&out, "_start_data.txt").len(), 1);

    let status = pipeline.bridge.status_json();
    assert_eq!(status["frames_received"], 4);
    assert_eq!(status["frames_expected"], 0);

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
    pipeline.producer.await.unwrap().unwrap();
}

#[tokio::test]
async fn start_metadata_sets_expected_frames() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 4, 4, Duration::from_secs(30));
    let token = CancellationToken::new();
    let (pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();

    tx.send(control(
        "start",
        vec![("number_of_images", CborValue::Unsigned(16))],
    ))
    .await
    .unwrap();
    tx.send(image(0, 1, 2, 2)).await.unwrap();

    let bridge = pipeline.bridge.clone();
    wait_until(
        || bridge.status_json()["frames_received"] == 1,
        "frame to be dispatched",
    )
    .await;
    assert_eq!(bridge.status_json()["frames_expected"], 16);

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn mid_run_resize_replaces_aggregator_and_resets_counters() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 2, 2, Duration::from_millis(50));
    let token = CancellationToken::new();
    let (mut pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();
    let bridge = pipeline.bridge.clone();

    tx.send(image(0, 1, 2, 2)).await.unwrap();
    tx.send(image(1, 2, 2, 2)).await.unwrap();
    // Wait until both frames are visible in a snapshot so nothing is in
    // flight when the resize lands.
    wait_until(
        || {
            matches!(
                bridge.latest_snapshot(),
                Some(UiMessage::Snapshot { data })
                    if data["threshold_0"].mask.iter().filter(|m| **m).count() == 2
            )
        },
        "both frames aggregated",
    )
    .await;

    bridge.request_grid(3, 3).unwrap();

    // Skip queued snapshot broadcasts; the resize must surface a config
    // event carrying the new geometry.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), pipeline.ui_rx.recv())
            .await
            .expect("config broadcast after resize")
            .unwrap();
        if let UiMessage::Config { grid_x, grid_y, .. } = event {
            assert_eq!((grid_x, grid_y), (3, 3));
            break;
        }
    }

    assert_eq!(bridge.status_json()["frames_received"], 0);
    assert_eq!(bridge.config_json()["grid_x"], 3);
    assert!(bridge.latest_snapshot().is_none());
    assert!(
        find_files(dir.path(), "_output_").is_empty(),
        "aborted 2x2 run must not write a series file"
    );

    // The replacement aggregator completes on the new geometry.
    for image_id in 0..9u64 {
        tx.send(image(image_id, image_id as usize + 1, 3, 3))
            .await
            .unwrap();
    }
    let out = dir.path().to_path_buf();
    wait_until(
        || !find_files(&out, "_output_threshold_0_data.txt").is_empty(),
        "series file on resized grid",
    )
    .await;
    let text =
        std::fs::read_to_string(&find_files(&out, "_output_threshold_0_data.txt")[0]).unwrap();
    assert_eq!(text.lines().count(), 10, "header plus nine rows");

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn out_of_range_images_do_not_complete_the_map() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 2, 2, Duration::from_millis(50));
    let token = CancellationToken::new();
    let (pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();
    let bridge = pipeline.bridge.clone();

    tx.send(image(0, 1, 2, 2)).await.unwrap();
    tx.send(image(1, 2, 2, 2)).await.unwrap();
    tx.send(image(2, 3, 2, 2)).await.unwrap();
    tx.send(image(99, 4, 2, 2)).await.unwrap();

    // Wait until the in-range cells show up in a snapshot, then make sure
    // no completion write happened.
    wait_until(|| bridge.latest_snapshot().is_some(), "snapshot broadcast").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        find_files(dir.path(), "_output_").is_empty(),
        "out-of-range frame must not count toward completion"
    );

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn snapshot_is_cached_only_after_frames_arrive() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 2, 2, Duration::from_millis(50));
    let token = CancellationToken::new();
    let (pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();
    let bridge = pipeline.bridge.clone();

    // No frames yet: the periodic flush has nothing to cache.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bridge.latest_snapshot().is_none());

    tx.send(image(1, 3, 2, 2)).await.unwrap();
    wait_until(|| bridge.latest_snapshot().is_some(), "snapshot broadcast").await;

    match bridge.latest_snapshot().unwrap() {
        UiMessage::Snapshot { data } => {
            let channel = &data["threshold_0"];
            assert_eq!(channel.values, vec![0, 3, 0, 0]);
            assert_eq!(channel.mask, vec![false, true, false, false]);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    // Masked-cell statistics ride along on the status payload.
    let status = bridge.status_json();
    assert_eq!(status["image_stats"]["threshold_0"]["min"], 3.0);
    assert_eq!(status["image_stats"]["threshold_0"]["max"], 3.0);
    assert_eq!(status["image_stats"]["threshold_0"]["mean"], 3.0);

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn endpoint_sink_notifies_watchers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), 2, 2, Duration::from_secs(30));
    let token = CancellationToken::new();
    let (pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();
    let bridge = pipeline.bridge.clone();

    let mut watch = bridge.endpoint_watch();
    bridge.request_endpoint("10.9.8.7", 31001, 8080).unwrap();

    tokio::time::timeout(Duration::from_secs(1), watch.changed())
        .await
        .expect("endpoint watch fired")
        .unwrap();
    let update = watch.borrow().clone();
    assert_eq!(update.endpoint, "tcp://10.9.8.7:31001");
    assert_eq!(update.simplon_base_url, "http://10.9.8.7:8080");
    assert_eq!(bridge.config_json()["endpoint"], "tcp://10.9.8.7:31001");

    assert!(bridge.request_endpoint("", 1, 1).is_err());
    assert!(bridge.request_grid(0, 3).is_err());

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn shutdown_flushes_a_final_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    // UI rate far beyond the test duration: the only possible snapshot is
    // the drain-time flush.
    let cfg = test_config(dir.path(), 2, 2, Duration::from_secs(600));
    let token = CancellationToken::new();
    let (pipeline, tx) = pipeline::spawn_with_source(cfg, token.clone()).unwrap();
    let bridge = pipeline.bridge.clone();

    tx.send(image(0, 2, 2, 2)).await.unwrap();
    wait_until(
        || bridge.status_json()["metrics"]["frames_processed_total"] == 1,
        "frame processed",
    )
    .await;
    assert!(bridge.latest_snapshot().is_none());

    drop(tx);
    token.cancel();
    for task in pipeline.tasks {
        task.await.unwrap();
    }
    assert!(
        bridge.latest_snapshot().is_some(),
        "final stage must flush one last snapshot on exit"
    );
}
