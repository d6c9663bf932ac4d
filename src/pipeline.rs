//! The concurrency fabric.
//!
//! ```text
//! Producer -> [raw msgs 128] -> Dispatcher -> [raw frames 128] -> N workers
//!          -> [frames 128] -> Sink (Aggregator + writer) -> [ui msgs 16] -> ws
//! ```
//!
//! Every queue is bounded; a full queue blocks the upstream stage, which
//! ultimately applies backpressure to the transport socket. The one
//! exception is the UI queue, which uses non-blocking try-send: dropping a
//! UI update is always preferable to stalling acquisition.
//!
//! Shutdown is cooperative: the cancellation token stops the producer, the
//! closing raw-message queue drains the dispatcher, the closing frame
//! queues drain the workers and finally the sink, which flushes one last
//! snapshot before exiting. Reconfiguration (grid resize, endpoint change)
//! rides on watch channels so a newer request supersedes an unserviced
//! older one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{RawFrame, RawMessage};
use crate::config::{AppConfig, EndpointUpdate, SharedConfig};
use crate::error::{AppResult, StxmError};
use crate::ingest::{self, simulator};
use crate::metrics::Metrics;
use crate::output::{self, normalize::normalize_meta, RawLogWriter};
use crate::processing::{self, Aggregator, Frame, FrameOutcome, ThresholdSnapshot};
use crate::run::{extract_channels, RunState};
use crate::status::{ChannelStats, StatusBoard};

/// Capacity of the raw-message and frame queues.
pub const DATA_QUEUE_CAPACITY: usize = 128;
/// Capacity of the UI broadcast queue.
pub const UI_QUEUE_CAPACITY: usize = 16;

/// Messages broadcast to websocket clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessage {
    /// Deep copy of the current map state.
    Snapshot {
        data: HashMap<String, ThresholdSnapshot>,
    },
    /// Grid or threshold-list change.
    Config {
        grid_x: usize,
        grid_y: usize,
        thresholds: Vec<String>,
    },
}

/// Capability record handed to the web server.
///
/// Four read accessors (status, config, latest snapshot, endpoint watch)
/// and two update sinks (grid, endpoint): the narrow boundary that breaks
/// the server/pipeline wiring cycle.
pub struct UiBridge {
    pub metrics: Arc<Metrics>,
    pub run: Arc<RunState>,
    pub status: Arc<StatusBoard>,
    pub shared: Arc<SharedConfig>,
    latest: Arc<Mutex<Option<UiMessage>>>,
    grid_tx: watch::Sender<(usize, usize)>,
    endpoint_tx: watch::Sender<EndpointUpdate>,
}

impl UiBridge {
    pub fn status_json(&self) -> serde_json::Value {
        self.status.snapshot(&self.metrics, &self.run)
    }

    pub fn config_json(&self) -> serde_json::Value {
        self.shared.to_json()
    }

    /// Latest cached snapshot, if any broadcast has fired yet.
    pub fn latest_snapshot(&self) -> Option<UiMessage> {
        self.latest.lock().clone()
    }

    /// Ask the sink stage to rebuild the aggregator with new dimensions.
    pub fn request_grid(&self, grid_x: usize, grid_y: usize) -> AppResult<()> {
        if grid_x < 1 || grid_y < 1 {
            return Err(StxmError::ConfigInvalid(format!(
                "invalid grid {grid_x}x{grid_y}"
            )));
        }
        self.grid_tx.send_replace((grid_x, grid_y));
        Ok(())
    }

    /// Rewire the transport and SIMPLON clients to a new detector.
    pub fn request_endpoint(
        &self,
        detector_ip: &str,
        zmq_port: u16,
        api_port: u16,
    ) -> AppResult<()> {
        let update = self.shared.set_endpoint(detector_ip, zmq_port, api_port)?;
        self.endpoint_tx.send_replace(update);
        Ok(())
    }

    /// Subscribe to endpoint changes (used by the SIMPLON poller).
    pub fn endpoint_watch(&self) -> watch::Receiver<EndpointUpdate> {
        self.endpoint_tx.subscribe()
    }
}

/// A running pipeline: the server-facing bridge, the UI message stream and
/// the task handles to await on shutdown.
pub struct Pipeline {
    pub bridge: Arc<UiBridge>,
    pub ui_rx: mpsc::Receiver<UiMessage>,
    pub producer: JoinHandle<AppResult<()>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Wire up and start every stage against the configured source (ZMQ
/// transport, or the simulator in debug mode).
pub fn spawn(cfg: AppConfig, token: CancellationToken) -> AppResult<Pipeline> {
    let (raw_tx, raw_rx) = mpsc::channel::<RawMessage>(DATA_QUEUE_CAPACITY);
    spawn_stages(cfg, token, raw_rx, Some(raw_tx))
}

/// Wire up the stages with a caller-owned message source instead of the
/// transport. Used by integration tests and offline tooling; the returned
/// sender is the pipeline's input.
pub fn spawn_with_source(
    cfg: AppConfig,
    token: CancellationToken,
) -> AppResult<(Pipeline, mpsc::Sender<RawMessage>)> {
    let (raw_tx, raw_rx) = mpsc::channel::<RawMessage>(DATA_QUEUE_CAPACITY);
    let pipeline = spawn_stages(cfg, token, raw_rx, None)?;
    Ok((pipeline, raw_tx))
}

fn spawn_stages(
    cfg: AppConfig,
    token: CancellationToken,
    raw_rx: mpsc::Receiver<RawMessage>,
    raw_tx: Option<mpsc::Sender<RawMessage>>,
) -> AppResult<Pipeline> {
    let metrics = Arc::new(Metrics::new());
    let run = Arc::new(RunState::new());
    let status = Arc::new(StatusBoard::new());
    let shared = Arc::new(SharedConfig::new(&cfg));
    let latest: Arc<Mutex<Option<UiMessage>>> = Arc::new(Mutex::new(None));

    let (frame_tx, frame_rx) = mpsc::channel::<RawFrame>(DATA_QUEUE_CAPACITY);
    let (reduced_tx, reduced_rx) = mpsc::channel::<Frame>(DATA_QUEUE_CAPACITY);
    let (ui_tx, ui_rx) = mpsc::channel::<UiMessage>(UI_QUEUE_CAPACITY);
    let (grid_tx, grid_rx) = watch::channel((cfg.grid_x, cfg.grid_y));
    let (endpoint_tx, endpoint_rx) = watch::channel(shared.endpoint_update());

    let mut tasks = Vec::new();

    // Producer: simulator in debug mode, otherwise the supervised ZMQ
    // transport with optional raw logging. With a caller-owned source
    // there is nothing to produce here.
    let producer = match raw_tx {
        None => tokio::spawn(async { AppResult::Ok(()) }),
        Some(raw_tx) if cfg.debug => {
            status.set_detector_source("simulator");
            let sim_token = token.clone();
            let (grid_x, grid_y) = (cfg.grid_x, cfg.grid_y);
            let rate = cfg.debug_acq_rate;
            tokio::spawn(async move {
                simulator::stream(sim_token, grid_x, grid_y, rate, raw_tx).await;
                AppResult::Ok(())
            })
        }
        Some(raw_tx) => {
            status.set_detector_source("stream");
            let recorder = if cfg.raw_log_enabled {
                let writer = Arc::new(RawLogWriter::create(&cfg.raw_log_dir, "raw_cbor")?);
                let closer = writer.clone();
                let close_token = token.clone();
                tasks.push(tokio::spawn(async move {
                    close_token.cancelled().await;
                    if let Err(err) = closer.close() {
                        warn!(error = %err, "raw log close failed");
                    }
                }));
                Some(writer)
            } else {
                None
            };
            ingest::spawn_producer(
                cfg.clone(),
                token.clone(),
                raw_tx,
                endpoint_rx,
                recorder,
                metrics.clone(),
                shared.clone(),
            )
        }
    };

    // Dispatcher.
    tasks.push(tokio::spawn(dispatch_loop(
        raw_rx,
        frame_tx,
        ui_tx.clone(),
        run.clone(),
        status.clone(),
        metrics.clone(),
        shared.clone(),
        cfg.output_dir.clone(),
    )));

    // Reducer worker pool.
    let frame_rx = Arc::new(tokio::sync::Mutex::new(frame_rx));
    for worker in 0..cfg.workers {
        tasks.push(tokio::spawn(reduce_loop(
            worker,
            frame_rx.clone(),
            reduced_tx.clone(),
            status.clone(),
            metrics.clone(),
        )));
    }
    drop(reduced_tx);

    // Aggregation sink.
    tasks.push(tokio::spawn(sink_loop(SinkContext {
        reduced_rx,
        grid_rx,
        ui_tx,
        latest: latest.clone(),
        run: run.clone(),
        status: status.clone(),
        metrics: metrics.clone(),
        shared: shared.clone(),
        output_dir: cfg.output_dir.clone(),
        ui_rate: cfg.ui_rate,
    })));

    // Housekeeping: stream-idle decay and the periodic ingest stats line.
    tasks.push(tokio::spawn(idle_decay_loop(
        token.clone(),
        status.clone(),
    )));
    tasks.push(tokio::spawn(stats_log_loop(
        token.clone(),
        metrics.clone(),
    )));

    let bridge = Arc::new(UiBridge {
        metrics,
        run,
        status,
        shared,
        latest,
        grid_tx,
        endpoint_tx,
    });

    Ok(Pipeline {
        bridge,
        ui_rx,
        producer,
        tasks,
    })
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    mut raw_rx: mpsc::Receiver<RawMessage>,
    frame_tx: mpsc::Sender<RawFrame>,
    ui_tx: mpsc::Sender<UiMessage>,
    run: Arc<RunState>,
    status: Arc<StatusBoard>,
    metrics: Arc<Metrics>,
    shared: Arc<SharedConfig>,
    output_dir: PathBuf,
) {
    while let Some(msg) = raw_rx.recv().await {
        Metrics::incr(&metrics.raw_messages);
        status.mark_ingest();
        match msg {
            RawMessage::Control { kind, meta } => {
                Metrics::incr(&metrics.meta_messages);
                let normalized = normalize_meta(&meta);
                match kind.as_str() {
                    "start" => {
                        info!(meta = %normalized, "start metadata");
                        run.on_start(&normalized);
                        let channels = extract_channels(&normalized);
                        if !channels.is_empty() {
                            shared.set_thresholds(channels.clone());
                            let (grid_x, grid_y) = shared.grid();
                            let _ = ui_tx.try_send(UiMessage::Config {
                                grid_x,
                                grid_y,
                                thresholds: channels,
                            });
                        }
                    }
                    "end" => {
                        info!(meta = %normalized, "end metadata");
                        run.on_end(&normalized);
                    }
                    _ => {}
                }

                let run_timestamp = run.open_run();
                if let Err(err) =
                    output::write_metadata(&output_dir, &run_timestamp, &kind, &normalized)
                {
                    Metrics::incr(&metrics.metadata_write_err);
                    warn!(error = %err, kind = %kind, "metadata write failed");
                }
                if kind == "end" {
                    run.close_run();
                }
            }
            RawMessage::Image(frame) => {
                Metrics::incr(&metrics.image_messages);
                run.on_image();
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn reduce_loop(
    worker: usize,
    frame_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RawFrame>>>,
    reduced_tx: mpsc::Sender<Frame>,
    status: Arc<StatusBoard>,
    metrics: Arc<Metrics>,
) {
    loop {
        let raw = { frame_rx.lock().await.recv().await };
        let Some(raw) = raw else {
            debug!(worker, "reducer draining");
            break;
        };
        let started = Instant::now();
        let reduced = processing::reduce_frame(&raw);
        Metrics::observe(&metrics.process_count, &metrics.process_nanos, started.elapsed());
        let Some(frame) = reduced else {
            continue;
        };
        Metrics::incr(&metrics.frames_processed);
        status.mark_frame();
        if reduced_tx.send(frame).await.is_err() {
            break;
        }
    }
}

struct SinkContext {
    reduced_rx: mpsc::Receiver<Frame>,
    grid_rx: watch::Receiver<(usize, usize)>,
    ui_tx: mpsc::Sender<UiMessage>,
    latest: Arc<Mutex<Option<UiMessage>>>,
    run: Arc<RunState>,
    status: Arc<StatusBoard>,
    metrics: Arc<Metrics>,
    shared: Arc<SharedConfig>,
    output_dir: PathBuf,
    ui_rate: std::time::Duration,
}

/// Final single-threaded stage: owns the aggregator and drives
/// completion, periodic snapshots, and grid reconfiguration.
async fn sink_loop(mut ctx: SinkContext) {
    let (grid_x, grid_y) = ctx.shared.grid();
    let mut agg = Aggregator::new(grid_x, grid_y);
    let mut ticker = tokio::time::interval(ctx.ui_rate);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut grid_open = true;

    loop {
        tokio::select! {
            changed = ctx.grid_rx.changed(), if grid_open => {
                if changed.is_err() {
                    grid_open = false;
                    continue;
                }
                let (grid_x, grid_y) = *ctx.grid_rx.borrow_and_update();
                if grid_x < 1 || grid_y < 1 {
                    continue;
                }
                ctx.shared.set_grid(grid_x, grid_y);
                agg = Aggregator::new(grid_x, grid_y);
                *ctx.latest.lock() = None;
                ctx.run.on_resize();
                let _ = ctx.ui_tx.try_send(UiMessage::Config {
                    grid_x,
                    grid_y,
                    thresholds: ctx.shared.thresholds(),
                });
                info!(grid_x, grid_y, "grid reconfigured, aggregator replaced");
            }
            frame = ctx.reduced_rx.recv() => {
                let Some(frame) = frame else {
                    flush_snapshot(&agg, &ctx);
                    break;
                };
                match agg.add_frame(&frame) {
                    FrameOutcome::OutOfRange => {
                        let err = StxmError::AggregatorOutOfRange {
                            image_id: frame.image_id,
                            total_pixels: agg.total_pixels(),
                        };
                        debug!(error = %err, "dropping frame");
                    }
                    FrameOutcome::Accepted => {}
                    FrameOutcome::Complete => {
                        write_completed(&agg, &ctx);
                        agg.reset();
                    }
                }
            }
            _ = ticker.tick() => {
                flush_snapshot(&agg, &ctx);
            }
        }
    }
}

/// Persist the full map under the current run timestamp.
fn write_completed(agg: &Aggregator, ctx: &SinkContext) {
    let run_timestamp = ctx.run.open_run();
    ctx.status.mark_writing();
    let started = Instant::now();
    let (grid_x, _) = agg.grid();
    let result = output::write_series(&ctx.output_dir, &run_timestamp, grid_x, agg.snapshot());
    Metrics::observe(&ctx.metrics.write_count, &ctx.metrics.write_nanos, started.elapsed());
    match result {
        Ok(()) => {
            Metrics::incr(&ctx.metrics.output_write_ok);
            ctx.status.mark_write_ok();
            info!(run = %run_timestamp, "wrote series outputs");
        }
        Err(err) => {
            Metrics::incr(&ctx.metrics.output_write_err);
            ctx.status.mark_write_error();
            warn!(error = %err, run = %run_timestamp, "output write failed");
        }
    }
}

/// Deep-copy the aggregator, refresh per-channel stats, cache the
/// snapshot as latest, and try a non-blocking broadcast.
fn flush_snapshot(agg: &Aggregator, ctx: &SinkContext) {
    let data = agg.snapshot_copy();
    if data.is_empty() {
        return;
    }
    ctx.status.set_image_stats(channel_stats(&data));
    let message = UiMessage::Snapshot { data };
    *ctx.latest.lock() = Some(message.clone());
    if ctx.ui_tx.try_send(message).is_ok() {
        Metrics::incr(&ctx.metrics.frames_broadcast);
    }
}

/// Min/max/mean over the masked cells of each channel.
fn channel_stats(data: &HashMap<String, ThresholdSnapshot>) -> HashMap<String, ChannelStats> {
    let mut out = HashMap::with_capacity(data.len());
    for (threshold, snapshot) in data {
        let mut min = 0.0f64;
        let mut max = 0.0f64;
        let mut sum = 0.0f64;
        let mut count = 0u64;
        for (value, &masked) in snapshot.values.iter().zip(&snapshot.mask) {
            if !masked {
                continue;
            }
            let v = *value as f64;
            if count == 0 {
                min = v;
                max = v;
            } else {
                min = min.min(v);
                max = max.max(v);
            }
            sum += v;
            count += 1;
        }
        let mean = if count > 0 { sum / count as f64 } else { 0.0 };
        out.insert(threshold.clone(), ChannelStats { min, max, mean });
    }
    out
}

/// While no frame has arrived yet, tick the stream state back to idle.
async fn idle_decay_loop(token: CancellationToken, status: Arc<StatusBoard>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => status.idle_decay(),
        }
    }
}

/// Periodic one-line ingest summary.
async fn stats_log_loop(token: CancellationToken, metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    ticker.tick().await; // skip the immediate first tick
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                let snap = metrics.snapshot();
                info!(
                    raw = %snap["raw_messages_total"],
                    image = %snap["image_messages_total"],
                    meta = %snap["meta_messages_total"],
                    decode_failures = %snap["ingest_decode_failures_total"],
                    "ingest stats"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_messages_serialize_with_type_tags() {
        let mut data = HashMap::new();
        data.insert(
            "threshold_0".to_string(),
            ThresholdSnapshot {
                values: vec![1, 0],
                mask: vec![true, false],
            },
        );
        let snapshot = serde_json::to_value(UiMessage::Snapshot { data }).unwrap();
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["data"]["threshold_0"]["values"], serde_json::json!([1, 0]));

        let config = serde_json::to_value(UiMessage::Config {
            grid_x: 3,
            grid_y: 4,
            thresholds: vec!["threshold_0".into()],
        })
        .unwrap();
        assert_eq!(config["type"], "config");
        assert_eq!(config["grid_x"], 3);
    }

    #[test]
    fn channel_stats_cover_only_masked_cells() {
        let mut data = HashMap::new();
        data.insert(
            "threshold_0".to_string(),
            ThresholdSnapshot {
                values: vec![10, 99, 2, 6],
                mask: vec![true, false, true, true],
            },
        );
        let stats = channel_stats(&data);
        let s = stats["threshold_0"];
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 10.0);
        assert!((s.mean - 6.0).abs() < 1e-9);
    }

    #[test]
    fn empty_mask_yields_zero_stats() {
        let mut data = HashMap::new();
        data.insert(
            "threshold_0".to_string(),
            ThresholdSnapshot {
                values: vec![5, 5],
                mask: vec![false, false],
            },
        );
        let stats = channel_stats(&data);
        assert_eq!(stats["threshold_0"], ChannelStats { min: 0.0, max: 0.0, mean: 0.0 });
    }
}
