//! Transport producer.
//!
//! A ZeroMQ PULL socket delivers one CBOR message per recv. The socket
//! lives on a blocking thread with a 500 ms receive timeout so it can
//! observe cancellation; decoded messages flow into the bounded raw-message
//! queue, which applies backpressure all the way to the socket.
//!
//! A supervisor task owns the transport: endpoint updates tear the current
//! connection down and reconnect, and a bring-up failure either falls back
//! to the simulator or takes the whole process down, depending on
//! `--ingest-fallback`.

pub mod simulator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::{self, RawMessage};
use crate::config::{AppConfig, EndpointUpdate, SharedConfig};
use crate::error::{AppResult, StxmError};
use crate::metrics::Metrics;
use crate::output::RawLogWriter;

/// Occurrence-throttled logging gate: fires on the first occurrence and
/// every Nth afterwards.
#[derive(Debug)]
pub struct LogEvery {
    every: u64,
    counter: AtomicU64,
}

impl LogEvery {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            counter: AtomicU64::new(0),
        }
    }

    pub fn tick(&self) -> bool {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.every == 0
    }
}

/// Spawn the transport supervisor.
///
/// Resolves to `Ok` on cancellation or downstream close, `Err` when the
/// transport cannot be brought up and fallback is disabled (the token is
/// cancelled first so the rest of the pipeline drains).
pub fn spawn_producer(
    cfg: AppConfig,
    token: CancellationToken,
    raw_tx: mpsc::Sender<RawMessage>,
    mut endpoint_rx: watch::Receiver<EndpointUpdate>,
    recorder: Option<Arc<RawLogWriter>>,
    metrics: Arc<Metrics>,
    shared: Arc<SharedConfig>,
) -> JoinHandle<AppResult<()>> {
    tokio::spawn(async move {
        let throttle = Arc::new(LogEvery::new(cfg.ingest_log_every));
        let mut endpoint = endpoint_rx.borrow().endpoint.clone();

        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            let child = token.child_token();
            let mut handle = {
                let endpoint = endpoint.clone();
                let child = child.clone();
                let tx = raw_tx.clone();
                let recorder = recorder.clone();
                let metrics = metrics.clone();
                let throttle = throttle.clone();
                tokio::task::spawn_blocking(move || {
                    transport_loop(&endpoint, &child, &tx, recorder.as_deref(), &metrics, &throttle)
                })
            };

            tokio::select! {
                res = &mut handle => {
                    match res {
                        Ok(Ok(())) => {
                            // Clean exit: cancellation or a closed queue.
                            if token.is_cancelled() || raw_tx.is_closed() {
                                return Ok(());
                            }
                        }
                        Ok(Err(err)) => {
                            if !cfg.ingest_fallback {
                                error!(error = %err, endpoint = %endpoint, "transport bring-up failed");
                                token.cancel();
                                return Err(err);
                            }
                            warn!(error = %err, endpoint = %endpoint,
                                "transport bring-up failed, falling back to simulator");
                            match run_fallback(&cfg, &token, &raw_tx, &mut endpoint_rx, &shared).await {
                                FallbackOutcome::Stopped => return Ok(()),
                                FallbackOutcome::Endpoint(next) => endpoint = next,
                            }
                        }
                        Err(join_err) => {
                            error!(error = %join_err, "transport task panicked");
                            return Ok(());
                        }
                    }
                }
                _ = token.cancelled() => {
                    child.cancel();
                    let _ = handle.await;
                    return Ok(());
                }
                changed = endpoint_rx.changed() => {
                    child.cancel();
                    let _ = handle.await;
                    if changed.is_err() {
                        return Ok(());
                    }
                    endpoint = endpoint_rx.borrow_and_update().endpoint.clone();
                    info!(endpoint = %endpoint, "switching transport endpoint");
                }
            }
        }
    })
}

enum FallbackOutcome {
    Stopped,
    Endpoint(String),
}

/// Drive the simulator until cancellation or an endpoint update asks us to
/// try the real transport again.
async fn run_fallback(
    cfg: &AppConfig,
    token: &CancellationToken,
    raw_tx: &mpsc::Sender<RawMessage>,
    endpoint_rx: &mut watch::Receiver<EndpointUpdate>,
    shared: &Arc<SharedConfig>,
) -> FallbackOutcome {
    let sim_token = token.child_token();
    let (grid_x, grid_y) = shared.grid();
    let sim = tokio::spawn(simulator::stream(
        sim_token.clone(),
        grid_x,
        grid_y,
        cfg.debug_acq_rate,
        raw_tx.clone(),
    ));

    let outcome = tokio::select! {
        _ = token.cancelled() => FallbackOutcome::Stopped,
        changed = endpoint_rx.changed() => {
            if changed.is_ok() {
                FallbackOutcome::Endpoint(endpoint_rx.borrow_and_update().endpoint.clone())
            } else {
                FallbackOutcome::Stopped
            }
        }
    };
    sim_token.cancel();
    let _ = sim.await;
    outcome
}

/// Blocking receive loop for one connection.
///
/// Returns `Err` only for bring-up failures; receive errors are throttled
/// and retried. `Ok` means cancellation was observed or the downstream
/// queue closed.
fn transport_loop(
    endpoint: &str,
    token: &CancellationToken,
    tx: &mpsc::Sender<RawMessage>,
    recorder: Option<&RawLogWriter>,
    metrics: &Metrics,
    throttle: &LogEvery,
) -> AppResult<()> {
    let ctx = zmq::Context::new();
    let socket = ctx
        .socket(zmq::PULL)
        .map_err(|e| StxmError::Transport(format!("socket: {e}")))?;
    socket
        .set_linger(0)
        .map_err(|e| StxmError::Transport(format!("linger: {e}")))?;
    socket
        .set_rcvtimeo(500)
        .map_err(|e| StxmError::Transport(format!("rcvtimeo: {e}")))?;
    socket
        .connect(endpoint)
        .map_err(|e| StxmError::Transport(format!("connect {endpoint}: {e}")))?;
    info!(endpoint, "ingest connected");

    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        let msg = match socket.recv_bytes(0) {
            Ok(msg) => msg,
            Err(zmq::Error::EAGAIN) => continue,
            Err(err) => {
                if throttle.tick() {
                    warn!(error = %err, "ingest recv error");
                }
                continue;
            }
        };

        if let Some(rec) = recorder {
            if let Err(err) = rec.record(&msg) {
                if throttle.tick() {
                    warn!(error = %err, "ingest raw log error");
                }
            }
        }

        let started = Instant::now();
        let decoded = codec::decode_message(&msg);
        Metrics::observe(&metrics.decode_count, &metrics.decode_nanos, started.elapsed());

        match decoded {
            Ok(decoded) => {
                if decoded.channel_failures > 0 {
                    metrics
                        .decode_failures
                        .fetch_add(decoded.channel_failures, Ordering::Relaxed);
                }
                if tx.blocking_send(decoded.message).is_err() {
                    return Ok(());
                }
            }
            Err(err) => {
                Metrics::incr(&metrics.decode_failures);
                if throttle.tick() {
                    warn!(error = %err, "ingest decode skipped message");
                }
            }
        }
    }
}
