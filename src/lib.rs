//! # STXM map acquisition library
//!
//! This crate is the core of a real-time scanning transmission X-ray
//! microscopy (STXM) acquisition service. It ingests CBOR-encoded detector
//! messages from a ZeroMQ PULL socket, reduces every per-threshold image to a
//! single non-saturated pixel count, assembles those counts into a scan map
//! over a rectangular grid, persists completed maps to disk, and feeds live
//! snapshots to a browser UI over a websocket.
//!
//! ## Crate structure
//!
//! - **`config`**: command-line flags and the validated [`config::AppConfig`].
//! - **`codec`**: the detector wire format: CBOR envelope, tag-40
//!   multi-dimensional arrays, and the Dectris tag-56500 compression layer.
//! - **`processing`**: frame reduction and the grid aggregator.
//! - **`run`**: the run-state machine binding start/image/end metadata to a
//!   run timestamp and persisted outputs.
//! - **`output`**: plain-text series files, JSON metadata envelopes, and the
//!   append-only raw ingest log.
//! - **`ingest`**: the ZeroMQ producer (with reconnect and simulator
//!   fallback) and the synthetic data generator.
//! - **`pipeline`**: the concurrency fabric wiring producer, worker pool,
//!   aggregation sink and UI broadcaster together over bounded channels.
//! - **`server`**: the axum HTTP/websocket surface for the operator UI.
//! - **`simplon`**: HTTP client for the detector control API (status
//!   polling, command dispatch, config proxying).
//! - **`status`** / **`metrics`**: the shared status board and process-wide
//!   counters surfaced through `GET /status`.

pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod processing;
pub mod run;
pub mod server;
pub mod simplon;
pub mod status;
