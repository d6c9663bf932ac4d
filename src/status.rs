//! Shared status board.
//!
//! A small mutexed record mutated from several stages (producer, workers,
//! writer, detector poller) and copied wholesale on every `GET /status`.
//! Component states use the detector vocabulary: `unknown`, `idle`,
//! `receiving`, `ok`, `writing`, `error`, `http_<code>`, `simulator`,
//! `stream`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::metrics::Metrics;
use crate::run::RunState;

/// Per-channel statistics over masked cells of the latest snapshot.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug)]
struct StatusInner {
    detector: String,
    stream: String,
    filewriter: String,
    monitor: String,
    last_frame: String,
    last_write: String,
    last_ingest: String,
    image_stats: Option<HashMap<String, ChannelStats>>,
}

impl Default for StatusInner {
    fn default() -> Self {
        Self {
            detector: "unknown".into(),
            stream: "idle".into(),
            filewriter: "idle".into(),
            monitor: "ok".into(),
            last_frame: String::new(),
            last_write: String::new(),
            last_ingest: String::new(),
            image_stats: None,
        }
    }
}

/// Mutable status shared across the pipeline.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<StatusInner>,
}

fn now_rfc3339() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detector_source(&self, source: &str) {
        self.inner.lock().detector = source.to_string();
    }

    /// Bulk update from one detector status poll.
    pub fn set_module_states(&self, detector: String, stream: String, filewriter: String, monitor: String) {
        let mut inner = self.inner.lock();
        inner.detector = detector;
        inner.stream = stream;
        inner.filewriter = filewriter;
        inner.monitor = monitor;
    }

    pub fn mark_ingest(&self) {
        self.inner.lock().last_ingest = now_rfc3339();
    }

    pub fn mark_frame(&self) {
        let mut inner = self.inner.lock();
        inner.stream = "receiving".into();
        inner.last_frame = now_rfc3339();
    }

    pub fn mark_writing(&self) {
        self.inner.lock().filewriter = "writing".into();
    }

    pub fn mark_write_ok(&self) {
        let mut inner = self.inner.lock();
        inner.filewriter = "ok".into();
        inner.last_write = now_rfc3339();
    }

    pub fn mark_write_error(&self) {
        self.inner.lock().filewriter = "error".into();
    }

    /// Housekeeping tick: while no frame has ever been stamped the stream
    /// state decays back to idle.
    pub fn idle_decay(&self) {
        let mut inner = self.inner.lock();
        if inner.last_frame.is_empty() {
            inner.stream = "idle".into();
        }
    }

    pub fn set_image_stats(&self, stats: HashMap<String, ChannelStats>) {
        self.inner.lock().image_stats = Some(stats);
    }

    /// Full copy for the status endpoint, merging metrics and run fields.
    pub fn snapshot(&self, metrics: &Arc<Metrics>, run: &Arc<RunState>) -> Value {
        let mut out = Map::new();
        {
            let inner = self.inner.lock();
            out.insert("detector".into(), json!(inner.detector));
            out.insert("stream".into(), json!(inner.stream));
            out.insert("filewriter".into(), json!(inner.filewriter));
            out.insert("monitor".into(), json!(inner.monitor));
            out.insert("last_frame".into(), json!(inner.last_frame));
            out.insert("last_write".into(), json!(inner.last_write));
            out.insert("last_ingest".into(), json!(inner.last_ingest));
            if let Some(stats) = &inner.image_stats {
                out.insert("image_stats".into(), serde_json::to_value(stats).unwrap_or_default());
            }
        }
        out.insert("metrics".into(), metrics.snapshot());
        run.extend_status(&mut out);
        Value::Object(out)
    }
}
