//! Run-state machine.
//!
//! A *run* is the interval between a `start` control message and the
//! following `end` (or is opened implicitly by the first image of an
//! orphan stream). The controller owns the run timestamp used to name
//! every persisted file, the expected/received frame counters shown in
//! the UI, and the captured start/end metadata.
//!
//! State is shared between the dispatcher (control messages, frame
//! counting) and the pipeline's final stage (completion, resize), so it
//! lives behind a lock. All mutators are small and non-blocking.

use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Format used for run timestamps: `YYYYMMDD_HHMMSS`, local time.
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Default)]
struct RunInner {
    /// Empty when no run is active.
    run_timestamp: String,
    frames_expected: u64,
    frames_received: u64,
    start_meta: Option<Value>,
    end_meta: Option<Value>,
}

/// Shared run-state controller. See the module docs for the transition
/// table it implements.
#[derive(Debug, Default)]
pub struct RunState {
    inner: Mutex<RunInner>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a run is open, generating the timestamp lazily, and return
    /// it. Every event that can open a run (start metadata, first image,
    /// aggregation completion) funnels through here.
    pub fn open_run(&self) -> String {
        let mut inner = self.inner.lock();
        if inner.run_timestamp.is_empty() {
            inner.run_timestamp = now_timestamp();
        }
        inner.run_timestamp.clone()
    }

    /// Record normalized `start` metadata. Overlapping starts simply
    /// overwrite; there is no nesting.
    pub fn on_start(&self, meta: &Value) {
        let mut inner = self.inner.lock();
        inner.start_meta = Some(meta.clone());
        inner.end_meta = None;
        inner.frames_received = 0;
        inner.frames_expected = meta
            .get("number_of_images")
            .and_then(Value::as_u64)
            .unwrap_or(0);
    }

    /// Record normalized `end` metadata.
    pub fn on_end(&self, meta: &Value) {
        self.inner.lock().end_meta = Some(meta.clone());
    }

    /// Count one dispatched image, opening the run if none is active.
    pub fn on_image(&self) {
        let mut inner = self.inner.lock();
        if inner.run_timestamp.is_empty() {
            inner.run_timestamp = now_timestamp();
        }
        inner.frames_received += 1;
    }

    /// `end` processed: the run is over and the timestamp is released.
    pub fn close_run(&self) {
        self.inner.lock().run_timestamp.clear();
    }

    /// Grid resize aborts whatever was in flight.
    pub fn on_resize(&self) {
        let mut inner = self.inner.lock();
        inner.run_timestamp.clear();
        inner.frames_expected = 0;
        inner.frames_received = 0;
    }

    pub fn is_active(&self) -> bool {
        !self.inner.lock().run_timestamp.is_empty()
    }

    pub fn progress(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.frames_expected, inner.frames_received)
    }

    /// Merge run fields into a status payload.
    pub fn extend_status(&self, status: &mut Map<String, Value>) {
        let inner = self.inner.lock();
        if let Some(meta) = &inner.start_meta {
            status.insert("run_start".into(), meta.clone());
        }
        if let Some(meta) = &inner.end_meta {
            status.insert("run_end".into(), meta.clone());
        }
        status.insert("frames_expected".into(), inner.frames_expected.into());
        status.insert("frames_received".into(), inner.frames_received.into());
    }
}

/// Pull a `channels: [string]` list out of normalized start metadata.
pub fn extract_channels(meta: &Value) -> Vec<String> {
    meta.get("channels")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
