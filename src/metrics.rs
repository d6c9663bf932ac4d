//! Process-wide pipeline counters.
//!
//! One [`Metrics`] value is created at startup and handed by `Arc` to every
//! stage. All counters are lock-free `AtomicU64`s; readers take a point-in-
//! time [`Metrics::snapshot`] for the status endpoint and the periodic stats
//! log line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

/// Counters shared by every pipeline stage.
#[derive(Debug, Default)]
pub struct Metrics {
    pub raw_messages: AtomicU64,
    pub image_messages: AtomicU64,
    pub meta_messages: AtomicU64,
    pub frames_processed: AtomicU64,
    pub frames_broadcast: AtomicU64,
    pub output_write_ok: AtomicU64,
    pub output_write_err: AtomicU64,
    pub metadata_write_err: AtomicU64,
    pub decode_failures: AtomicU64,
    pub decode_count: AtomicU64,
    pub decode_nanos: AtomicU64,
    pub process_count: AtomicU64,
    pub process_nanos: AtomicU64,
    pub write_count: AtomicU64,
    pub write_nanos: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one timed operation against a `(count, nanos)` counter pair.
    #[inline]
    pub fn observe(count: &AtomicU64, nanos: &AtomicU64, elapsed: Duration) {
        count.fetch_add(1, Ordering::Relaxed);
        nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter, shaped for the status endpoint.
    pub fn snapshot(&self) -> Value {
        json!({
            "raw_messages_total": self.raw_messages.load(Ordering::Relaxed),
            "image_messages_total": self.image_messages.load(Ordering::Relaxed),
            "meta_messages_total": self.meta_messages.load(Ordering::Relaxed),
            "frames_processed_total": self.frames_processed.load(Ordering::Relaxed),
            "frames_broadcast_total": self.frames_broadcast.load(Ordering::Relaxed),
            "output_write_ok_total": self.output_write_ok.load(Ordering::Relaxed),
            "output_write_err_total": self.output_write_err.load(Ordering::Relaxed),
            "metadata_write_err_total": self.metadata_write_err.load(Ordering::Relaxed),
            "ingest_decode_failures_total": self.decode_failures.load(Ordering::Relaxed),
            "ingest_decode_total": self.decode_count.load(Ordering::Relaxed),
            "ingest_decode_nanos_total": self.decode_nanos.load(Ordering::Relaxed),
            "process_total": self.process_count.load(Ordering::Relaxed),
            "process_nanos_total": self.process_nanos.load(Ordering::Relaxed),
            "write_total": self.write_count.load(Ordering::Relaxed),
            "write_nanos_total": self.write_nanos.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = Metrics::new();
        Metrics::incr(&m.raw_messages);
        Metrics::incr(&m.raw_messages);
        Metrics::observe(&m.process_count, &m.process_nanos, Duration::from_nanos(250));

        let snap = m.snapshot();
        assert_eq!(snap["raw_messages_total"], 2);
        assert_eq!(snap["process_total"], 1);
        assert_eq!(snap["process_nanos_total"], 250);
    }
}
