//! Append-only raw ingest log.
//!
//! One file per process start: an 8-byte ASCII magic, then
//! `[8-byte LE unix nanoseconds][4-byte LE payload length][payload]`
//! records. Flushed after every record so a crash loses at most the
//! record being written. Safe for concurrent `record` calls.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::AppResult;

/// File magic identifying a raw ingest log.
pub const RAWLOG_MAGIC: &[u8; 8] = b"STXMRAW1";

struct Inner {
    writer: BufWriter<File>,
}

/// Concurrent append-only writer for raw transport payloads.
pub struct RawLogWriter {
    path: PathBuf,
    inner: Mutex<Option<Inner>>,
}

impl RawLogWriter {
    /// Create `<timestamp>_<prefix>.bin` under `dir` and write the magic.
    pub fn create(dir: &Path, prefix: &str) -> AppResult<Self> {
        fs::create_dir_all(dir)?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{timestamp}_{prefix}.bin"));
        let file = File::create(&path)?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        writer.write_all(RAWLOG_MAGIC)?;
        writer.flush()?;
        Ok(Self {
            path,
            inner: Mutex::new(Some(Inner { writer })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it.
    pub fn record(&self, payload: &[u8]) -> AppResult<()> {
        let mut guard = self.inner.lock();
        let inner = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "raw log writer is closed")
        })?;
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as u64;
        let mut header = [0u8; 12];
        header[..8].copy_from_slice(&nanos.to_le_bytes());
        header[8..].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        inner.writer.write_all(&header)?;
        inner.writer.write_all(payload)?;
        inner.writer.flush()?;
        Ok(())
    }

    /// Flush and close. Further `record` calls fail; closing twice is a
    /// no-op.
    pub fn close(&self) -> AppResult<()> {
        let mut guard = self.inner.lock();
        if let Some(mut inner) = guard.take() {
            inner.writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for RawLogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
