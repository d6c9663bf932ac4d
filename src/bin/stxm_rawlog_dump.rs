//! Inspect a raw ingest log.
//!
//! Validates the `STXMRAW1` magic, then walks the
//! `[timestamp][length][payload]` records, decoding each payload from CBOR
//! and printing it as normalized, indented JSON.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, TimeZone, Utc};
use clap::Parser;

use stxm_map::codec;
use stxm_map::output::normalize::normalize_value;
use stxm_map::output::rawlog::RAWLOG_MAGIC;

#[derive(Parser)]
#[command(name = "stxm-rawlog-dump")]
#[command(about = "Dump records from a raw ingest log", long_about = None)]
struct Cli {
    /// Path to rawlog .bin file
    #[arg(long)]
    path: PathBuf,

    /// Number of records to dump (0 = all)
    #[arg(long, default_value_t = 1)]
    limit: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = File::open(&cli.path)
        .with_context(|| format!("open rawlog {}", cli.path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).context("read magic")?;
    if &magic != RAWLOG_MAGIC {
        bail!(
            "unexpected rawlog magic {:?}",
            String::from_utf8_lossy(&magic)
        );
    }

    let mut count = 0usize;
    loop {
        if cli.limit > 0 && count >= cli.limit {
            return Ok(());
        }
        let mut header = [0u8; 12];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err).context("read record header"),
        }
        let nanos = i64::from_le_bytes(header[..8].try_into().unwrap());
        let size = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        if size == 0 {
            eprintln!("record {count}: empty payload");
            continue;
        }
        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).context("read payload")?;

        let decoded = match codec::decode_raw(&payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                eprintln!("record {count}: CBOR decode error: {err}");
                continue;
            }
        };
        let pretty = serde_json::to_string_pretty(&normalize_value(&decoded))
            .context("JSON encode record")?;

        let timestamp = Utc
            .timestamp_nanos(nanos)
            .to_rfc3339_opts(SecondsFormat::Nanos, true);
        eprintln!("record {count} timestamp={timestamp} size={size}");
        println!("{pretty}");
        count += 1;
    }
}
