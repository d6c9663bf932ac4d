//! Summarize captured CBOR detector messages.
//!
//! Takes a single `.cbor` file or a directory of them and prints one
//! summary line per message: kind counts, declared channels for `start`
//! messages, and per-channel array shape and typed-array tag for the
//! first few images. Useful for eyeballing a capture before replaying it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use stxm_map::codec::arrays::{TAG_DECTRIS, TAG_MULTI_DIM};
use stxm_map::codec::{decode_raw, CborValue};

#[derive(Parser)]
#[command(name = "stxm-decode")]
#[command(about = "Summarize CBOR detector messages from disk", long_about = None)]
struct Cli {
    /// Path to a CBOR file or a directory of .cbor files
    #[arg(long)]
    path: PathBuf,

    /// Max number of image messages to summarize
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let files = list_files(&cli.path)?;

    let mut start_count = 0usize;
    let mut image_count = 0usize;
    let mut end_count = 0usize;

    for file in files {
        let data = match fs::read(&file) {
            Ok(data) => data,
            Err(err) => {
                eprintln!("read {}: {err}", file.display());
                continue;
            }
        };
        let value = match decode_raw(&data) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("decode {}: {err}", file.display());
                continue;
            }
        };

        match field(&value, "type").and_then(CborValue::as_str) {
            Some("start") => {
                start_count += 1;
                println!("start: {}", file.display());
                println!("  channels: {:?}", channel_list(&value));
            }
            Some("end") => end_count += 1,
            Some("image") => {
                image_count += 1;
                if image_count <= cli.limit {
                    println!("image: {}", file.display());
                    println!("  image_id: {}", display_field(&value, "image_id"));
                    println!("  series_id: {}", display_field(&value, "series_id"));
                    if let Some(CborValue::Map(entries)) = field(&value, "data") {
                        for (key, channel) in entries {
                            let name = key.as_str().unwrap_or("?");
                            println!("  channel {name}: {}", describe_data(channel));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    println!("summary: start={start_count} image={image_count} end={end_count}");
    Ok(())
}

fn field<'a>(value: &'a CborValue, name: &str) -> Option<&'a CborValue> {
    match value {
        CborValue::Map(entries) => entries
            .iter()
            .find(|(key, _)| key.as_str() == Some(name))
            .map(|(_, value)| value),
        _ => None,
    }
}

fn display_field(value: &CborValue, name: &str) -> String {
    match field(value, name) {
        Some(value) => format!("{value:?}"),
        None => "<missing>".to_string(),
    }
}

fn channel_list(value: &CborValue) -> Vec<String> {
    match field(value, "channels") {
        Some(CborValue::Array(items)) => items
            .iter()
            .filter_map(CborValue::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// One-line shape description of a channel payload without expanding it.
fn describe_data(value: &CborValue) -> String {
    let CborValue::Tagged(tag, content) = value else {
        return format!("untagged {value:?}");
    };
    if *tag != TAG_MULTI_DIM {
        return format!("tag {tag}");
    }
    let CborValue::Array(items) = content.as_ref() else {
        return "invalid multidim".to_string();
    };
    if items.len() != 2 {
        return "invalid multidim".to_string();
    }
    let dims = match &items[0] {
        CborValue::Array(dims) if dims.len() == 2 => {
            format!(
                "[{} {}]",
                dims[0].as_u64().unwrap_or(0),
                dims[1].as_u64().unwrap_or(0)
            )
        }
        _ => return "invalid dims".to_string(),
    };
    match &items[1] {
        CborValue::Tagged(TAG_DECTRIS, _) => format!("dims {dims} (compressed)"),
        CborValue::Tagged(data_tag, inner) => match inner.as_ref() {
            CborValue::Tagged(TAG_DECTRIS, _) => {
                format!("dims {dims} tag {data_tag} (compressed)")
            }
            _ => format!("dims {dims} tag {data_tag}"),
        },
        _ => format!("dims {dims} tag 0"),
    }
}

fn list_files(path: &Path) -> Result<Vec<PathBuf>> {
    let info = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if !info.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let entry_path = entry.path();
        if entry_path.extension().and_then(|e| e.to_str()) == Some("cbor") {
            files.push(entry_path);
        }
    }
    files.sort();
    Ok(files)
}
