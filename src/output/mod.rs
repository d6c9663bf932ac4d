//! Persisted outputs: per-threshold series files and metadata envelopes.
//!
//! Series files are plain text, one CSV-style row per masked cell. Metadata
//! envelopes are indented JSON. Both live under the configured output
//! directory, named by run timestamp; filenames are the only identifiers.

pub mod normalize;
pub mod rawlog;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde_json::Value;

use crate::error::{AppResult, StxmError};
use crate::processing::ThresholdData;

pub use rawlog::RawLogWriter;

/// Write one `<run>_output_<threshold>_data.txt` file per channel of a
/// completed map.
///
/// Rows appear in image-index order, only for cells with the mask bit set:
/// `image_index, x, y, timestamp, value` with the timestamp at microsecond
/// precision.
pub fn write_series(
    output_dir: &Path,
    run_timestamp: &str,
    grid_x: usize,
    data: &HashMap<String, ThresholdData>,
) -> AppResult<()> {
    fs::create_dir_all(output_dir)?;

    for (threshold, bundle) in data {
        let path = output_dir.join(format!("{run_timestamp}_output_{threshold}_data.txt"));
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(file, "image_index, x, y, timestamp, value")?;
        for (image_id, &present) in bundle.mask.iter().enumerate() {
            if !present {
                continue;
            }
            let x = image_id % grid_x;
            let y = image_id / grid_x;
            writeln!(
                file,
                "{image_id}, {x}, {y}, {:.6}, {}",
                bundle.timestamps[image_id], bundle.values[image_id]
            )?;
        }
        file.flush()?;
    }
    Ok(())
}

/// Write a `<run>_<kind>_data.txt` metadata envelope as 2-space-indented
/// JSON. The value must already be normalized to string keys.
pub fn write_metadata(
    output_dir: &Path,
    run_timestamp: &str,
    kind: &str,
    meta: &Value,
) -> AppResult<()> {
    let kind = if kind.is_empty() { "metadata" } else { kind };
    fs::create_dir_all(output_dir).map_err(|e| StxmError::MetadataWrite(e.to_string()))?;

    let path = output_dir.join(format!("{run_timestamp}_{kind}_data.txt"));
    let file = File::create(path).map_err(|e| StxmError::MetadataWrite(e.to_string()))?;
    let mut file = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut file, meta)
        .map_err(|e| StxmError::MetadataWrite(e.to_string()))?;
    file.write_all(b"\n")
        .and_then(|_| file.flush())
        .map_err(|e| StxmError::MetadataWrite(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn threshold(values: Vec<u32>, timestamps: Vec<f64>, mask: Vec<bool>) -> ThresholdData {
        ThresholdData {
            values,
            timestamps,
            mask,
        }
    }

    #[test]
    fn series_file_lists_masked_cells_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = HashMap::new();
        data.insert(
            "threshold_0".to_string(),
            threshold(
                vec![10, 0, 30, 40],
                vec![1.0, 0.0, 3.5, 4.25],
                vec![true, false, true, true],
            ),
        );

        write_series(dir.path(), "20240101_120000", 2, &data).unwrap();

        let text = fs::read_to_string(
            dir.path()
                .join("20240101_120000_output_threshold_0_data.txt"),
        )
        .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "image_index, x, y, timestamp, value");
        assert_eq!(lines[1], "0, 0, 0, 1.000000, 10");
        assert_eq!(lines[2], "2, 0, 1, 3.500000, 30");
        assert_eq!(lines[3], "3, 1, 1, 4.250000, 40");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn metadata_file_is_indented_json() {
        let dir = tempfile::tempdir().unwrap();
        let meta = json!({"number_of_images": 4, "channels": ["threshold_0"]});
        write_metadata(dir.path(), "20240101_120000", "start", &meta).unwrap();

        let text =
            fs::read_to_string(dir.path().join("20240101_120000_start_data.txt")).unwrap();
        assert!(text.contains("  \"number_of_images\": 4"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn empty_kind_falls_back_to_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(dir.path(), "20240101_120000", "", &json!({})).unwrap();
        assert!(dir.path().join("20240101_120000_metadata_data.txt").exists());
    }
}
