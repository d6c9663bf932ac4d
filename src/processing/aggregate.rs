//! Scan-map aggregation over a rectangular grid.
//!
//! The scan is linearized row-major: `x = image_id % grid_x`,
//! `y = image_id / grid_x`. Cells are last-write-wins per image id, and a
//! frame counts toward completion once per insertion regardless of how
//! many channels it carries.

use std::collections::HashMap;

use super::Frame;

/// Dense per-channel map storage.
#[derive(Debug, Clone)]
pub struct ThresholdData {
    pub values: Vec<u32>,
    pub timestamps: Vec<f64>,
    pub mask: Vec<bool>,
}

impl ThresholdData {
    fn new(total_pixels: usize) -> Self {
        Self {
            values: vec![0; total_pixels],
            timestamps: vec![0.0; total_pixels],
            mask: vec![false; total_pixels],
        }
    }
}

/// Result of one [`Aggregator::add_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Inserted; the map is not yet full.
    Accepted,
    /// Inserted, and this insertion filled the grid. Reported exactly once;
    /// the caller must [`Aggregator::reset`] before inserting again.
    Complete,
    /// Image id outside `[0, total_pixels)`; dropped, not counted.
    OutOfRange,
}

/// Per-run accumulator of reduced frames into per-threshold maps.
///
/// Owned exclusively by the pipeline's final stage; concurrent readers get
/// deep copies through [`Aggregator::snapshot_copy`].
#[derive(Debug)]
pub struct Aggregator {
    grid_x: usize,
    grid_y: usize,
    total_pixels: usize,
    frame_count: usize,
    data: HashMap<String, ThresholdData>,
}

impl Aggregator {
    pub fn new(grid_x: usize, grid_y: usize) -> Self {
        Self {
            grid_x,
            grid_y,
            total_pixels: grid_x * grid_y,
            frame_count: 0,
            data: HashMap::new(),
        }
    }

    pub fn grid(&self) -> (usize, usize) {
        (self.grid_x, self.grid_y)
    }

    pub fn total_pixels(&self) -> usize {
        self.total_pixels
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Insert one reduced frame. Threshold buffers are allocated lazily on
    /// the first frame carrying that channel.
    pub fn add_frame(&mut self, frame: &Frame) -> FrameOutcome {
        if frame.image_id >= self.total_pixels as u64 {
            return FrameOutcome::OutOfRange;
        }
        let idx = frame.image_id as usize;

        for (threshold, &value) in &frame.data {
            let td = self
                .data
                .entry(threshold.clone())
                .or_insert_with(|| ThresholdData::new(self.total_pixels));
            td.values[idx] = value;
            td.timestamps[idx] = frame.start_time;
            td.mask[idx] = true;
        }

        self.frame_count += 1;
        if self.frame_count >= self.total_pixels {
            FrameOutcome::Complete
        } else {
            FrameOutcome::Accepted
        }
    }

    /// Drop all collected data and restart the frame count.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.data = HashMap::new();
    }

    /// Zero-copy view of the live buffers. Only the single-writer final
    /// stage may use this, immediately before [`Aggregator::reset`].
    pub fn snapshot(&self) -> &HashMap<String, ThresholdData> {
        &self.data
    }

    /// Deep copy of values and mask (never timestamps) for UI broadcast.
    pub fn snapshot_copy(&self) -> HashMap<String, ThresholdSnapshot> {
        self.data
            .iter()
            .map(|(threshold, td)| {
                (
                    threshold.clone(),
                    ThresholdSnapshot {
                        values: td.values.clone(),
                        mask: td.mask.clone(),
                    },
                )
            })
            .collect()
    }
}

/// UI-facing copy of one channel's map.
#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct ThresholdSnapshot {
    pub values: Vec<u32>,
    pub mask: Vec<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn frame(image_id: u64, value: u32) -> Frame {
        let mut data = Map::new();
        data.insert("threshold_0".to_string(), value);
        Frame {
            image_id,
            start_time: image_id as f64 * 0.25,
            data,
        }
    }

    #[test]
    fn fills_and_completes_exactly_once() {
        let mut agg = Aggregator::new(2, 2);
        assert_eq!(agg.add_frame(&frame(0, 1)), FrameOutcome::Accepted);
        assert_eq!(agg.add_frame(&frame(1, 2)), FrameOutcome::Accepted);
        assert_eq!(agg.add_frame(&frame(2, 3)), FrameOutcome::Accepted);
        assert_eq!(agg.add_frame(&frame(3, 4)), FrameOutcome::Complete);

        let td = &agg.snapshot()["threshold_0"];
        assert_eq!(td.values, vec![1, 2, 3, 4]);
        assert!(td.mask.iter().all(|&m| m));
    }

    #[test]
    fn out_of_range_is_a_no_op() {
        let mut agg = Aggregator::new(2, 2);
        assert_eq!(agg.add_frame(&frame(4, 9)), FrameOutcome::OutOfRange);
        assert_eq!(agg.frame_count(), 0);
        assert!(agg.snapshot().is_empty());
    }

    #[test]
    fn duplicate_image_id_overwrites_and_still_counts() {
        let mut agg = Aggregator::new(2, 1);
        assert_eq!(agg.add_frame(&frame(0, 1)), FrameOutcome::Accepted);
        assert_eq!(agg.add_frame(&frame(0, 7)), FrameOutcome::Complete);
        assert_eq!(agg.snapshot()["threshold_0"].values[0], 7);
        assert!(!agg.snapshot()["threshold_0"].mask[1]);
    }

    #[test]
    fn reset_clears_everything() {
        let mut agg = Aggregator::new(1, 1);
        assert_eq!(agg.add_frame(&frame(0, 5)), FrameOutcome::Complete);
        agg.reset();
        assert_eq!(agg.frame_count(), 0);
        assert!(agg.snapshot().is_empty());
        assert_eq!(agg.add_frame(&frame(0, 6)), FrameOutcome::Complete);
    }

    #[test]
    fn snapshot_copy_is_independent_of_live_buffers() {
        let mut agg = Aggregator::new(2, 1);
        agg.add_frame(&frame(0, 3));
        let copy = agg.snapshot_copy();
        agg.add_frame(&frame(1, 9));
        assert_eq!(copy["threshold_0"].values, vec![3, 0]);
        assert_eq!(copy["threshold_0"].mask, vec![true, false]);
    }

    #[test]
    fn channels_allocate_lazily() {
        let mut agg = Aggregator::new(2, 2);
        agg.add_frame(&frame(0, 1));
        let mut data = Map::new();
        data.insert("threshold_1".to_string(), 8);
        agg.add_frame(&Frame {
            image_id: 1,
            start_time: 0.0,
            data,
        });
        assert_eq!(agg.snapshot().len(), 2);
        assert!(!agg.snapshot()["threshold_1"].mask[0]);
        assert!(agg.snapshot()["threshold_1"].mask[1]);
    }
}
