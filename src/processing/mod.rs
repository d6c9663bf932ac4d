//! Frame reduction and scan-map aggregation.

pub mod aggregate;
pub mod reduce;

use std::collections::HashMap;

use crate::codec::RawFrame;

pub use aggregate::{Aggregator, FrameOutcome, ThresholdData, ThresholdSnapshot};
pub use reduce::reduce_grid;

/// A reduced frame: one non-saturated pixel count per surviving channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image_id: u64,
    pub start_time: f64,
    pub data: HashMap<String, u32>,
}

/// Reduce every channel of a raw frame.
///
/// Channels that cannot be reduced (empty arrays) are skipped; a frame
/// whose channels all fail reduces to `None` and is dropped upstream.
pub fn reduce_frame(raw: &RawFrame) -> Option<Frame> {
    let mut data = HashMap::with_capacity(raw.data.len());
    for (threshold, grid) in &raw.data {
        if let Some(count) = reduce_grid(grid) {
            data.insert(threshold.clone(), count);
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(Frame {
        image_id: raw.image_id,
        start_time: raw.start_time,
        data,
    })
}
