//! Synthetic data generator.
//!
//! Emits image frames whose reduced counts form a noisy Gaussian spot
//! centered on the grid, so the whole pipeline (reduction included) can be
//! exercised without a detector. One scan pass covers every image id in
//! order; the noise field is redrawn at the top of each pass.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{PixelArray, PixelGrid, RawFrame, RawMessage};

/// Run the generator until cancellation, sending frames at `acq_rate`.
pub async fn stream(
    token: CancellationToken,
    grid_x: usize,
    grid_y: usize,
    acq_rate: f64,
    tx: mpsc::Sender<RawMessage>,
) {
    let total_pixels = grid_x * grid_y;
    let interval = Duration::from_secs_f64(1.0 / acq_rate.max(0.001));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut base = vec![0f64; total_pixels];
    let mut sigma = vec![0f64; total_pixels];
    for (i, (b, s)) in base.iter_mut().zip(sigma.iter_mut()).enumerate() {
        let x = (i % grid_x) as f64;
        let y = (i / grid_x) as f64;
        let dx = x - grid_x as f64 / 2.0;
        let dy = y - grid_y as f64 / 2.0;
        let dist2 = dx * dx + dy * dy;
        *b = 1000.0 * (-dist2 / ((grid_x * grid_y) as f64 / 20.0)).exp();
        *s = b.sqrt();
    }

    let mut values = vec![0u32; total_pixels];
    let mut image_id = 0usize;
    let mut rng = StdRng::from_entropy();

    debug!(grid_x, grid_y, acq_rate, "simulator started");
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if image_id == 0 {
            for i in 0..total_pixels {
                let noise = match Normal::new(0.0, sigma[i].max(f64::MIN_POSITIVE)) {
                    Ok(dist) => dist.sample(&mut rng),
                    Err(_) => rng.gen_range(-1.0..1.0),
                };
                values[i] = (base[i] + noise).max(0.0) as u32;
            }
        }

        let value = values[image_id];
        let frame = RawFrame {
            image_id: image_id as u64,
            start_time: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as f64 / 1e9,
            data: synthetic_channels(value),
        };
        if tx.send(RawMessage::Image(frame)).await.is_err() {
            return;
        }

        image_id += 1;
        if image_id >= total_pixels {
            image_id = 0;
        }
    }
}

/// Build channel arrays whose non-saturated pixel count reduces to the
/// desired value (`threshold_1` runs at 70 % of `threshold_0`).
fn synthetic_channels(value: u32) -> HashMap<String, PixelGrid> {
    let mut data = HashMap::with_capacity(2);
    data.insert("threshold_0".to_string(), count_grid(value));
    data.insert(
        "threshold_1".to_string(),
        count_grid((value as f64 * 0.7) as u32),
    );
    data
}

/// A 1-row u16 grid with exactly `count` non-sentinel pixels.
fn count_grid(count: u32) -> PixelGrid {
    if count == 0 {
        return PixelGrid {
            rows: 1,
            cols: 1,
            pixels: PixelArray::U16(vec![u16::MAX]),
        };
    }
    PixelGrid {
        rows: 1,
        cols: count as usize,
        pixels: PixelArray::U16(vec![1; count as usize]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::reduce_grid;

    #[test]
    fn count_grid_reduces_to_the_requested_value() {
        for count in [0u32, 1, 7, 250] {
            let grid = count_grid(count);
            assert_eq!(reduce_grid(&grid), Some(count));
        }
    }

    #[tokio::test]
    async fn simulator_walks_image_ids_in_scan_order() {
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(stream(token.clone(), 2, 2, 2000.0, tx));

        let mut seen = Vec::new();
        for _ in 0..5 {
            match rx.recv().await.unwrap() {
                RawMessage::Image(frame) => seen.push(frame.image_id),
                other => panic!("unexpected message {other:?}"),
            }
        }
        token.cancel();
        let _ = task.await;
        assert_eq!(seen, vec![0, 1, 2, 3, 0]);
    }
}
