//! The per-angular-bin `Sample` and the `RawFrame` it belongs to.

use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Number of angle buckets covering a full rotation (`NUM_SAMPLES = 3072`).
pub const NUM_SAMPLES: usize = 3072;

/// One angle + distance + quality reading, with its derived Cartesian
/// coordinate in the owning device's own frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    /// Radians, in `[0, 2*PI)`.
    pub angle: f32,
    /// Metres.
    pub distance: f32,
    /// `0` means invalid.
    pub quality: i32,
}

impl Sample {
    pub fn is_valid(&self) -> bool {
        self.quality != 0 && self.distance >= 0.0
    }

    /// Cartesian coordinate in the device's own frame.
    pub fn to_cartesian(&self) -> (f32, f32) {
        (self.distance * self.angle.cos(), self.distance * self.angle.sin())
    }
}

/// Angle bucket index in `[0, NUM_SAMPLES)`: `round(angle * N / 2*PI)`,
/// with an exact half-bucket tie rounding to the lower bucket rather
/// than `f32::round`'s round-half-away-from-zero.
pub fn bucket_index(angle: f32) -> usize {
    let normalised = angle.rem_euclid(TAU);
    let scaled = normalised * NUM_SAMPLES as f32 / TAU;
    let floor = scaled.floor();
    let fract = scaled - floor;
    let raw = if fract > 0.5 { floor + 1.0 } else { floor };
    ((raw as i64).rem_euclid(NUM_SAMPLES as i64)) as usize
}

/// Centre angle of a bucket, inverse of [`bucket_index`] (approximately
/// — bucket boundaries are not invertible exactly, this returns the
/// bucket's nominal centre angle). `bucket_index` rounds to the
/// nearest bucket centre, so bucket `k`'s centre is at `k`, not `k+0.5`.
pub fn bucket_centre_angle(bucket: usize) -> f32 {
    bucket as f32 * TAU / NUM_SAMPLES as f32
}

/// One full 360-degree rotation of samples from a single sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFrame {
    pub samples: Vec<Sample>,
    /// Monotonically increasing, milliseconds.
    pub timestamp_ms: u64,
    pub sequence_id: u64,
}

impl RawFrame {
    pub fn new(timestamp_ms: u64, sequence_id: u64, samples: Vec<Sample>) -> Self {
        RawFrame {
            samples,
            timestamp_ms,
            sequence_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_angle_is_bucket_zero() {
        assert_eq!(bucket_index(0.0), 0);
    }

    #[test]
    fn exact_half_bucket_tie_rounds_down() {
        // Halfway between bucket 0 and bucket 1's centres is the one
        // ambiguous tie point; it must land in the lower bucket.
        let bucket_width = TAU / NUM_SAMPLES as f32;
        assert_eq!(bucket_index(bucket_width / 2.0), 0);
    }

    #[test]
    fn sixty_percent_into_a_bucket_rounds_up() {
        let bucket_width = TAU / NUM_SAMPLES as f32;
        assert_eq!(bucket_index(0.6 * bucket_width), 1);
    }

    #[test]
    fn wraps_at_full_turn() {
        assert_eq!(bucket_index(TAU), 0);
        let bucket_width = TAU / NUM_SAMPLES as f32;
        assert_eq!(bucket_index(-0.7 * bucket_width), NUM_SAMPLES - 1);
    }
}
