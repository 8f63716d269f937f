//! Shared 2D geometry helpers plus the affine device-to-world pose
//! transform.

use crate::Point2D;
use nalgebra::{Isometry2, Point2, Vector2};
use serde::{Deserialize, Serialize};

pub fn distance(x1: f32, y1: f32, x2: f32, y2: f32) -> f32 {
    ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt()
}

pub fn distance_points(a: &Point2D, b: &Point2D) -> f32 {
    distance(a.0, a.1, b.0, b.1)
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

pub fn centroid(points: &[Point2D]) -> Option<Point2D> {
    if points.is_empty() {
        return None;
    }
    let (sx, sy) = points.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    let n = points.len() as f32;
    Some((sx / n, sy / n))
}

/// Angle from the origin to `(x, y)`, in radians, in `[0, 2*PI)`.
pub fn bearing(x: f32, y: f32) -> f32 {
    let a = y.atan2(x);
    if a < 0.0 {
        a + std::f32::consts::TAU
    } else {
        a
    }
}

/// Smallest enclosing diameter of a point set (used by the Tracker's
/// merge-group output).
pub fn enclosing_diameter(points: &[Point2D]) -> f32 {
    let mut max = 0.0f32;
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            max = max.max(distance_points(&points[i], &points[j]));
        }
    }
    max
}

/// Bounding-box centre + enclosing diameter, as used when collapsing a
/// merge-group into a single Trackable.
pub fn bounding_centre_and_size(points: &[Point2D]) -> (Point2D, f32) {
    let min_x = points.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let max_x = points.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = points.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_y = points.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
    let centre = ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);
    let size = distance(min_x, min_y, max_x, max_y);
    (centre, size)
}

/// Per-sensor affine pose (position + rotation) placing the device's
/// polar frame into the world frame, optionally with a per-axis flip
/// (teacher's `LidarDevice.flip_coords`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    /// Radians.
    pub rotation: f32,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            flip_x: false,
            flip_y: false,
        }
    }
}

impl Pose {
    pub fn new(x: f32, y: f32, rotation: f32) -> Self {
        Pose {
            x,
            y,
            rotation,
            flip_x: false,
            flip_y: false,
        }
    }

    fn isometry(&self) -> Isometry2<f32> {
        Isometry2::new(Vector2::new(self.x, self.y), self.rotation)
    }

    /// Transform a point from the device's own polar-derived Cartesian
    /// frame into the world frame.
    pub fn to_world(&self, p: Point2D) -> Point2D {
        let (mut x, mut y) = p;
        if self.flip_x {
            x = -x;
        }
        if self.flip_y {
            y = -y;
        }
        let world = self.isometry() * Point2::new(x, y);
        (world.x, world.y)
    }

    /// Inverse of [`Pose::to_world`].
    pub fn to_device(&self, p: Point2D) -> Point2D {
        let local = self.isometry().inverse() * Point2::new(p.0, p.1);
        let (mut x, mut y) = (local.x, local.y);
        if self.flip_x {
            x = -x;
        }
        if self.flip_y {
            y = -y;
        }
        (x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn centroid_of_square() {
        let pts = [(0.0, 0.0), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0)];
        assert_eq!(centroid(&pts), Some((1.0, 1.0)));
    }

    #[test]
    fn bearing_is_normalised_to_positive_range() {
        let b = bearing(-1.0, -1.0);
        assert!((0.0..std::f32::consts::TAU).contains(&b));
    }

    #[test]
    fn pose_round_trips_through_world_frame() {
        let pose = Pose::new(10.0, -5.0, std::f32::consts::FRAC_PI_4);
        let p = (3.0, 4.0);
        let world = pose.to_world(p);
        let back = pose.to_device(world);
        assert_relative_eq!(back.0, p.0, epsilon = 1e-4);
        assert_relative_eq!(back.1, p.1, epsilon = 1e-4);
    }
}
