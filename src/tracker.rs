//! `Tracker`: unifies per-device detected objects into persistent,
//! identified `Trackable`s. Implements the default `UniteObjects`
//! strategy in full; `UniteBlobs`/`UniteStages` are named but fall
//! back to `UniteObjects` with a warning, since they require
//! restructuring the upstream segmentation/merge order rather than
//! anything this stage alone can do.

use std::collections::HashSet;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device_set::WorldObject;
use crate::geometry::{bounding_centre_and_size, distance_points, enclosing_diameter};
use crate::Point2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnificationStrategy {
    UniteBlobs,
    UniteStages,
    UniteObjects,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackableFlags {
    pub activated: bool,
    pub private: bool,
    pub immobile: bool,
    pub occluded: bool,
    pub portal: bool,
    pub latent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trackable {
    pub id: u64,
    pub uuid: Uuid,
    pub position: Point2D,
    pub size: f32,
    pub confidence: f32,
    pub first_seen_ms: u64,
    pub last_touched_ms: u64,
    pub motion: Point2D,
    pub predicted_position: Point2D,
    pub flags: TrackableFlags,
    immobile_anchor: Point2D,
    immobile_anchor_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub strategy: UnificationStrategy,
    /// Distance (m) within which two detections are candidates to
    /// merge, before the per-ms-offset allowance.
    pub unite_distance: f32,
    /// m/ms a point may move between two frames' timestamps, used to
    /// widen `unite_distance` and the merge-group size cap.
    pub time_offset_speed: f32,
    /// A merge-group whose enclosing diameter exceeds
    /// `object_max_size + maxTimeOffset(group)` is split.
    pub object_max_size: f32,
    /// Nearest-neighbour association distance for the tracking stage.
    pub track_distance: f32,
    /// Linear smoothing weight for motion prediction, in `[0,1]`.
    pub track_filter_weight: f32,
    pub keep_alive_ms: u64,
    pub immobile_distance: f32,
    pub immobile_timeout_ms: u64,
    /// Split penalty applied when either candidate carries `isSplit`.
    pub split_penalty: f32,
    /// Confidence-penalty scale in the weighted-distance formula.
    pub confidence_penalty_scale: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            strategy: UnificationStrategy::UniteObjects,
            unite_distance: 0.3,
            time_offset_speed: 0.002, // 2 m/s
            object_max_size: 1.0,
            track_distance: 0.5,
            track_filter_weight: 0.3,
            keep_alive_ms: 500,
            immobile_distance: 1.0,
            immobile_timeout_ms: 60_000,
            split_penalty: 1.0,
            confidence_penalty_scale: 0.8,
        }
    }
}

/// A detection lifted into world coordinates, input to the merge step.
#[derive(Debug, Clone)]
struct Candidate {
    position: Point2D,
    confidence: f32,
    is_split: bool,
    timestamp_ms: u64,
}

impl From<&WorldObject> for Candidate {
    fn from(w: &WorldObject) -> Self {
        Candidate {
            position: w.world_centroid,
            confidence: w.object.confidence,
            is_split: w.object.is_split,
            timestamp_ms: w.object.timestamp_ms,
        }
    }
}

pub enum Classification {
    None,
    Occluded,
    Portal,
    Green,
    Private,
}

/// Samples an RGB bitmap keyed by world-to-pixel affine mapping to
/// classify Trackables into occlusion/private/portal status.
pub struct OcclusionMap {
    image: image::RgbImage,
    pixels_per_metre: f32,
    origin: Point2D,
}

impl OcclusionMap {
    pub fn new(image: image::RgbImage, pixels_per_metre: f32, origin: Point2D) -> Self {
        OcclusionMap {
            image,
            pixels_per_metre,
            origin,
        }
    }

    pub fn classify(&self, world: Point2D) -> Classification {
        let px = ((world.0 - self.origin.0) * self.pixels_per_metre) as i64;
        let py = ((world.1 - self.origin.1) * self.pixels_per_metre) as i64;
        let (w, h) = self.image.dimensions();
        if px < 0 || py < 0 || px >= w as i64 || py >= h as i64 {
            return Classification::None;
        }
        let p = self.image.get_pixel(px as u32, py as u32);
        let (r, g, b) = (p[0] > 128, p[1] > 128, p[2] > 128);
        match (r, g, b) {
            (true, true, _) => Classification::Occluded,
            (true, false, _) => Classification::Portal,
            (false, true, _) => Classification::Green,
            (false, false, true) => Classification::Private,
            _ => Classification::None,
        }
    }
}

pub struct Tracker {
    pub config: TrackerConfig,
    trackables: Vec<Trackable>,
    next_id: u64,
    pub occlusion_map: Option<OcclusionMap>,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Tracker {
            config,
            trackables: Vec::new(),
            next_id: 1,
            occlusion_map: None,
        }
    }

    pub fn trackables(&self) -> &[Trackable] {
        &self.trackables
    }

    fn max_time_offset_pair(&self, a_ts: u64, b_ts: u64) -> f32 {
        let dt = a_ts.abs_diff(b_ts) as f32;
        dt * self.config.time_offset_speed
    }

    fn max_time_offset_group(&self, timestamps: &[u64]) -> f32 {
        let min = *timestamps.iter().min().unwrap_or(&0);
        let max = *timestamps.iter().max().unwrap_or(&0);
        (max - min) as f32 * self.config.time_offset_speed
    }

    /// Weighted pairwise distance: a confidence penalty scaled by
    /// `(1 + 0.5*(2 - c1 - c2) * scale)`, plus a flat split penalty if
    /// either candidate is split.
    fn weighted_distance(&self, a: &Candidate, b: &Candidate) -> f32 {
        let raw = distance_points(&a.position, &b.position);
        let confidence_penalty = 1.0 + 0.5 * (2.0 - a.confidence - b.confidence) * self.config.confidence_penalty_scale;
        let split_penalty = if a.is_split || b.is_split {
            self.config.split_penalty
        } else {
            0.0
        };
        raw * confidence_penalty + split_penalty
    }

    /// Builds candidate merges, greedily unions
    /// into groups bounded by size, recursively splitting oversized
    /// groups by farthest-pair seeding, then collapse each group to
    /// one merged point.
    fn unite_objects(&self, candidates: &[Candidate]) -> Vec<(Point2D, f32, f32)> {
        let n = candidates.len();
        if n == 0 {
            return Vec::new();
        }

        // Candidate merge edges within range, sorted ascending.
        let mut edges: Vec<(f32, usize, usize)> = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let w = self.weighted_distance(&candidates[i], &candidates[j]);
                let allowance = self.config.unite_distance
                    + self.max_time_offset_pair(candidates[i].timestamp_ms, candidates[j].timestamp_ms);
                if w <= allowance {
                    edges.push((w, i, j));
                }
            }
        }
        edges.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        // Union-find.
        let mut parent: Vec<usize> = (0..n).collect();
        fn find(parent: &mut [usize], x: usize) -> usize {
            if parent[x] != x {
                parent[x] = find(parent, parent[x]);
            }
            parent[x]
        }

        for (_, i, j) in edges {
            let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
            if ri == rj {
                continue;
            }
            let mut group: Vec<usize> = (0..n).filter(|&k| find(&mut parent, k) == ri).collect();
            group.extend((0..n).filter(|&k| find(&mut parent, k) == rj));
            let points: Vec<Point2D> = group.iter().map(|&k| candidates[k].position).collect();
            let timestamps: Vec<u64> = group.iter().map(|&k| candidates[k].timestamp_ms).collect();
            let limit = self.config.object_max_size + self.max_time_offset_group(&timestamps);
            if enclosing_diameter(&points) <= limit {
                parent[ri] = rj;
            }
            // else: leave ungrouped, the limit would be exceeded.
        }

        // Collect final groups, recursively splitting any that still
        // exceed the limit (can happen via transitive unions above).
        // A BTreeMap keeps group order deterministic (by root id) so
        // `track`'s association pass breaks ties the same way every run.
        let mut groups: std::collections::BTreeMap<usize, Vec<usize>> = std::collections::BTreeMap::new();
        for k in 0..n {
            groups.entry(find(&mut parent, k)).or_default().push(k);
        }

        let mut output = Vec::new();
        for (_, indices) in groups {
            self.split_and_collapse(&indices, candidates, &mut output);
        }
        output
    }

    /// Recursively halve an oversized group by farthest-pair seeding
    /// bottoming out when the group fits the size limit or is down to
    /// one member.
    fn split_and_collapse(&self, indices: &[usize], candidates: &[Candidate], output: &mut Vec<(Point2D, f32, f32)>) {
        let points: Vec<Point2D> = indices.iter().map(|&k| candidates[k].position).collect();
        let timestamps: Vec<u64> = indices.iter().map(|&k| candidates[k].timestamp_ms).collect();
        let limit = self.config.object_max_size + self.max_time_offset_group(&timestamps);
        let diameter = enclosing_diameter(&points);

        if indices.len() <= 1 || diameter <= limit {
            let (centre, size) = bounding_centre_and_size(&points);
            let confidence = candidates_mean_confidence(indices, candidates);
            output.push((centre, size.max(0.01), confidence));
            return;
        }

        // Farthest pair seeds two halves; assign every other point to
        // whichever seed it's nearer to.
        let (mut seed_a, mut seed_b) = (0usize, 1usize);
        let mut best = 0.0f32;
        for i in 0..indices.len() {
            for j in (i + 1)..indices.len() {
                let d = distance_points(&points[i], &points[j]);
                if d > best {
                    best = d;
                    seed_a = i;
                    seed_b = j;
                }
            }
        }
        let (mut half_a, mut half_b) = (Vec::new(), Vec::new());
        for i in 0..indices.len() {
            let da = distance_points(&points[i], &points[seed_a]);
            let db = distance_points(&points[i], &points[seed_b]);
            if da <= db {
                half_a.push(indices[i]);
            } else {
                half_b.push(indices[i]);
            }
        }

        if half_a.is_empty() || half_b.is_empty() {
            // Degenerate split (can't profitably divide further, e.g.
            // every point equidistant); collapse as-is.
            let (centre, size) = bounding_centre_and_size(&points);
            let confidence = candidates_mean_confidence(indices, candidates);
            output.push((centre, size.max(0.01), confidence));
            return;
        }

        self.split_and_collapse(&half_a, candidates, output);
        self.split_and_collapse(&half_b, candidates, output);
    }

    /// Associates merged points with existing
    /// Trackables by nearest neighbour, apply linear motion
    /// prediction, expire unassociated Trackables after
    /// `keep_alive_ms`.
    pub fn track(&mut self, world_objects: &[WorldObject], now_ms: u64) -> Vec<Trackable> {
        if self.config.strategy != UnificationStrategy::UniteObjects {
            warn!(
                "unification strategy {:?} is not implemented standalone; falling back to UniteObjects",
                self.config.strategy
            );
        }

        let candidates: Vec<Candidate> = world_objects.iter().map(Candidate::from).collect();
        let merged = self.unite_objects(&candidates);

        let mut used_trackable: HashSet<usize> = HashSet::new();
        let mut leaving: Vec<usize> = Vec::new();

        // Greedy nearest-neighbour association, tie-broken by higher
        // confidence then lower id.
        let mut assignments: Vec<Option<usize>> = vec![None; merged.len()];
        for (mi, (position, _, confidence)) in merged.iter().enumerate() {
            let predicted: Vec<(usize, f32)> = self
                .trackables
                .iter()
                .enumerate()
                .filter(|(ti, _)| !used_trackable.contains(ti))
                .map(|(ti, t)| (ti, distance_points(position, &t.predicted_position)))
                .filter(|&(_, d)| d <= self.config.track_distance)
                .collect();

            if let Some(&(best_ti, _)) = predicted.iter().min_by(|a, b| {
                let ta = &self.trackables[a.0];
                let tb = &self.trackables[b.0];
                a.1.partial_cmp(&b.1)
                    .unwrap()
                    .then_with(|| tb.confidence.partial_cmp(&ta.confidence).unwrap())
                    .then_with(|| ta.id.cmp(&tb.id))
            }) {
                assignments[mi] = Some(best_ti);
                used_trackable.insert(best_ti);
            }
            let _ = confidence;
        }

        for (ti, t) in self.trackables.iter_mut().enumerate() {
            if !used_trackable.contains(&ti) {
                leaving.push(ti);
                continue;
            }
        }

        let mut updated: Vec<Trackable> = Vec::with_capacity(self.trackables.len());
        let mut consumed_merge: HashSet<usize> = HashSet::new();

        for (ti, mut t) in std::mem::take(&mut self.trackables).into_iter().enumerate() {
            if let Some(mi) = assignments.iter().position(|a| *a == Some(ti)) {
                consumed_merge.insert(mi);
                let (position, size, confidence) = merged[mi];
                let weight = self.config.track_filter_weight;
                let new_x = t.predicted_position.0 + (position.0 - t.predicted_position.0) * weight;
                let new_y = t.predicted_position.1 + (position.1 - t.predicted_position.1) * weight;
                t.motion = (new_x - t.position.0, new_y - t.position.1);
                t.position = (new_x, new_y);
                t.predicted_position = (new_x + t.motion.0, new_y + t.motion.1);
                t.size = size;
                t.confidence = confidence;
                t.last_touched_ms = now_ms;
                t.flags.activated = true;

                if distance_points(&t.position, &t.immobile_anchor) > self.config.immobile_distance {
                    t.immobile_anchor = t.position;
                    t.immobile_anchor_ms = now_ms;
                    t.flags.immobile = false;
                } else if now_ms.saturating_sub(t.immobile_anchor_ms) > self.config.immobile_timeout_ms {
                    t.flags.immobile = true;
                }

                self.apply_occlusion(&mut t);
                updated.push(t);
            } else if now_ms.saturating_sub(t.last_touched_ms) <= self.config.keep_alive_ms {
                // Persist unassociated Trackable for keep-alive window.
                updated.push(t);
            } else {
                debug!("trackable {} ({}): Leave after keep-alive expiry", t.id, t.uuid);
            }
        }

        // Promote unassigned merge points to new Trackables.
        for (mi, (position, size, confidence)) in merged.iter().enumerate() {
            if consumed_merge.contains(&mi) {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut t = Trackable {
                id,
                uuid: Uuid::new_v4(),
                position: *position,
                size: *size,
                confidence: *confidence,
                first_seen_ms: now_ms,
                last_touched_ms: now_ms,
                motion: (0.0, 0.0),
                predicted_position: *position,
                flags: TrackableFlags {
                    activated: true,
                    ..Default::default()
                },
                immobile_anchor: *position,
                immobile_anchor_ms: now_ms,
            };
            self.apply_occlusion(&mut t);
            debug!("trackable {} ({}): Enter at ({:.2},{:.2})", t.id, t.uuid, t.position.0, t.position.1);
            updated.push(t);
        }

        self.trackables = updated;
        self.trackables.clone()
    }

    fn apply_occlusion(&self, t: &mut Trackable) {
        let Some(map) = &self.occlusion_map else {
            t.flags.occluded = false;
            t.flags.portal = false;
            t.flags.private = false;
            return;
        };
        match map.classify(t.position) {
            Classification::Occluded => {
                t.flags.occluded = true;
            }
            Classification::Portal => {
                t.flags.occluded = false;
                t.flags.portal = true;
            }
            Classification::Private => {
                t.flags.occluded = false;
                t.flags.private = true;
            }
            Classification::Green | Classification::None => {
                t.flags.occluded = false;
                t.flags.portal = false;
                t.flags.private = false;
            }
        }
    }
}

fn candidates_mean_confidence(indices: &[usize], candidates: &[Candidate]) -> f32 {
    let sum: f32 = indices.iter().map(|&k| candidates[k].confidence).sum();
    sum / indices.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DetectedObject;

    fn world_object(x: f32, y: f32, confidence: f32, is_split: bool, ts: u64) -> WorldObject {
        WorldObject {
            device_name: "d".into(),
            object: DetectedObject {
                first_sample_index: 0,
                last_sample_index: 0,
                extent: 0.3,
                closest_range: 1.0,
                centroid: (x, y),
                normal: (1.0, 0.0),
                person_score: 0.8,
                curvature_score: 0.8,
                confidence,
                is_split,
                timestamp_ms: ts,
            },
            world_centroid: (x, y),
        }
    }

    #[test]
    fn split_penalty_prevents_merge_of_two_sensors_scenario_s2() {
        let config = TrackerConfig { unite_distance: 1.0, ..Default::default() };
        let tracker = Tracker::new(config);
        let candidates = vec![
            Candidate { position: (0.0, 0.0), confidence: 0.9, is_split: true, timestamp_ms: 0 },
            Candidate { position: (0.6, 0.0), confidence: 0.9, is_split: false, timestamp_ms: 0 },
        ];
        let merged = tracker.unite_objects(&candidates);
        assert_eq!(merged.len(), 2, "split flag must prevent merging within uniteDistance");
    }

    #[test]
    fn single_trackable_enters_then_leaves_after_keep_alive() {
        let mut tracker = Tracker::new(TrackerConfig { keep_alive_ms: 100, ..Default::default() });
        let result = tracker.track(&[world_object(0.5, 0.0, 0.9, false, 0)], 0);
        assert_eq!(result.len(), 1);
        let id = result[0].id;

        // Still within keep-alive window with no new input.
        let result = tracker.track(&[], 50);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, id);

        // Past keep-alive window.
        let result = tracker.track(&[], 200);
        assert!(result.is_empty());
    }

    #[test]
    fn id_is_stable_across_frames_for_the_same_moving_point() {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let r1 = tracker.track(&[world_object(0.0, 0.0, 0.9, false, 0)], 0);
        let id = r1[0].id;
        let r2 = tracker.track(&[world_object(0.05, 0.0, 0.9, false, 16)], 16);
        assert_eq!(r2.len(), 1);
        assert_eq!(r2[0].id, id);
    }

    #[test]
    fn immobile_flag_set_after_timeout_without_movement() {
        let mut tracker = Tracker::new(TrackerConfig {
            immobile_distance: 1.0,
            immobile_timeout_ms: 60_000,
            track_filter_weight: 1.0,
            ..Default::default()
        });
        tracker.track(&[world_object(0.0, 0.0, 0.9, false, 0)], 0);
        let result = tracker.track(&[world_object(0.0, 0.0, 0.9, false, 61_000)], 61_000);
        assert!(result[0].flags.immobile);
    }
}
