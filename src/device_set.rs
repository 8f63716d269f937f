//! `DeviceSet`: owns `DeviceCore`s, named groups, the active-group
//! union, and the registration (auto-pose) sub-mode.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};

use crate::device::{DetectedObject, DeviceCore};
use crate::sensor::SensorDriver;
use crate::Point2D;

pub use crate::device::now_ms;

/// Device considered stalled past this, emits a warning.
pub const WARN_MS: u64 = 1_000;
/// Device considered failed past this, emits a notification.
pub const FAIL_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    Warning,
    Failed,
}

struct Entry {
    driver: Box<dyn SensorDriver>,
    core: Mutex<DeviceCore>,
}

pub struct DeviceSet {
    entries: HashMap<String, Entry>,
    groups: HashMap<String, HashSet<String>>,
    active_groups: HashSet<String>,
    pub simulation_mode: bool,
    pub out_env_forward: bool,
    registration: Option<Registration>,
}

/// One frame's worth of detected objects, lifted to world coordinates,
/// ready for the Tracker.
pub struct WorldObject {
    pub device_name: String,
    pub object: DetectedObject,
    pub world_centroid: Point2D,
}

impl Default for DeviceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSet {
    pub fn new() -> Self {
        DeviceSet {
            entries: HashMap::new(),
            groups: HashMap::new(),
            active_groups: HashSet::new(),
            simulation_mode: false,
            out_env_forward: false,
            registration: None,
        }
    }

    pub fn add_device(&mut self, name: impl Into<String>, driver: Box<dyn SensorDriver>, core: DeviceCore) {
        self.entries.insert(
            name.into(),
            Entry {
                driver,
                core: Mutex::new(core),
            },
        );
    }

    pub fn add_to_group(&mut self, group: impl Into<String>, device: impl Into<String>) {
        self.groups.entry(group.into()).or_default().insert(device.into());
    }

    pub fn activate_group(&mut self, group: impl Into<String>) {
        self.active_groups.insert(group.into());
    }

    pub fn deactivate_group(&mut self, group: &str) {
        self.active_groups.remove(group);
    }

    /// Union of all selected groups' device names.
    pub fn active_device_names(&self) -> HashSet<String> {
        if self.active_groups.is_empty() {
            return self.entries.keys().cloned().collect();
        }
        let mut set = HashSet::new();
        for group in &self.active_groups {
            if let Some(members) = self.groups.get(group) {
                set.extend(members.iter().cloned());
            }
        }
        set
    }

    pub fn with_core<R>(&self, name: &str, f: impl FnOnce(&mut DeviceCore) -> R) -> Option<R> {
        self.entries.get(name).map(|e| f(&mut e.core.lock().unwrap()))
    }

    /// One update cycle: poll each active device
    /// non-blockingly, hand new frames to the pipeline, track
    /// staleness, and return the per-device health snapshot.
    /// `active_world_positions` is the previous tick's Trackable
    /// positions, passed through to environment adaptation, and also
    /// feeds the registration sub-mode when one is in progress.
    pub fn update(&mut self, active_world_positions: &[Point2D]) -> Vec<(String, DeviceHealth, Vec<WorldObject>)> {
        let active = self.active_device_names();
        let mut results = Vec::new();
        let mut registration_input: Vec<(String, Vec<DetectedObject>)> = Vec::new();

        for name in active {
            let Some(entry) = self.entries.get_mut(&name) else {
                continue;
            };

            if entry.core.lock().unwrap().should_attempt_reopen() {
                match entry.driver.open() {
                    Ok(()) => {
                        info!("device {}: reopened after transient IO error", name);
                        entry.core.lock().unwrap().open();
                        entry.core.lock().unwrap().finish_power_up();
                    }
                    Err(e) => {
                        warn!("device {}: reopen attempt failed: {}", name, e);
                    }
                }
            }

            let mut world_objects = Vec::new();
            match entry.driver.grab_frame(Duration::from_millis(0)) {
                Ok(frame) => {
                    let mut core = entry.core.lock().unwrap();
                    match core.ingest_frame(&frame, active_world_positions) {
                        Ok(objects) => {
                            let pose = core.pose;
                            for object in &objects {
                                let world_centroid = pose.to_world(object.centroid);
                                world_objects.push(WorldObject {
                                    device_name: name.clone(),
                                    object: object.clone(),
                                    world_centroid,
                                });
                            }
                            registration_input.push((name.clone(), objects));
                        }
                        Err(e) => warn!("device {}: pipeline error: {}", name, e),
                    }
                }
                Err(e) if e.is_transient() => {
                    entry.core.lock().unwrap().mark_io_error();
                    warn!("device {}: transient IO error: {}", name, e);
                }
                Err(_) => {
                    trace_no_data(&name);
                }
            }

            let core = entry.core.lock().unwrap();
            let staleness = now_ms().saturating_sub(core.last_seen_ms);
            let health = if core.frame_count == 0 {
                DeviceHealth::Warning
            } else if staleness > FAIL_MS {
                DeviceHealth::Failed
            } else if staleness > WARN_MS {
                DeviceHealth::Warning
            } else {
                DeviceHealth::Healthy
            };
            results.push((name, health, world_objects));
        }

        if self.registration_active() {
            for (name, objects) in &registration_input {
                self.collect_markers(name, objects);
            }
        }
        if let Some(reg) = &self.registration {
            if reg.started_at.elapsed() >= reg.duration {
                self.solve_registration();
            }
        }

        results
    }

    // ---- Registration sub-mode ----

    pub fn begin_registration(&mut self, duration: Duration) {
        self.registration = Some(Registration {
            started_at: std::time::Instant::now(),
            duration,
            markers: HashMap::new(),
        });
    }

    pub fn registration_active(&self) -> bool {
        match &self.registration {
            Some(r) => r.started_at.elapsed() < r.duration,
            None => false,
        }
    }

    /// Collect a candidate marker pair from a device's raw detections:
    /// two very close, high-quality objects.
    pub fn collect_markers(&mut self, device_name: &str, objects: &[DetectedObject]) {
        let Some(reg) = self.registration.as_mut() else {
            return;
        };
        const MARKER_PAIR_MAX_DIST: f32 = 0.1;
        const MARKER_MIN_CONFIDENCE: f32 = 0.7;
        let high_quality: Vec<&DetectedObject> = objects
            .iter()
            .filter(|o| o.confidence >= MARKER_MIN_CONFIDENCE)
            .collect();
        for i in 0..high_quality.len() {
            for j in (i + 1)..high_quality.len() {
                let d = crate::geometry::distance_points(&high_quality[i].centroid, &high_quality[j].centroid);
                if d <= MARKER_PAIR_MAX_DIST {
                    let midpoint = (
                        (high_quality[i].centroid.0 + high_quality[j].centroid.0) / 2.0,
                        (high_quality[i].centroid.1 + high_quality[j].centroid.1) / 2.0,
                    );
                    reg.markers.entry(device_name.to_string()).or_default().push(midpoint);
                }
            }
        }
    }

    /// Solve a 2D rigid transform between each pair of devices using
    /// best-fit marker correspondence, writing the result into each
    /// device's pose. Minimises sum-of-squared residuals over one
    /// rotation parameter per device, holding one reference device
    /// fixed.
    pub fn solve_registration(&mut self) {
        let Some(reg) = self.registration.take() else {
            return;
        };
        let mut device_names: Vec<&String> = reg.markers.keys().collect();
        device_names.sort();
        let Some((reference, rest)) = device_names.split_first() else {
            return;
        };
        let reference_markers = reg.markers[*reference].clone();
        if reference_markers.is_empty() {
            warn!("registration: reference device {} found no markers", reference);
            return;
        }

        for other in rest {
            let other_markers = &reg.markers[*other];
            let n = reference_markers.len().min(other_markers.len());
            if n == 0 {
                continue;
            }
            let (rotation, tx, ty) = best_fit_rigid_transform(&reference_markers[..n], &other_markers[..n]);
            self.with_core(other, |core| {
                core.pose = crate::geometry::Pose::new(tx, ty, rotation);
            });
            info!(
                "registration: solved pose for {} relative to {} (rot={:.3} rad, t=({:.3},{:.3}))",
                other, reference, rotation, tx, ty
            );
        }
    }
}

fn trace_no_data(_name: &str) {
    // grab_frame returning NoData/Timeout on a non-blocking poll is
    // the expected steady state between scans, not worth a log line.
}

struct Registration {
    started_at: std::time::Instant,
    duration: Duration,
    markers: HashMap<String, Vec<Point2D>>,
}

/// Minimise sum-of-squared residuals over a single rotation + the
/// induced translation that best aligns `from` onto `to`, via the
/// closed-form Kabsch/Procrustes solution for 2D point sets.
fn best_fit_rigid_transform(to: &[Point2D], from: &[Point2D]) -> (f32, f32, f32) {
    let n = to.len() as f32;
    let (to_cx, to_cy) = to.iter().fold((0.0, 0.0), |a, p| (a.0 + p.0, a.1 + p.1));
    let (from_cx, from_cy) = from.iter().fold((0.0, 0.0), |a, p| (a.0 + p.0, a.1 + p.1));
    let (to_cx, to_cy) = (to_cx / n, to_cy / n);
    let (from_cx, from_cy) = (from_cx / n, from_cy / n);

    let mut s_xy = 0.0f32;
    let mut s_xx_yy = 0.0f32;
    for i in 0..to.len() {
        let (ax, ay) = (from[i].0 - from_cx, from[i].1 - from_cy);
        let (bx, by) = (to[i].0 - to_cx, to[i].1 - to_cy);
        s_xy += ax * by - ay * bx;
        s_xx_yy += ax * bx + ay * by;
    }
    let rotation = s_xy.atan2(s_xx_yy);
    let (sin, cos) = rotation.sin_cos();
    let rotated_from_centroid = (from_cx * cos - from_cy * sin, from_cx * sin + from_cy * cos);
    let tx = to_cx - rotated_from_centroid.0;
    let ty = to_cy - rotated_from_centroid.1;
    (rotation, tx, ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_device_names_is_union_of_selected_groups() {
        let mut set = DeviceSet::new();
        set.groups.insert("a".into(), ["d1".into()].into_iter().collect());
        set.groups.insert("b".into(), ["d2".into()].into_iter().collect());
        set.activate_group("a");
        set.activate_group("b");
        let mut names: Vec<String> = set.active_device_names().into_iter().collect();
        names.sort();
        assert_eq!(names, vec!["d1".to_string(), "d2".to_string()]);
    }

    #[test]
    fn no_active_groups_means_every_device_is_active() {
        let mut set = DeviceSet::new();
        set.entries.insert(
            "solo".into(),
            Entry {
                driver: Box::new(crate::sensor::FileDriver::new("/dev/null")),
                core: Mutex::new(DeviceCore::new("solo", Default::default(), Default::default())),
            },
        );
        assert_eq!(set.active_device_names(), ["solo".to_string()].into_iter().collect());
    }

    #[test]
    fn best_fit_transform_recovers_known_rotation_and_translation() {
        let rotation = 0.3f32;
        let (sin, cos) = rotation.sin_cos();
        let tx = 1.5f32;
        let ty = -0.5f32;
        let from = vec![(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)];
        let to: Vec<Point2D> = from
            .iter()
            .map(|&(x, y)| (x * cos - y * sin + tx, x * sin + y * cos + ty))
            .collect();
        let (r, solved_tx, solved_ty) = best_fit_rigid_transform(&to, &from);
        assert!((r - rotation).abs() < 1e-3);
        assert!((solved_tx - tx).abs() < 1e-3);
        assert!((solved_ty - ty).abs() < 1e-3);
    }
}
