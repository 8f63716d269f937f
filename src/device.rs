//! `DeviceCore`: per-sensor environment model, foreground extraction,
//! temporal denoise, object segmentation and the affine pose that
//! places a sensor's samples into the world frame. This is the single
//! biggest subsystem and the one everything else in the engine is
//! downstream of.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PipelineError;
use crate::geometry::{distance, distance_points, Pose};
use crate::sample::{bucket_centre_angle, bucket_index, RawFrame, Sample, NUM_SAMPLES};
use crate::Point2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    PoweringUp,
    Acquiring,
    EnvScanning,
    /// IOError with a recent open; automatic reopen is attempted after
    /// `reopen_after_ms`.
    ReopenPending,
}

/// Per-bucket background distance model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnvBucket {
    pub distance: f32,
    pub quality: i32,
    pub last_update_ms: u64,
    pub populated: bool,
}

impl Default for EnvBucket {
    fn default() -> Self {
        EnvBucket {
            distance: 0.0,
            quality: 0,
            last_update_ms: 0,
            populated: false,
        }
    }
}

/// Fixed-length (`NUM_SAMPLES`) background model, one `EnvBucket` per
/// angle bucket.
#[derive(Clone, Serialize, Deserialize)]
pub struct EnvironmentModel {
    pub buckets: Vec<EnvBucket>,
}

impl Default for EnvironmentModel {
    fn default() -> Self {
        EnvironmentModel {
            buckets: vec![EnvBucket::default(); NUM_SAMPLES],
        }
    }
}

impl EnvironmentModel {
    /// Fraction of buckets with any learned background at all.
    pub fn coverage(&self) -> f32 {
        self.buckets.iter().filter(|b| b.populated).count() as f32 / NUM_SAMPLES as f32
    }

    /// `readEnv`: envs with less than 50% of buckets populated are
    /// rejected.
    pub fn validate_for_read(&self) -> Result<(), PipelineError> {
        if self.coverage() < 0.5 {
            return Err(PipelineError::SparseEnvironment);
        }
        Ok(())
    }

    /// Erode then smooth by `k` neighbours to suppress speckle, called
    /// once an env-scan completes.
    pub fn erode_and_smooth(&mut self, k: usize) {
        // Erosion: a populated bucket with an unpopulated neighbour
        // within k is itself marked unpopulated (removes thin spurs).
        let snapshot = self.buckets.clone();
        for i in 0..NUM_SAMPLES {
            if !snapshot[i].populated {
                continue;
            }
            let has_gap = (1..=k).any(|d| {
                let lo = (i + NUM_SAMPLES - d) % NUM_SAMPLES;
                let hi = (i + d) % NUM_SAMPLES;
                !snapshot[lo].populated || !snapshot[hi].populated
            });
            if has_gap {
                self.buckets[i].populated = false;
            }
        }

        // Smoothing: average distance over a window of 2k+1 populated
        // neighbours.
        let eroded = self.buckets.clone();
        for i in 0..NUM_SAMPLES {
            if !eroded[i].populated {
                continue;
            }
            let mut sum = 0.0f32;
            let mut count = 0;
            for d in -(k as isize)..=(k as isize) {
                let idx = ((i as isize + d).rem_euclid(NUM_SAMPLES as isize)) as usize;
                if eroded[idx].populated {
                    sum += eroded[idx].distance;
                    count += 1;
                }
            }
            if count > 0 {
                self.buckets[i].distance = sum / count as f32;
            }
        }
    }
}

/// Tunable thresholds for one `DeviceCore`'s pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Metres; `<= 0` disables env subtraction entirely.
    pub env_threshold: f32,
    /// Minimum run length, in buckets, to open a candidate object.
    pub min_run_samples: usize,
    /// Metres; an internal gap bigger than this splits a run in two.
    pub split_distance: f32,
    /// Width, in buckets, of background neighbourhood required to
    /// close a run.
    pub close_background_width: usize,
    pub min_person_m: f32,
    pub max_person_m: f32,
    /// How many prior frames' foreground state to keep for temporal
    /// denoise.
    pub temporal_denoise_frames: usize,
    /// `None` disables adaptation.
    pub adaptation_time_constant_ms: Option<f32>,
    /// Confidence blend weight (alpha = 0.4).
    pub confidence_alpha: f32,
    pub reopen_after_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            env_threshold: 0.15,
            min_run_samples: 2,
            split_distance: 0.3,
            close_background_width: 2,
            min_person_m: 0.15,
            max_person_m: 0.8,
            temporal_denoise_frames: 2,
            adaptation_time_constant_ms: None,
            confidence_alpha: 0.4,
            reopen_after_ms: 2000,
        }
    }
}

/// One contiguous run of foreground samples, valid only for the
/// frame it was produced from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedObject {
    pub first_sample_index: usize,
    pub last_sample_index: usize,
    /// Chord length between the run's first and last sample, metres.
    pub extent: f32,
    pub closest_range: f32,
    /// Centroid in the device's own Cartesian frame.
    pub centroid: Point2D,
    /// Unit normal, radial from the sensor.
    pub normal: Point2D,
    pub person_score: f32,
    pub curvature_score: f32,
    pub confidence: f32,
    /// Set when this run was produced by splitting a longer one on an
    /// internal gap.
    pub is_split: bool,
    pub timestamp_ms: u64,
}

struct Run {
    indices: Vec<usize>,
    points: Vec<Point2D>,
    background_run: usize,
    is_split: bool,
}

/// Triangular kernel over `[min, max]`, peaking at the midpoint.
fn triangular_kernel(value: f32, min: f32, max: f32) -> f32 {
    if value <= min || value >= max {
        return 0.0;
    }
    let mid = (min + max) / 2.0;
    if value <= mid {
        (value - min) / (mid - min)
    } else {
        (max - value) / (max - mid)
    }
}

/// Discrete second derivative of adjacent positions, scaled to `[0,1]`.
fn curvature_score(points: &[Point2D]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut count = 0;
    for w in points.windows(3) {
        let (ax, ay) = w[0];
        let (bx, by) = w[1];
        let (cx, cy) = w[2];
        let ddx = ax - 2.0 * bx + cx;
        let ddy = ay - 2.0 * by + cy;
        total += (ddx * ddx + ddy * ddy).sqrt();
        count += 1;
    }
    let mean = total / count as f32;
    // Squash into [0,1]; curvature has no natural upper bound, 1m of
    // second-derivative magnitude saturates the score.
    (mean).min(1.0)
}

pub struct DeviceCore {
    pub name: String,
    pub config: DeviceConfig,
    pub pose: Pose,
    state: DeviceState,
    env: EnvironmentModel,
    env_scan_accumulator: Option<Vec<(f32, i32, usize)>>, // (min-distance, quality, sample count)
    foreground_history: std::collections::VecDeque<Vec<bool>>,
    last_error_at_ms: Option<u64>,
    pub last_seen_ms: u64,
    pub frame_count: u64,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl DeviceCore {
    pub fn new(name: impl Into<String>, config: DeviceConfig, pose: Pose) -> Self {
        DeviceCore {
            name: name.into(),
            config,
            pose,
            state: DeviceState::Closed,
            env: EnvironmentModel::default(),
            env_scan_accumulator: None,
            foreground_history: std::collections::VecDeque::new(),
            last_error_at_ms: None,
            last_seen_ms: 0,
            frame_count: 0,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn open(&mut self) {
        self.state = DeviceState::PoweringUp;
    }

    pub fn finish_power_up(&mut self) {
        if self.state == DeviceState::PoweringUp {
            self.state = DeviceState::Acquiring;
        }
    }

    pub fn start_env_scan(&mut self) {
        self.state = DeviceState::EnvScanning;
        self.env_scan_accumulator = Some(vec![(f32::MAX, 0, 0); NUM_SAMPLES]);
    }

    pub fn finish_env_scan(&mut self) {
        if let Some(acc) = self.env_scan_accumulator.take() {
            for (i, (min_dist, quality, count)) in acc.into_iter().enumerate() {
                if count > 0 {
                    self.env.buckets[i] = EnvBucket {
                        distance: min_dist,
                        quality,
                        last_update_ms: now_ms(),
                        populated: true,
                    };
                }
            }
            self.env.erode_and_smooth(self.config.close_background_width);
        }
        self.state = DeviceState::Acquiring;
    }

    pub fn stop(&mut self) {
        self.state = DeviceState::Closed;
    }

    /// Called when the driver reports an IO error; does not tear down
    /// the pipeline.
    pub fn mark_io_error(&mut self) {
        self.state = DeviceState::ReopenPending;
        self.last_error_at_ms = Some(now_ms());
    }

    pub fn should_attempt_reopen(&self) -> bool {
        match (self.state, self.last_error_at_ms) {
            (DeviceState::ReopenPending, Some(t)) => {
                now_ms().saturating_sub(t) >= self.config.reopen_after_ms
            }
            _ => false,
        }
    }

    pub fn env(&self) -> &EnvironmentModel {
        &self.env
    }

    /// Main per-frame pipeline. Returns the frame's
    /// DetectedObjects in the device's own frame. `active_world_positions`
    /// is the previous tick's Trackable positions in world coordinates,
    /// used only to steer environment adaptation away from occupied
    /// ground.
    pub fn ingest_frame(&mut self, frame: &RawFrame, active_world_positions: &[Point2D]) -> Result<Vec<DetectedObject>, PipelineError> {
        if self.state == DeviceState::EnvScanning {
            // Frames arriving while env-scanning are discarded from
            // object detection, but still accumulated for the env.
            self.accumulate_env(frame);
            return Ok(Vec::new());
        }
        if self.state != DeviceState::Acquiring {
            return Ok(Vec::new());
        }

        self.last_seen_ms = frame.timestamp_ms;
        self.frame_count += 1;

        let bucketed = self.bucket_samples(frame);
        let foreground = self.foreground_test(&bucketed);
        let denoised = self.temporal_denoise(foreground);
        let runs = self.segment(&bucketed, &denoised);
        let objects = runs
            .into_iter()
            .map(|r| self.summarise_run(r, frame.timestamp_ms))
            .collect::<Vec<_>>();

        if self.config.adaptation_time_constant_ms.is_some() {
            let active_device_positions: Vec<Point2D> =
                active_world_positions.iter().map(|&p| self.pose.to_device(p)).collect();
            self.adapt(&bucketed, &denoised, &active_device_positions);
        }

        Ok(objects)
    }

    fn accumulate_env(&mut self, frame: &RawFrame) {
        let Some(acc) = self.env_scan_accumulator.as_mut() else {
            return;
        };
        for s in &frame.samples {
            if !s.is_valid() {
                continue;
            }
            let idx = bucket_index(s.angle);
            let (min_dist, quality, count) = &mut acc[idx];
            if s.distance < *min_dist {
                *min_dist = s.distance;
            }
            *quality = s.quality;
            *count += 1;
        }
    }

    /// Step 1: bucket samples into a fixed-size ring by angle index.
    fn bucket_samples(&self, frame: &RawFrame) -> Vec<Option<Sample>> {
        let mut ring: Vec<Option<Sample>> = vec![None; NUM_SAMPLES];
        for s in &frame.samples {
            let idx = bucket_index(s.angle);
            ring[idx] = Some(*s);
        }
        ring
    }

    /// Step 3: a sample is foreground iff it is valid and
    /// `(env.distance - sample.distance) > envThreshold`, OR the env
    /// bucket is invalid (nothing learned).
    fn foreground_test(&self, bucketed: &[Option<Sample>]) -> Vec<bool> {
        (0..NUM_SAMPLES)
            .map(|i| match bucketed[i] {
                None => false,
                Some(s) if !s.is_valid() => false,
                Some(s) => {
                    let env_bucket = &self.env.buckets[i];
                    if self.config.env_threshold <= 0.0 {
                        // Subtraction disabled: every valid sample is
                        // "foreground" from the env's point of view.
                        true
                    } else if !env_bucket.populated {
                        true
                    } else {
                        (env_bucket.distance - s.distance) > self.config.env_threshold
                    }
                }
            })
            .collect()
    }

    /// Step 4: suppress one-frame isolated foreground pixels (all
    /// neighbours in the previous N frames were background).
    fn temporal_denoise(&mut self, foreground: Vec<bool>) -> Vec<bool> {
        let n = self.config.temporal_denoise_frames;
        let denoised = if n == 0 || self.foreground_history.is_empty() {
            foreground.clone()
        } else {
            (0..NUM_SAMPLES)
                .map(|i| {
                    if !foreground[i] {
                        return false;
                    }
                    let was_always_background = self
                        .foreground_history
                        .iter()
                        .all(|hist| !hist[i]);
                    let neighbour_supported = (i > 0 && foreground[i - 1])
                        || (i + 1 < NUM_SAMPLES && foreground[i + 1]);
                    !(was_always_background && !neighbour_supported)
                })
                .collect()
        };

        self.foreground_history.push_back(foreground);
        while self.foreground_history.len() > n.max(1) {
            self.foreground_history.pop_front();
        }
        denoised
    }

    /// Step 5: sweep buckets angularly, segmenting runs.
    fn segment(&self, bucketed: &[Option<Sample>], foreground: &[bool]) -> Vec<Run> {
        let mut runs = Vec::new();
        let mut current: Option<Run> = None;

        for i in 0..NUM_SAMPLES {
            let is_fg = foreground[i];
            match (&mut current, is_fg, bucketed[i]) {
                (None, true, Some(s)) => {
                    current = Some(Run {
                        indices: vec![i],
                        points: vec![s.to_cartesian()],
                        background_run: 0,
                        is_split: false,
                    });
                }
                (Some(run), true, Some(s)) => {
                    let point = s.to_cartesian();
                    let gap = run
                        .points
                        .last()
                        .map(|p| distance_points(p, &point))
                        .unwrap_or(0.0);
                    if gap > self.config.split_distance {
                        // Close the current run (split) and start a
                        // fresh one, both flagged as split.
                        run.is_split = true;
                        runs.push(current.take().unwrap());
                        current = Some(Run {
                            indices: vec![i],
                            points: vec![point],
                            background_run: 0,
                            is_split: true,
                        });
                    } else {
                        run.indices.push(i);
                        run.points.push(point);
                        run.background_run = 0;
                    }
                }
                (Some(run), _, _) => {
                    run.background_run += 1;
                    if run.background_run >= self.config.close_background_width {
                        if run.indices.len() >= self.config.min_run_samples {
                            runs.push(current.take().unwrap());
                        } else {
                            current = None;
                        }
                    }
                }
                (None, _, _) => {}
            }
        }
        if let Some(run) = current {
            if run.indices.len() >= self.config.min_run_samples {
                runs.push(run);
            }
        }
        runs
    }

    /// Step 6: compute per-object stats.
    fn summarise_run(&self, run: Run, timestamp_ms: u64) -> DetectedObject {
        let first = *run.indices.first().unwrap();
        let last = *run.indices.last().unwrap();
        let extent = distance_points(run.points.first().unwrap(), run.points.last().unwrap());
        let closest_range = run
            .points
            .iter()
            .map(|p| distance(0.0, 0.0, p.0, p.1))
            .fold(f32::MAX, f32::min);
        let centroid = crate::geometry::centroid(&run.points).unwrap_or((0.0, 0.0));
        let mid_angle = bucket_centre_angle((first + last) / 2);
        let normal = (mid_angle.cos(), mid_angle.sin());
        let person_score = triangular_kernel(extent, self.config.min_person_m, self.config.max_person_m);
        let curvature = curvature_score(&run.points);
        let alpha = self.config.confidence_alpha;
        let confidence = alpha * (person_score + curvature) + (1.0 - alpha) * (person_score * curvature);

        trace!(
            "device {}: run [{},{}] extent={:.3} person={:.2} curvature={:.2} confidence={:.2}",
            self.name, first, last, extent, person_score, curvature, confidence
        );

        DetectedObject {
            first_sample_index: first,
            last_sample_index: last,
            extent,
            closest_range,
            centroid,
            normal,
            person_score,
            curvature_score: curvature,
            confidence,
            is_split: run.is_split,
            timestamp_ms,
        }
    }

    /// Step 7: slowly move environment toward long-standing
    /// foreground; never update buckets covered by active trackables
    /// (`active_world_positions`, already converted to this device's
    /// frame by the caller).
    fn adapt(&mut self, bucketed: &[Option<Sample>], foreground: &[bool], active_device_positions: &[Point2D]) {
        let Some(tc_ms) = self.config.adaptation_time_constant_ms else {
            return;
        };
        let now = now_ms();
        for i in 0..NUM_SAMPLES {
            if foreground[i] {
                continue;
            }
            let Some(sample) = bucketed[i] else { continue };
            if !sample.is_valid() {
                continue;
            }
            let point = sample.to_cartesian();
            if active_device_positions
                .iter()
                .any(|p| distance_points(p, &point) < self.config.split_distance)
            {
                continue;
            }
            let bucket = &mut self.env.buckets[i];
            if !bucket.populated {
                bucket.distance = sample.distance;
                bucket.quality = sample.quality;
                bucket.populated = true;
            } else {
                let dt = (now.saturating_sub(bucket.last_update_ms)) as f32;
                let weight = (dt / tc_ms).min(1.0);
                bucket.distance += (sample.distance - bucket.distance) * weight;
            }
            bucket.last_update_ms = now;
        }
        warn!(
            "device {}: adaptation pass applied ({} active positions excluded)",
            self.name,
            active_device_positions.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::RawFrame;

    fn flat_env(distance: f32) -> EnvironmentModel {
        let mut env = EnvironmentModel::default();
        for b in env.buckets.iter_mut() {
            *b = EnvBucket {
                distance,
                quality: 47,
                last_update_ms: 0,
                populated: true,
            };
        }
        env
    }

    #[test]
    fn env_threshold_zero_disables_subtraction() {
        let mut core = DeviceCore::new("d1", DeviceConfig { env_threshold: 0.0, ..Default::default() }, Pose::default());
        core.env = flat_env(5.0);
        core.open();
        core.finish_power_up();

        let samples = vec![Sample { angle: 0.0, distance: 5.0, quality: 10 }];
        let frame = RawFrame::new(0, 1, samples);
        let objects = core.ingest_frame(&frame, &[]).unwrap();
        // With subtraction disabled every valid sample is foreground,
        // but a single sample run is shorter than min_run_samples, so
        // expect no closed run here -- the important assertion is that
        // this did not panic/err and the env bucket wasn't touched as
        // "background".
        assert!(objects.len() <= 1);
    }

    #[test]
    fn all_invalid_samples_produce_zero_objects() {
        let mut core = DeviceCore::new("d1", DeviceConfig::default(), Pose::default());
        core.open();
        core.finish_power_up();
        let samples: Vec<Sample> = (0..100)
            .map(|i| Sample { angle: i as f32 * 0.01, distance: 0.0, quality: 0 })
            .collect();
        let frame = RawFrame::new(0, 1, samples);
        let objects = core.ingest_frame(&frame, &[]).unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn sparse_env_is_rejected_by_validate_for_read() {
        let env = EnvironmentModel::default();
        assert!(env.validate_for_read().is_err());
    }

    #[test]
    fn foreground_detected_when_closer_than_background_by_more_than_threshold() {
        let mut core = DeviceCore::new(
            "d1",
            DeviceConfig { env_threshold: 0.2, min_run_samples: 1, close_background_width: 1, ..Default::default() },
            Pose::default(),
        );
        core.env = flat_env(5.0);
        core.open();
        core.finish_power_up();

        // A person standing 1m closer than background, a few buckets
        // wide so it clears min_run_samples and closes on background.
        let mut samples = Vec::new();
        for i in 0..5 {
            samples.push(Sample { angle: i as f32 * 0.001, distance: 4.0, quality: 10 });
        }
        let frame = RawFrame::new(0, 1, samples);
        let objects = core.ingest_frame(&frame, &[]).unwrap();
        assert_eq!(objects.len(), 1);
        assert!(objects[0].closest_range < 4.5);
    }
}
