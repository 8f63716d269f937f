//! `ObserverPipeline` (component C3): fan-out of observers, each
//! filtering tracked objects against a set of bound regions and
//! emitting events to a sink. This is where the per-region
//! `ObservedObjects` table actually lives (owned by the observer that
//! binds to the region, not by the region itself).

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::region::{RegionBinding, RegionModel};
use crate::tracker::{Classification, OcclusionMap, Trackable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Enter,
    Move,
    Leave,
    Invalid,
}

/// Snapshot of a `Trackable` inside one region's table, augmented with
/// per-region lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedObject {
    pub id: u64,
    pub uuid: Uuid,
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub status: Status,
    pub region_entered_ms: u64,
    pub last_touched_ms: u64,
    pub immobile: bool,
}

/// One bound region's table, plus the implicit whole-world table that
/// every observer also maintains.
#[derive(Debug, Clone, Default)]
struct ObjectTable {
    rows: HashMap<u64, ObservedObject>,
}

impl ObjectTable {
    fn mark_all_invalid(&mut self) {
        for row in self.rows.values_mut() {
            row.status = Status::Invalid;
        }
    }

    fn upsert(&mut self, t: &Trackable, now_ms: u64) {
        match self.rows.get_mut(&t.id) {
            Some(row) => {
                row.x = t.position.0;
                row.y = t.position.1;
                row.size = t.size;
                row.status = Status::Move;
                row.last_touched_ms = now_ms;
                row.immobile = t.flags.immobile;
            }
            None => {
                self.rows.insert(
                    t.id,
                    ObservedObject {
                        id: t.id,
                        uuid: t.uuid,
                        x: t.position.0,
                        y: t.position.1,
                        size: t.size,
                        status: Status::Enter,
                        region_entered_ms: now_ms,
                        last_touched_ms: now_ms,
                        immobile: t.flags.immobile,
                    },
                );
            }
        }
    }

    /// Rows that stayed `Invalid` from the previous mark-all-invalid
    /// transition to `Leave` for exactly one emission, then drop.
    fn retire_invalid(&mut self) -> Vec<ObservedObject> {
        let mut left = Vec::new();
        self.rows.retain(|_, row| {
            if row.status == Status::Invalid {
                row.status = Status::Leave;
                left.push(row.clone());
                false
            } else {
                true
            }
        });
        left
    }

    fn active_rows(&self) -> impl Iterator<Item = &ObservedObject> {
        self.rows.values().filter(|r| r.status != Status::Invalid)
    }
}

/// Which attributes a sink emits, and under what renamed key. Parsed
/// from a comma-separated field-token list; `name=alias` renames.
#[derive(Debug, Clone)]
pub struct Filter {
    /// (field name, emitted key)
    pub fields: Vec<(String, String)>,
}

pub const FILTER_FIELDS: &[&str] = &["x", "y", "z", "size", "id", "uuid", "region", "count", "action"];

impl Filter {
    pub fn parse(spec: &str) -> Filter {
        let fields = spec
            .split(',')
            .map(|tok| tok.trim())
            .filter(|tok| !tok.is_empty())
            .map(|tok| match tok.split_once('=') {
                Some((name, alias)) => (name.to_string(), alias.to_string()),
                None => (tok.to_string(), tok.to_string()),
            })
            .collect();
        Filter { fields }
    }

    /// Renders one region row as `key=value` pairs in filter order.
    pub fn render(&self, region: &str, action: &str, row: &ObservedObject, count: usize) -> String {
        self.fields
            .iter()
            .filter_map(|(field, alias)| {
                let value = match field.as_str() {
                    "x" => row.x.to_string(),
                    "y" => row.y.to_string(),
                    "z" => "0".to_string(),
                    "size" => row.size.to_string(),
                    "id" => row.id.to_string(),
                    "uuid" => row.uuid.to_string(),
                    "region" => region.to_string(),
                    "count" => count.to_string(),
                    "action" => action.to_string(),
                    _ => return None,
                };
                Some(format!("{}={}", alias, value))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Structured args for a spawned notification/failure-report script,
/// in place of an ad-hoc shell-out, so tests can inject a spy runner.
pub trait CommandRunner: Send {
    fn run(&self, program: &str, args: &[String]);
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) {
        if let Err(e) = Command::new(program).args(args).spawn() {
            warn!("bash sink: failed to spawn {}: {}", program, e);
        }
    }
}

pub enum Sink {
    File { path: PathBuf },
    PackedFile { writer: crate::recorder::Writer },
    Bash { script: String, runner: Box<dyn CommandRunner> },
    /// Stand-ins for message-bus/OSC/WebSocket/InfluxDB sinks, whose
    /// vendor integration is external: formats the line-protocol or
    /// template text it would send and logs it instead of opening a
    /// socket.
    Udp { scheme: String },
    WebSocket { scheme: String },
    InfluxDb { measurement: String },
    HeatMap { image_path: PathBuf, image: image::GrayImage, pixels_per_metre: f32, flush_every_n_frames: u32, frame_counter: u32 },
    FlowMap { image_path: PathBuf, image: image::GrayImage, pixels_per_metre: f32, last_positions: HashMap<u64, (f32, f32)>, flush_every_n_frames: u32, frame_counter: u32 },
    TraceMap { image_path: PathBuf, image: image::RgbImage, pixels_per_metre: f32, flush_every_n_frames: u32, frame_counter: u32 },
    Eval { bins: HashMap<u8, u64>, out_path: PathBuf },
}

impl Sink {
    fn emit_line(&mut self, line: &str) {
        match self {
            Sink::File { path } => {
                if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    let _ = writeln!(f, "{}", line);
                }
            }
            Sink::Udp { scheme } | Sink::WebSocket { scheme } => {
                warn!("{} sink (external, not wired): would send \"{}\"", scheme, line);
            }
            _ => {}
        }
    }

    fn emit_packed(&mut self, kind: crate::recorder::RecordKind, rows: &[ObservedObject], now_ms: u64) {
        if let Sink::PackedFile { writer } = self {
            let _ = match kind {
                crate::recorder::RecordKind::Start => writer.write_start(now_ms),
                crate::recorder::RecordKind::Stop => writer.write_stop(now_ms),
                crate::recorder::RecordKind::Frame => writer.write_frame(now_ms, rows),
            };
        }
    }

    fn paint_heatmap(&mut self, rows: &[ObservedObject]) {
        if let Sink::HeatMap { image, pixels_per_metre, frame_counter, image_path, flush_every_n_frames, .. } = self {
            let ppm = *pixels_per_metre;
            let (w, h) = image.dimensions();
            for r in rows {
                if let Some((px, py)) = Self::world_to_pixel_static(ppm, (w, h), (r.x, r.y)) {
                    const RADIUS: i32 = 6;
                    for dy in -RADIUS..=RADIUS {
                        for dx in -RADIUS..=RADIUS {
                            let d2 = dx * dx + dy * dy;
                            if d2 > RADIUS * RADIUS {
                                continue;
                            }
                            let gauss = (-(d2 as f32) / (2.0 * (RADIUS as f32 / 2.0).powi(2))).exp();
                            let (ix, iy) = (px as i32 + dx, py as i32 + dy);
                            if ix < 0 || iy < 0 || ix >= w as i32 || iy >= h as i32 {
                                continue;
                            }
                            let pixel = image.get_pixel_mut(ix as u32, iy as u32);
                            let add = (gauss * 24.0) as u16;
                            pixel[0] = pixel[0].saturating_add(add as u8);
                        }
                    }
                }
            }
            *frame_counter += 1;
            if *frame_counter >= *flush_every_n_frames {
                *frame_counter = 0;
                if let Err(e) = image.save(image_path) {
                    warn!("heatmap sink: failed to flush {}: {}", image_path.display(), e);
                }
            }
        }
    }

    fn world_to_pixel_static(ppm: f32, (w, h): (u32, u32), (x, y): (f32, f32)) -> Option<(u32, u32)> {
        let px = (x * ppm + w as f32 / 2.0) as i64;
        let py = (y * ppm + h as f32 / 2.0) as i64;
        if px < 0 || py < 0 || px >= w as i64 || py >= h as i64 {
            return None;
        }
        Some((px as u32, py as u32))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub name: String,
    pub filter: String,
    pub region_binding: String,
    pub max_fps: f32,
    pub is_threaded: bool,
    /// Time-of-day window the observer is active in, `(start_hour,
    /// end_hour)` in `[0,24)`; `None` means always active.
    pub valid_hours: Option<(u8, u8)>,
    pub drop_private: bool,
    pub drop_immobile: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            name: String::new(),
            filter: "action,id,x,y".to_string(),
            region_binding: "all".to_string(),
            max_fps: 10.0,
            is_threaded: false,
            valid_hours: None,
            drop_private: false,
            drop_immobile: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverLifecycle {
    Created,
    Started,
    Stopped,
}

pub struct Observer {
    pub config: ObserverConfig,
    filter: Filter,
    binding: RegionBinding,
    sink: Sink,
    lifecycle: ObserverLifecycle,
    last_report_ms: u64,
    /// One table per matched region, keyed by region name, plus the
    /// implicit whole-world table under the empty string key.
    rects: HashMap<String, ObjectTable>,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl Observer {
    pub fn new(config: ObserverConfig, sink: Sink) -> Self {
        let filter = Filter::parse(&config.filter);
        let binding = RegionBinding::parse(&config.region_binding);
        Observer {
            config,
            filter,
            binding,
            sink,
            lifecycle: ObserverLifecycle::Created,
            last_report_ms: 0,
            rects: HashMap::new(),
        }
    }

    pub fn start(&mut self) {
        self.lifecycle = ObserverLifecycle::Started;
        self.sink.emit_packed(crate::recorder::RecordKind::Start, &[], now_ms());
    }

    pub fn stop(&mut self) {
        self.lifecycle = ObserverLifecycle::Stopped;
        self.sink.emit_packed(crate::recorder::RecordKind::Stop, &[], now_ms());
    }

    fn in_valid_hours(&self, now_ms: u64) -> bool {
        let Some((start, end)) = self.config.valid_hours else {
            return true;
        };
        let hour = ((now_ms / 3_600_000) % 24) as u8;
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    /// The main per-frame step. Enforces invariant I3 (never called
    /// outside `Started`), rate-limits, then runs the mark/upsert/
    /// emit cycle described for the pipeline.
    pub fn observe(&mut self, trackables: &[Trackable], regions: &RegionModel, occlusion: Option<&OcclusionMap>) -> Result<(), PipelineError> {
        if self.lifecycle != ObserverLifecycle::Started {
            return Err(PipelineError::MalformedFrame("observe called outside Started lifecycle".to_string()));
        }

        let now = now_ms();
        if !self.in_valid_hours(now) {
            return Ok(());
        }
        if self.config.max_fps <= 0.0 {
            return Err(PipelineError::MalformedFrame("maxFPS must be > 0".to_string()));
        }
        let min_interval = (1000.0 / self.config.max_fps) as u64;
        if now.saturating_sub(self.last_report_ms) < min_interval {
            return Ok(());
        }
        self.last_report_ms = now;

        let matched_regions = regions.resolve(&self.binding.token_list);
        let table_keys: Vec<String> = match &self.binding.unite_rule {
            Some(rule) => vec![rule.clone()],
            None => {
                let mut keys = matched_regions.clone();
                keys.push(String::new()); // implicit whole-world table
                keys
            }
        };

        for key in &table_keys {
            self.rects.entry(key.clone()).or_default().mark_all_invalid();
        }

        for t in trackables {
            if self.config.drop_private && t.flags.private {
                continue;
            }
            if self.config.drop_immobile && t.flags.immobile {
                continue;
            }
            if let Some(map) = occlusion {
                if matches!(map.classify(t.position), Classification::Occluded) {
                    continue;
                }
            }

            // Whole-world table always sees every admitted Trackable.
            self.rects.entry(String::new()).or_default().upsert(t, now);

            if let Some(rule) = &self.binding.unite_rule {
                let in_any = matched_regions.iter().any(|name| {
                    regions.by_name(name).map(|r| r.contains(t.position)).unwrap_or(false)
                });
                if in_any {
                    self.rects.entry(rule.clone()).or_default().upsert(t, now);
                }
                continue;
            }

            for name in &matched_regions {
                if regions.by_name(name).map(|r| r.contains(t.position)).unwrap_or(false) {
                    self.rects.entry(name.clone()).or_default().upsert(t, now);
                }
            }
        }

        for key in &table_keys {
            let table = self.rects.entry(key.clone()).or_default();
            let active: Vec<ObservedObject> = table.active_rows().cloned().collect();
            let leaving = table.retire_invalid();

            let region_label = if key.is_empty() { "world" } else { key.as_str() };
            let count = active.len();

            for row in active.iter().filter(|r| r.status == Status::Enter || r.status == Status::Move) {
                let action = if row.status == Status::Enter { "Enter" } else { "Move" };
                let line = self.filter.render(region_label, action, row, count);
                self.sink.emit_line(&line);
            }
            for row in &leaving {
                let line = self.filter.render(region_label, "Leave", row, count);
                self.sink.emit_line(&line);
            }

            let mut combined: Vec<ObservedObject> = active;
            combined.extend(leaving);
            self.sink.emit_packed(crate::recorder::RecordKind::Frame, &combined, now);
            self.sink.paint_heatmap(&combined);
        }

        Ok(())
    }

    pub fn count_in(&self, region: &str) -> usize {
        self.rects
            .get(region)
            .map(|t| t.active_rows().filter(|r| r.status == Status::Enter || r.status == Status::Move).count())
            .unwrap_or(0)
    }
}

pub struct ObserverPipeline {
    observers: HashMap<String, Observer>,
}

impl Default for ObserverPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverPipeline {
    pub fn new() -> Self {
        ObserverPipeline { observers: HashMap::new() }
    }

    pub fn add(&mut self, observer: Observer) {
        self.observers.insert(observer.config.name.clone(), observer);
    }

    pub fn start_all(&mut self) {
        for o in self.observers.values_mut() {
            o.start();
        }
    }

    pub fn stop_all(&mut self) {
        for o in self.observers.values_mut() {
            o.stop();
        }
    }

    pub fn observe_all(&mut self, trackables: &[Trackable], regions: &RegionModel, occlusion: Option<&OcclusionMap>) {
        for (name, o) in self.observers.iter_mut() {
            if let Err(e) = o.observe(trackables, regions, occlusion) {
                error!("observer {}: disabling after error: {}", name, e);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Observer> {
        self.observers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{Region, Shape};
    use crate::tracker::TrackableFlags;
    use tempfile::tempdir;

    fn trackable(id: u64, x: f32, y: f32) -> Trackable {
        Trackable {
            id,
            uuid: Uuid::new_v4(),
            position: (x, y),
            size: 0.4,
            confidence: 0.9,
            first_seen_ms: 0,
            last_touched_ms: 0,
            motion: (0.0, 0.0),
            predicted_position: (x, y),
            flags: TrackableFlags::default(),
            immobile_anchor: (x, y),
            immobile_anchor_ms: 0,
        }
    }

    fn single_region_model() -> RegionModel {
        RegionModel::new(vec![Region {
            name: "r".to_string(),
            tags: vec![],
            layers: vec![],
            x: -1.0,
            y: -1.0,
            w: 2.0,
            h: 2.0,
            shape: Shape::Rectangle,
            edge: None,
            invert: false,
        }])
    }

    #[test]
    fn filter_parses_rename_tokens() {
        let f = Filter::parse("action,id,x=posX,y=posY");
        assert_eq!(f.fields[2], ("x".to_string(), "posX".to_string()));
    }

    #[test]
    fn scenario_s1_single_object_enter_move_leave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut observer = Observer::new(
            ObserverConfig {
                name: "o".to_string(),
                filter: "action,id,x,y".to_string(),
                region_binding: "all".to_string(),
                max_fps: 1000.0,
                ..Default::default()
            },
            Sink::File { path: path.clone() },
        );
        observer.start();
        let regions = single_region_model();

        for _ in 0..5 {
            observer.observe(&[trackable(1, 0.5, 0.0)], &regions, None).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        observer.observe(&[], &regions, None).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines[0].contains("Enter"));
        assert!(lines.last().unwrap().contains("Leave"));
    }

    #[test]
    fn rate_limiting_drops_observe_calls_below_the_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut observer = Observer::new(
            ObserverConfig {
                name: "o".to_string(),
                filter: "action,id".to_string(),
                region_binding: "all".to_string(),
                max_fps: 1.0,
                ..Default::default()
            },
            Sink::File { path: path.clone() },
        );
        observer.start();
        let regions = single_region_model();
        observer.observe(&[trackable(1, 0.5, 0.0)], &regions, None).unwrap();
        observer.observe(&[trackable(1, 0.5, 0.0)], &regions, None).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1, "second call within the 1000ms window should be a no-op");
    }

    #[test]
    fn observe_before_start_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut observer = Observer::new(ObserverConfig::default(), Sink::File { path });
        let regions = single_region_model();
        assert!(observer.observe(&[], &regions, None).is_err());
    }

    #[test]
    fn zero_max_fps_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut observer = Observer::new(
            ObserverConfig { max_fps: 0.0, ..Default::default() },
            Sink::File { path },
        );
        observer.start();
        let regions = single_region_model();
        assert!(observer.observe(&[], &regions, None).is_err());
    }
}
