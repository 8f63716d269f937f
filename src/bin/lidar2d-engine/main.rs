use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use lidar2d_engine::cli::{normalize_legacy_tokens, Cli};
use lidar2d_engine::config_store::{ConfigStore, KvMapOfMap};
use lidar2d_engine::device::{DeviceConfig, DeviceCore};
use lidar2d_engine::device_set::DeviceSet;
use lidar2d_engine::engine::{set_verbosity, Engine, Verbosity};
use lidar2d_engine::geometry::Pose;
use lidar2d_engine::observer::{Observer, ObserverConfig, ObserverPipeline, Sink};
use lidar2d_engine::region::{Edge, Region, RegionModel, Shape};
use lidar2d_engine::sensor::{FileDriver, SensorDriver, VirtualDriver};
use lidar2d_engine::tracker::{Tracker, TrackerConfig};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Builds a `Box<dyn SensorDriver>` from a `type:name` CLI token.
/// Local (UART/USB vendor) drivers require real hardware access and
/// are out of scope for this entry point; only `virtual` and `file`
/// are wired here, with `simulated` left for callers that construct
/// an `Engine` directly with a bitmap.
fn build_driver(spec: &str, bind_base_port: &mut u16) -> Result<(String, Box<dyn SensorDriver>)> {
    let (kind, name) = spec.split_once(':').unwrap_or(("virtual", spec));
    let driver: Box<dyn SensorDriver> = match kind {
        "virtual" => {
            let port = *bind_base_port;
            *bind_base_port += 1;
            let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
            Box::new(VirtualDriver::new(addr))
        }
        "file" => Box::new(FileDriver::new(name)),
        other => anyhow::bail!("unsupported device type '{}' for this entry point", other),
    };
    Ok((name.to_string(), driver))
}

fn exit_with(code: i32) -> ! {
    std::process::exit(code);
}

/// Builds a `RegionModel` from `regions.json`'s region name → { x, y,
/// w, h, shape, edge, tags, layers } rows.
fn build_region_model(map: KvMapOfMap) -> RegionModel {
    let mut regions = Vec::with_capacity(map.len());
    for (name, fields) in map {
        let get_f32 = |key: &str| fields.get(key).and_then(|v| v.parse::<f32>().ok()).unwrap_or(0.0);
        let shape = match fields.get("shape").map(String::as_str) {
            Some("ellipse") => Shape::Ellipse,
            _ => Shape::Rectangle,
        };
        let edge = match fields.get("edge").map(String::as_str) {
            Some("top") => Some(Edge::Top),
            Some("bottom") => Some(Edge::Bottom),
            Some("left") => Some(Edge::Left),
            Some("right") => Some(Edge::Right),
            _ => None,
        };
        let split_list = |key: &str| -> Vec<String> {
            fields
                .get(key)
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default()
        };
        regions.push(Region {
            name,
            tags: split_list("tags"),
            layers: split_list("layers"),
            x: get_f32("x"),
            y: get_f32("y"),
            w: get_f32("w"),
            h: get_f32("h"),
            shape,
            edge,
            invert: fields.get("invert").map(String::as_str) == Some("true"),
        });
    }
    RegionModel::new(regions)
}

/// Populates device groups from `groups.json`'s group name → { device
/// name → "true" } rows.
fn apply_groups_config(device_set: &mut DeviceSet, map: KvMapOfMap) {
    for (group, members) in map {
        for (device, enabled) in members {
            if enabled == "true" || enabled == "1" {
                device_set.add_to_group(group.clone(), device);
            }
        }
    }
}

/// Builds the `Observer`s named in `observer.json` that `use_observers`
/// selects (`all` selects every configured observer).
fn build_observers_from_config(map: KvMapOfMap, use_observers: &[String]) -> Vec<Observer> {
    let use_all = use_observers.iter().any(|n| n == "all");
    let mut observers = Vec::new();
    for (name, fields) in map {
        if !use_all && !use_observers.iter().any(|n| n == &name) {
            continue;
        }
        let mut config = ObserverConfig { name: name.clone(), ..ObserverConfig::default() };
        if let Some(v) = fields.get("filter") {
            config.filter = v.clone();
        }
        if let Some(v) = fields.get("regions") {
            config.region_binding = v.clone();
        }
        if let Some(v) = fields.get("maxFps").and_then(|v| v.parse::<f32>().ok()) {
            config.max_fps = v;
        }
        if let Some(v) = fields.get("isThreaded") {
            config.is_threaded = v == "true";
        }
        if let Some(v) = fields.get("dropPrivate") {
            config.drop_private = v == "true";
        }
        if let Some(v) = fields.get("dropImmobile") {
            config.drop_immobile = v == "true";
        }
        let out_path = fields.get("out").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(format!("{}.log", name)));
        observers.push(Observer::new(config, Sink::File { path: out_path }));
    }
    observers
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let raw_args: Vec<String> = std::env::args().collect();
    let normalized = normalize_legacy_tokens(&raw_args);
    let cli = match Cli::try_parse_from(&normalized) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}", e);
            exit_with(1);
        }
    };

    set_verbosity(match cli.verbose.unwrap_or(1) {
        0 => Verbosity::Quiet,
        1 => Verbosity::Normal,
        2 => Verbosity::Verbose,
        _ => Verbosity::Debug,
    });

    if let Err(e) = run(cli) {
        error!("fatal: {:#}", e);
        exit_with(2);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_store = ConfigStore::new(&cli.config_dir);
    if let Some(tag) = &cli.use_checkpoint {
        let dir = config_store
            .resolve_checkpoint(tag)
            .with_context(|| format!("resolving checkpoint '{}'", tag))?;
        info!("using checkpoint directory {}", dir.display());
    }

    let groups_config = config_store.read_map_of_map("groups.json").unwrap_or_else(|e| {
        warn!("groups.json: {}", e);
        KvMapOfMap::new()
    });
    let regions_config = config_store.read_map_of_map("regions.json").unwrap_or_else(|e| {
        warn!("regions.json: {}", e);
        KvMapOfMap::new()
    });
    let observer_config = config_store.read_map_of_map("observer.json").unwrap_or_else(|e| {
        warn!("observer.json: {}", e);
        KvMapOfMap::new()
    });

    let mut device_set = DeviceSet::new();
    device_set.simulation_mode = cli.simulation_mode;
    apply_groups_config(&mut device_set, groups_config);

    let mut bind_port = 17500u16;
    for spec in &cli.devices {
        let (name, driver) = build_driver(spec, &mut bind_port)
            .with_context(|| format!("building device from '{}'", spec))?;
        let mut core = DeviceCore::new(&name, DeviceConfig::default(), Pose::default());
        core.open();
        core.finish_power_up();
        device_set.add_device(name, driver, core);
    }
    for group in &cli.include_groups {
        device_set.activate_group(group);
    }
    for group in &cli.exclude_groups {
        device_set.deactivate_group(group);
    }
    if let Some(ms) = cli.begin_registration_ms {
        info!("starting cross-device pose registration for {} ms", ms);
        device_set.begin_registration(Duration::from_millis(ms));
    }

    if !cli.track {
        info!("--track not set: tracker still runs, since per-device detection always feeds it");
    }
    let tracker = Tracker::new(TrackerConfig::default());

    let regions = build_region_model(regions_config);
    let mut observers = ObserverPipeline::new();
    for observer in build_observers_from_config(observer_config, &cli.use_observers) {
        observers.add(observer);
    }
    for spec in &cli.ad_hoc_observers {
        match parse_ad_hoc_observer(spec) {
            Ok(observer) => observers.add(observer),
            Err(e) => warn!("skipping malformed ad-hoc observer '{}': {}", spec, e),
        }
    }

    let mut engine = ExitHookGuard::new(Engine::new(device_set, tracker, regions, observers, config_store));
    engine.start();

    let target_fps = cli.fps.max(1);
    let frame_period = Duration::from_secs_f64(1.0 / target_fps as f64);
    let run_duration = Duration::from_secs(u64::MAX / 2); // effectively unbounded
    let started = Instant::now();

    loop {
        let tick_start = Instant::now();
        engine.tick(now_ms());

        if started.elapsed() >= run_duration {
            break;
        }
        let elapsed = tick_start.elapsed();
        if elapsed < frame_period {
            std::thread::sleep(frame_period - elapsed);
        }
    }

    Ok(())
}

/// Wraps `Engine` so `ObserverPipeline.stop` runs on every exit path,
/// including an early return via `?` or a panic unwind, standing in
/// for the exit hook a long-running process would register with the
/// OS signal handler.
struct ExitHookGuard(Engine);

impl ExitHookGuard {
    fn new(engine: Engine) -> Self {
        ExitHookGuard(engine)
    }
}

impl std::ops::Deref for ExitHookGuard {
    type Target = Engine;
    fn deref(&self) -> &Engine {
        &self.0
    }
}

impl std::ops::DerefMut for ExitHookGuard {
    fn deref_mut(&mut self) -> &mut Engine {
        &mut self.0
    }
}

impl Drop for ExitHookGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Parses `@type=virtual,name=front,filter=action,id,x,y` ad-hoc
/// observer specs into a File-sink `Observer` with sensible defaults,
/// for the common case of a quick diagnostic observer from the
/// command line.
fn parse_ad_hoc_observer(spec: &str) -> Result<Observer> {
    let spec = spec.trim_start_matches('@');
    let mut config = ObserverConfig::default();
    let mut out_path = std::path::PathBuf::from("ad-hoc.log");
    for pair in spec.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "name" => config.name = value.to_string(),
            "filter" => config.filter = value.to_string(),
            "regions" => config.region_binding = value.to_string(),
            "maxFps" => config.max_fps = value.parse().unwrap_or(config.max_fps),
            "out" => out_path = std::path::PathBuf::from(value),
            _ => {}
        }
    }
    if config.name.is_empty() {
        anyhow::bail!("ad-hoc observer spec missing name=");
    }
    Ok(Observer::new(config, Sink::File { path: out_path }))
}
