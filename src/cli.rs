//! Command-line surface. The historical `+flag`/`-flag` token grammar
//! (`+d <dev>`, `+g <group>`, `-g <group>`, ...) is preprocessed into
//! long-option form before handing off to `clap`, so the parser itself
//! stays a plain derive struct instead of hand-rolled token scanning.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "lidar2d-engine", about = "Multi-sensor 2D LiDAR fusion and tracking engine")]
pub struct Cli {
    /// Add a device, `type:name` (e.g. `virtual:front-door`).
    #[arg(long = "device", value_name = "TYPE:NAME")]
    pub devices: Vec<String>,

    /// Include a device group in the active set.
    #[arg(long = "include-group", value_name = "GROUP")]
    pub include_groups: Vec<String>,

    /// Exclude a device group from the active set.
    #[arg(long = "exclude-group", value_name = "GROUP")]
    pub exclude_groups: Vec<String>,

    /// Configuration directory.
    #[arg(long = "conf", value_name = "DIR", default_value = "./config")]
    pub config_dir: String,

    /// Select a checkpoint snapshot: `latest` or an explicit timestamp tag.
    #[arg(long = "use-checkpoint", value_name = "TAG")]
    pub use_checkpoint: Option<String>,

    /// Add an ad-hoc observer: `@key=value,key=value,...`.
    #[arg(long = "observer", value_name = "SPEC")]
    pub ad_hoc_observers: Vec<String>,

    /// Enable a configured observer by name, or `all`.
    #[arg(long = "use-observer", value_name = "NAME")]
    pub use_observers: Vec<String>,

    /// Run cross-device pose auto-registration for this many
    /// milliseconds before the main loop starts.
    #[arg(long = "begin-registration", value_name = "MS")]
    pub begin_registration_ms: Option<u64>,

    /// Enable the tracker.
    #[arg(long = "track")]
    pub track: bool,

    /// Run every configured device in simulation mode.
    #[arg(long = "simulation-mode")]
    pub simulation_mode: bool,

    /// Target frames-per-second for the main loop.
    #[arg(long = "fps", default_value_t = 10)]
    pub fps: u32,

    /// Verbosity level, 0-3. Bare `--verbose` is level 2.
    #[arg(long = "verbose", value_name = "N", num_args = 0..=1, default_missing_value = "2")]
    pub verbose: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Usage = 1,
    Config = 2,
}

/// Rewrites the legacy `+flag`/`-flag <value>` tokens this system's
/// configuration scripts still carry into the long-option form clap
/// expects, before `Cli::parse_from` ever sees them.
pub fn normalize_legacy_tokens(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        let rewritten = match arg.as_str() {
            "+d" => "--device".to_string(),
            "+g" => "--include-group".to_string(),
            "-g" => "--exclude-group".to_string(),
            "+conf" => "--conf".to_string(),
            "+useCheckPoint" => "--use-checkpoint".to_string(),
            "+observer" => "--observer".to_string(),
            "+useObserver" => "--use-observer".to_string(),
            "+track" => "--track".to_string(),
            "+simulationMode" => "--simulation-mode".to_string(),
            "+fps" => "--fps".to_string(),
            "+v" => "--verbose".to_string(),
            other if other.starts_with('+') || (other.starts_with('-') && other.len() > 1 && !other.starts_with("--")) => {
                other.to_string()
            }
            other => other.to_string(),
        };
        out.push(rewritten);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rewrites_plus_device_token() {
        let args = vec!["+d".to_string(), "virtual:front".to_string()];
        let normalized = normalize_legacy_tokens(&args);
        assert_eq!(normalized, vec!["--device".to_string(), "virtual:front".to_string()]);
    }

    #[test]
    fn parses_after_normalization() {
        let raw = vec![
            "lidar2d-engine".to_string(),
            "+d".to_string(),
            "virtual:front".to_string(),
            "+fps".to_string(),
            "20".to_string(),
            "+track".to_string(),
        ];
        let normalized = normalize_legacy_tokens(&raw);
        let cli = Cli::parse_from(normalized);
        assert_eq!(cli.devices, vec!["virtual:front".to_string()]);
        assert_eq!(cli.fps, 20);
        assert!(cli.track);
    }
}
