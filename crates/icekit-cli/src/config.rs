//! Runner configuration – reads/writes `~/.icekit/config.toml`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Simulated device the runner drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    #[default]
    PulseOx,
    Pump,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::PulseOx => write!(f, "pulse-ox"),
            DeviceKind::Pump => write!(f, "pump"),
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pulse-ox" | "pulseox" => Ok(DeviceKind::PulseOx),
            "pump" => Ok(DeviceKind::Pump),
            other => Err(format!("unknown device kind {other:?} (expected pulse-ox or pump)")),
        }
    }
}

/// Persisted runner configuration stored in `~/.icekit/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceKind,

    /// Name passed to `connect`.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Event-loop service period.
    #[serde(default = "default_loop_period_ms")]
    pub loop_period_ms: u64,

    /// Rolling-average window; 0 disables averaging.
    #[serde(default = "default_averaging_period_secs")]
    pub averaging_period_secs: u64,

    /// Interval between oximeter publications.
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,

    #[serde(default = "default_pulse_rate")]
    pub pulse_rate: f32,

    #[serde(default = "default_spo2")]
    pub spo2: f32,

    /// Pump progress update interval.
    #[serde(default = "default_pump_update_period_ms")]
    pub pump_update_period_ms: u64,
}

fn default_device_name() -> String {
    "simulated".to_string()
}
fn default_loop_period_ms() -> u64 {
    100
}
fn default_averaging_period_secs() -> u64 {
    10
}
fn default_publish_period_ms() -> u64 {
    1000
}
fn default_pulse_rate() -> f32 {
    72.0
}
fn default_spo2() -> f32 {
    98.0
}
fn default_pump_update_period_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceKind::default(),
            device_name: default_device_name(),
            loop_period_ms: default_loop_period_ms(),
            averaging_period_secs: default_averaging_period_secs(),
            publish_period_ms: default_publish_period_ms(),
            pulse_rate: default_pulse_rate(),
            spo2: default_spo2(),
            pump_update_period_ms: default_pump_update_period_ms(),
        }
    }
}

impl Config {
    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(self.loop_period_ms.max(1))
    }

    pub fn averaging_period(&self) -> Option<Duration> {
        (self.averaging_period_secs > 0).then(|| Duration::from_secs(self.averaging_period_secs))
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_millis(self.publish_period_ms.max(1))
    }

    pub fn pump_update_period(&self) -> Duration {
        Duration::from_millis(self.pump_update_period_ms.max(1))
    }
}

/// Return the path to `~/.icekit/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".icekit").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ICEKIT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ICEKIT_DEVICE` | `device` |
/// | `ICEKIT_DEVICE_NAME` | `device_name` |
/// | `ICEKIT_LOOP_PERIOD_MS` | `loop_period_ms` |
/// | `ICEKIT_AVERAGING_PERIOD_SECS` | `averaging_period_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ICEKIT_DEVICE")
        && let Ok(device) = v.parse::<DeviceKind>() {
            cfg.device = device;
        }
    if let Ok(v) = std::env::var("ICEKIT_DEVICE_NAME") {
        cfg.device_name = v;
    }
    if let Ok(v) = std::env::var("ICEKIT_LOOP_PERIOD_MS")
        && let Ok(ms) = v.parse::<u64>() {
            cfg.loop_period_ms = ms;
        }
    if let Ok(v) = std::env::var("ICEKIT_AVERAGING_PERIOD_SECS")
        && let Ok(secs) = v.parse::<u64>() {
            cfg.averaging_period_secs = secs;
        }
}

/// Save the config to disk, creating `~/.icekit/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.device = DeviceKind::Pump;
        save_to(&cfg, &path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("device = \"pump\""));
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.device, DeviceKind::Pump);
        assert_eq!(loaded.pulse_rate, 72.0);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "device = \"pulse-ox\"\nspo2 = 91.5\n").expect("write");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.spo2, 91.5);
        assert_eq!(loaded.pulse_rate, 72.0);
        assert_eq!(loaded.pump_update_period_ms, 1000);
    }

    #[test]
    fn zero_averaging_period_disables_averaging() {
        let cfg = Config {
            averaging_period_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.averaging_period(), None);
        assert_eq!(Config::default().averaging_period(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn config_path_points_to_icekit_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".icekit"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn device_kind_parses_and_displays() {
        assert_eq!("pump".parse::<DeviceKind>(), Ok(DeviceKind::Pump));
        assert_eq!(" pulse-ox ".parse::<DeviceKind>(), Ok(DeviceKind::PulseOx));
        assert!("ventilator".parse::<DeviceKind>().is_err());
        assert_eq!(DeviceKind::PulseOx.to_string(), "pulse-ox");
    }

    #[test]
    fn apply_env_overrides_changes_device() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("ICEKIT_DEVICE", "pump") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.device, DeviceKind::Pump);
        unsafe { std::env::remove_var("ICEKIT_DEVICE") };
    }

    #[test]
    fn apply_env_overrides_changes_device_name() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("ICEKIT_DEVICE_NAME", "bedside-3") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.device_name, "bedside-3");
        unsafe { std::env::remove_var("ICEKIT_DEVICE_NAME") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_period() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("ICEKIT_LOOP_PERIOD_MS", "soon") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.loop_period_ms, 100);
        unsafe { std::env::remove_var("ICEKIT_LOOP_PERIOD_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_averaging_period() {
        // SAFETY: each test touches its own variable.
        unsafe { std::env::set_var("ICEKIT_AVERAGING_PERIOD_SECS", "30") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.averaging_period_secs, 30);
        unsafe { std::env::remove_var("ICEKIT_AVERAGING_PERIOD_SECS") };
    }
}
