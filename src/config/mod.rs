use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::ControllerConfig;
use crate::countdown::CountdownConfig;
use crate::session::{Coordinates, Point, Role, SessionState, Timers};
use crate::watchdog::WatchdogConfig;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".stacker";

/// Environment variables that override `[timers]` values.
const TIMER_OVERRIDES: [(&str, &str); 3] = [
    ("STACKER_START_DELAY", "start_delay"),
    ("STACKER_MAIN_WAIT", "main_wait"),
    ("STACKER_COOLDOWN", "cooldown"),
];
const TARGET_OVERRIDE: &str = "STACKER_TARGET_TITLE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default)]
    pub prompts: Vec<String>,
    /// Window the driver brings to the foreground before pasting.
    #[serde(default = "default_target_title")]
    pub target_title: String,
}

fn default_target_title() -> String {
    "Cursor".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            prompts: Vec::new(),
            target_title: default_target_title(),
        }
    }
}

/// ```toml
/// [coordinates]
/// input = { x = 640, y = 900 }
/// submit = { x = 1180, y = 900 }
/// accept = { x = 1100, y = 820 }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CoordinateSettings {
    #[serde(default)]
    pub input: Option<Point>,
    #[serde(default)]
    pub submit: Option<Point>,
    #[serde(default)]
    pub accept: Option<Point>,
}

impl CoordinateSettings {
    pub fn to_coordinates(&self) -> Coordinates {
        [
            (Role::Input, self.input),
            (Role::Submit, self.submit),
            (Role::Accept, self.accept),
        ]
        .into_iter()
        .filter_map(|(role, point)| point.map(|p| (role, p)))
        .collect()
    }
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_poll_divisor() -> u32 {
    20
}

fn default_grace_ticks() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CountdownSettings {
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Polls per tick.
    #[serde(default = "default_poll_divisor")]
    pub poll_divisor: u32,
    #[serde(default = "default_grace_ticks")]
    pub grace_ticks: u32,
}

impl Default for CountdownSettings {
    fn default() -> Self {
        Self {
            tick_millis: default_tick_millis(),
            poll_divisor: default_poll_divisor(),
            grace_ticks: default_grace_ticks(),
        }
    }
}

fn default_pause_timeout_secs() -> u64 {
    300
}

fn default_stop_join_timeout_secs() -> u64 {
    5
}

fn default_max_timer_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerSettings {
    #[serde(default = "default_pause_timeout_secs")]
    pub pause_timeout_secs: u64,
    #[serde(default = "default_stop_join_timeout_secs")]
    pub stop_join_timeout_secs: u64,
    #[serde(default = "default_max_timer_secs")]
    pub max_timer_secs: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            pause_timeout_secs: default_pause_timeout_secs(),
            stop_join_timeout_secs: default_stop_join_timeout_secs(),
            max_timer_secs: default_max_timer_secs(),
        }
    }
}

fn default_watchdog_enabled() -> bool {
    true
}

fn default_watchdog_period_secs() -> u64 {
    5
}

fn default_stuck_threshold_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogSettings {
    #[serde(default = "default_watchdog_enabled")]
    pub enabled: bool,
    #[serde(default = "default_watchdog_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            enabled: default_watchdog_enabled(),
            period_secs: default_watchdog_period_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StackerConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub timers: Timers,
    #[serde(default)]
    pub coordinates: CoordinateSettings,
    #[serde(default)]
    pub countdown: CountdownSettings,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
}

impl StackerConfig {
    /// Search upward from `start` for a `.stacker/config.toml` file and load
    /// it, then apply environment overrides. Returns the default config if
    /// no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        let (mut config, path) = Self::load_file(start)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok((config, path))
    }

    fn load_file(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: StackerConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((StackerConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Apply `STACKER_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for (var, field) in TIMER_OVERRIDES {
            let Some(raw) = lookup(var) else {
                continue;
            };
            let secs: f64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{var}={raw:?} is not a number of seconds"))?;
            if !secs.is_finite() || secs < 0.0 {
                bail!("{var}={raw:?} must be a non-negative number of seconds");
            }
            match field {
                "start_delay" => self.timers.start_delay = secs,
                "main_wait" => self.timers.main_wait = secs,
                _ => self.timers.cooldown = secs,
            }
        }
        if let Some(title) = lookup(TARGET_OVERRIDE) {
            self.session.target_title = title;
        }
        Ok(())
    }

    pub fn countdown_config(&self) -> CountdownConfig {
        CountdownConfig::new(
            Duration::from_millis(self.countdown.tick_millis.max(1)),
            self.countdown.poll_divisor,
            self.countdown.grace_ticks,
        )
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            countdown: self.countdown_config(),
            pause_timeout: Duration::from_secs(self.controller.pause_timeout_secs),
            stop_join_timeout: Duration::from_secs(self.controller.stop_join_timeout_secs),
            max_timer_secs: self.controller.max_timer_secs,
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            period: Duration::from_secs(self.watchdog.period_secs.max(1)),
            stuck_threshold: Duration::from_secs(self.watchdog.stuck_threshold_secs),
        }
    }

    pub fn session_state(&self) -> SessionState {
        SessionState::new(
            self.session.prompts.clone(),
            self.coordinates.to_coordinates(),
            self.timers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::fs;

    fn write_config(root: &Path, contents: &str) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILENAME);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn default_config_values() {
        let config = StackerConfig::default();
        assert!(config.session.prompts.is_empty());
        assert_eq!(config.session.target_title, "Cursor");
        assert_eq!(config.timers, Timers::default());
        assert_eq!(config.countdown.tick_millis, 1000);
        assert_eq!(config.controller.pause_timeout_secs, 300);
        assert_eq!(config.controller.max_timer_secs, 3600);
        assert!(config.watchdog.enabled);
        assert_eq!(config.watchdog.period_secs, 5);
        assert_eq!(config.watchdog.stuck_threshold_secs, 10);
        assert!(config.coordinates.to_coordinates().is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[session]
prompts = ["first", "second"]
target_title = "Editor"

[timers]
start_delay = 1.5
get_ready_delay = 0.5
main_wait = 60
cooldown = 0.1

[coordinates]
input = { x = 10, y = 20 }
submit = { x = 30, y = 40 }
accept = { x = 50, y = 60 }

[countdown]
tick_millis = 500
poll_divisor = 10
grace_ticks = 4

[controller]
pause_timeout_secs = 120

[watchdog]
enabled = false
period_secs = 2
"#;
        let config: StackerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.session.prompts, vec!["first", "second"]);
        assert_eq!(config.session.target_title, "Editor");
        assert_eq!(config.timers.start_delay, 1.5);
        assert_eq!(config.timers.main_wait, 60.0);
        assert_eq!(
            config.coordinates.to_coordinates()[&Role::Accept],
            Point::new(50, 60)
        );
        assert_eq!(config.controller.pause_timeout_secs, 120);
        assert_eq!(config.controller.stop_join_timeout_secs, 5);
        assert!(!config.watchdog.enabled);
        assert_eq!(config.watchdog.stuck_threshold_secs, 10);

        let countdown = config.countdown_config();
        assert_eq!(countdown.tick, Duration::from_millis(500));
        assert_eq!(countdown.poll, Duration::from_millis(50));
        assert_eq!(countdown.grace(), Duration::from_secs(2));
        assert_eq!(
            config.controller_config().pause_timeout,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn partial_coordinates_leave_roles_unset() {
        let toml = r#"
[coordinates]
input = { x = 1, y = 2 }
"#;
        let config: StackerConfig = toml::from_str(toml).unwrap();
        let coords = config.coordinates.to_coordinates();
        assert_eq!(coords.len(), 1);
        assert!(!coords.contains_key(&Role::Submit));
    }

    #[test]
    fn load_finds_config_in_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "[session]\nprompts = [\"A\"]\n");
        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let (config, found) = StackerConfig::load_file(&nested).unwrap();
        assert_eq!(found, Some(path));
        assert_eq!(config.session.prompts, vec!["A"]);
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, found) = StackerConfig::load_file(tmp.path()).unwrap();
        assert!(found.is_none());
        assert_eq!(config, StackerConfig::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "[timers\nmain_wait = ");
        let err = StackerConfig::load_file(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }

    #[test]
    fn overrides_replace_timers_and_target() {
        let vars: HashMap<&str, &str> = [
            ("STACKER_MAIN_WAIT", "12.5"),
            ("STACKER_COOLDOWN", " 0 "),
            ("STACKER_TARGET_TITLE", "Other"),
        ]
        .into_iter()
        .collect();
        let mut config = StackerConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.timers.main_wait, 12.5);
        assert_eq!(config.timers.cooldown, 0.0);
        assert_eq!(config.timers.start_delay, 5.0);
        assert_eq!(config.session.target_title, "Other");
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut config = StackerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "STACKER_START_DELAY").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("STACKER_START_DELAY"));

        let err = config
            .apply_overrides(|key| (key == "STACKER_COOLDOWN").then(|| "-1".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    #[serial]
    fn load_reads_process_environment() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "[timers]\nmain_wait = 30\n");

        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::set_var("STACKER_MAIN_WAIT", "7") };
        let result = StackerConfig::load(tmp.path());
        unsafe { std::env::remove_var("STACKER_MAIN_WAIT") };

        let (config, _) = result.unwrap();
        assert_eq!(config.timers.main_wait, 7.0);
    }

    #[test]
    fn config_serializes_to_json() {
        let json = serde_json::to_value(StackerConfig::default()).unwrap();
        assert_eq!(json["timers"]["main_wait"], 300.0);
        assert_eq!(json["watchdog"]["period_secs"], 5);
    }

    proptest! {
        #[test]
        fn numeric_overrides_round_trip(secs in 0.0f64..10_000.0) {
            let mut config = StackerConfig::default();
            let raw = secs.to_string();
            config
                .apply_overrides(|key| (key == "STACKER_START_DELAY").then(|| raw.clone()))
                .unwrap();
            prop_assert_eq!(config.timers.start_delay, secs);
        }
    }
}
