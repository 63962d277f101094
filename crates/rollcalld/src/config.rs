use anyhow::{Context, Result};
use rollcall_core::{EligibilityPolicy, MatchPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::session::SessionSettings;

/// Daemon configuration.
///
/// Defaults, optionally overlaid by the TOML file named in `ROLLCALL_CONFIG`,
/// then by individual `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a candidate match.
    pub match_threshold: f32,
    /// Minimum confidence (0–100) for a match to be recorded.
    pub accept_confidence: u8,
    /// Minimum seconds between two events of the same identity.
    pub cooldown_secs: u64,
    /// Allow at most one event per identity per local calendar day.
    pub once_per_day: bool,
    /// Interval between frame-availability ticks.
    pub tick_interval_ms: u64,
    /// Upper bound on a single detector call.
    pub detect_timeout_ms: u64,
    /// NDJSON file of pre-computed feature vectors, one frame per line.
    pub feature_source: Option<PathBuf>,
    /// Start a scanning session as soon as the daemon is up.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let match_policy = MatchPolicy::default();
        let eligibility = EligibilityPolicy::default();
        Self {
            db_path: default_data_dir().join("attendance.db"),
            match_threshold: match_policy.threshold,
            accept_confidence: match_policy.accept_confidence,
            cooldown_secs: eligibility.cooldown.as_secs(),
            once_per_day: eligibility.once_per_day,
            tick_interval_ms: 100,
            detect_timeout_ms: 2000,
            feature_source: None,
            autostart: true,
        }
    }
}

impl Config {
    /// Load configuration from `ROLLCALL_CONFIG` (if set) and `ROLLCALL_*` variables.
    pub fn load() -> Result<Self> {
        let base = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env_overrides().sanitized())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config.sanitized())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ROLLCALL_FEATURE_SOURCE") {
            self.feature_source = Some(PathBuf::from(path));
        }
        override_parsed(&mut self.match_threshold, "ROLLCALL_MATCH_THRESHOLD");
        override_parsed(&mut self.accept_confidence, "ROLLCALL_ACCEPT_CONFIDENCE");
        override_parsed(&mut self.cooldown_secs, "ROLLCALL_COOLDOWN_SECS");
        override_parsed(&mut self.tick_interval_ms, "ROLLCALL_TICK_INTERVAL_MS");
        override_parsed(&mut self.detect_timeout_ms, "ROLLCALL_DETECT_TIMEOUT_MS");
        if let Ok(v) = std::env::var("ROLLCALL_ONCE_PER_DAY") {
            self.once_per_day = v != "0";
        }
        if let Ok(v) = std::env::var("ROLLCALL_AUTOSTART") {
            self.autostart = v != "0";
        }
        self
    }

    /// Replace values that would silently disable matching with their defaults.
    fn sanitized(mut self) -> Self {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            let fallback = MatchPolicy::default().threshold;
            tracing::warn!(
                value = %self.match_threshold,
                fallback,
                "match_threshold must be a positive finite number; using default"
            );
            self.match_threshold = fallback;
        }
        self
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
            accept_confidence: self.accept_confidence.min(100),
        }
    }

    pub fn eligibility_policy(&self) -> EligibilityPolicy {
        EligibilityPolicy {
            cooldown: Duration::from_secs(self.cooldown_secs),
            once_per_day: self.once_per_day,
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            detect_timeout: Duration::from_millis(self.detect_timeout_ms.max(1)),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Replace `slot` with the parsed value of `key`; unparsable values are logged and ignored.
fn override_parsed<T: FromStr>(slot: &mut T, key: &str) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config value"),
    }
}
