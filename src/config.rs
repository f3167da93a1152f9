//! Delay configuration
//!
//! Two layers:
//! - [`GateConfig`]: the immutable snapshot the engine consults on every call
//!   (delay, frequency, activation window). Installed as one unit.
//! - [`InstallConfig`]: what a user hands to `install`, read from JSON, TOML or
//!   `SPEEDBUMP_*` environment variables and validated before anything is
//!   attached.
//!
//! # Environment
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `SPEEDBUMP_TARGETS` | path to a targets file; unset = disabled | - |
//! | `SPEEDBUMP_DELAY_NS` | delay per trigger | 1000 |
//! | `SPEEDBUMP_FREQUENCY` | trigger every Nth matching call | 1 |
//! | `SPEEDBUMP_START_MS` | delay after process start before activating | 0 |
//! | `SPEEDBUMP_DURATION_MS` | active duration, 0 = indefinite | 0 |

use crate::calibration;
use crate::clock::{self, ClockError};
use crate::patterns::{self, PatternError, TargetSet};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

pub const ENV_TARGETS: &str = "SPEEDBUMP_TARGETS";
pub const ENV_DELAY_NS: &str = "SPEEDBUMP_DELAY_NS";
pub const ENV_FREQUENCY: &str = "SPEEDBUMP_FREQUENCY";
pub const ENV_START_MS: &str = "SPEEDBUMP_START_MS";
pub const ENV_DURATION_MS: &str = "SPEEDBUMP_DURATION_MS";

/// Delay used when `SPEEDBUMP_DELAY_NS` is unset
pub const DEFAULT_DELAY_NS: u64 = 1_000;

const NS_PER_MS: i64 = 1_000_000;

static PROCESS_START_NS: OnceLock<i64> = OnceLock::new();

/// Wall-clock reference for `SPEEDBUMP_START_MS`
///
/// Captured the first time anything asks for it; [`crate::init`] does so at
/// startup.
pub fn process_start_ns() -> i64 {
    *PROCESS_START_NS.get_or_init(clock::wall_ns)
}

/// Errors in delay configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("clock calibration failed: {0}")]
    Clock(#[from] ClockError),

    #[error("configuration has no targets")]
    NoTargets,

    #[error("frequency must be at least 1")]
    ZeroFrequency,

    #[error("invalid target pattern: {0}")]
    Pattern(#[from] PatternError),

    #[error("{name}: invalid integer '{value}'")]
    InvalidInteger { name: String, value: String },

    #[error("{name}: value {value} is below minimum {min}")]
    BelowMinimum { name: String, value: i64, min: i64 },

    #[error("{name}: value {value} is out of range")]
    OutOfRange { name: String, value: i64 },

    #[error("{name}: targets file not found: {}", path.display())]
    TargetsNotFound { name: String, path: PathBuf },
}

/// Immutable delay and gating parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// Spin duration per trigger
    pub delay_ns: u64,
    /// Trigger on every Nth qualifying call of a site (>= 1)
    pub frequency: u32,
    /// Wall-clock time before which nothing fires
    pub start_ns: i64,
    /// Wall-clock time from which nothing fires (0 = unbounded)
    pub end_ns: i64,
}

impl GateConfig {
    /// Delay every call, always
    pub fn new(delay_ns: u64) -> Self {
        Self {
            delay_ns,
            frequency: 1,
            start_ns: 0,
            end_ns: 0,
        }
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    /// Restrict activity to `[start_ns, end_ns)`; `end_ns == 0` leaves it open
    pub fn with_window(mut self, start_ns: i64, end_ns: i64) -> Self {
        self.start_ns = start_ns;
        self.end_ns = end_ns;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frequency == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        if self.end_ns != 0 && self.end_ns <= self.start_ns {
            tracing::warn!(
                start_ns = self.start_ns,
                end_ns = self.end_ns,
                "activation window is empty, nothing will be delayed"
            );
        }
        Ok(())
    }

    /// Whether `now_ns` falls inside the activation window
    #[inline]
    pub fn in_window(&self, now_ns: i64) -> bool {
        if now_ns < self.start_ns {
            return false;
        }
        !(self.end_ns != 0 && now_ns >= self.end_ns)
    }

    /// Whether the `count`-th qualifying call of a site should fire
    #[inline]
    pub fn is_due(&self, count: u64) -> bool {
        self.frequency <= 1 || count % u64::from(self.frequency) == 0
    }

    /// The same gate with the delay raised to `min_delay_ns` if below it
    pub fn clamped_to(mut self, min_delay_ns: u64) -> Self {
        if self.delay_ns < min_delay_ns {
            tracing::warn!(
                requested_ns = self.delay_ns,
                min_delay_ns,
                "requested delay below minimum, clamping; raise the frequency for smaller average delays"
            );
            self.delay_ns = min_delay_ns;
        }
        self
    }
}

fn default_frequency() -> u32 {
    1
}

/// User-facing install configuration
///
/// ```
/// use speedbump::config::InstallConfig;
///
/// let config = InstallConfig::from_json_str(
///     r#"{"targets": ["myapp::db:Pool::*"], "delay_ns": 50000, "frequency": 10}"#,
/// )
/// .unwrap();
/// assert_eq!(config.frequency, 10);
/// assert_eq!(config.end_ns, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallConfig {
    /// Pattern descriptors (`module_glob:name_glob`)
    pub targets: Vec<String>,
    pub delay_ns: u64,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub start_ns: i64,
    #[serde(default)]
    pub end_ns: i64,
}

impl InstallConfig {
    pub fn new<S: Into<String>>(targets: impl IntoIterator<Item = S>, delay_ns: u64) -> Self {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            delay_ns,
            frequency: 1,
            start_ns: 0,
            end_ns: 0,
        }
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_window(mut self, start_ns: i64, end_ns: i64) -> Self {
        self.start_ns = start_ns;
        self.end_ns = end_ns;
        self
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// The gating half of the configuration
    pub fn gate(&self) -> GateConfig {
        GateConfig {
            delay_ns: self.delay_ns,
            frequency: self.frequency,
            start_ns: self.start_ns,
            end_ns: self.end_ns,
        }
    }

    /// Validate and compile into what the engine installs
    pub fn compile(&self) -> Result<(GateConfig, TargetSet), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let gate = self.gate();
        gate.validate()?;
        let targets = TargetSet::compile(&self.targets)?;
        Ok((gate, targets))
    }

    /// Read `SPEEDBUMP_*` from the process environment
    ///
    /// `Ok(None)` means disabled: no targets file named, or the file holds no
    /// patterns.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read `SPEEDBUMP_*` through `lookup`
    ///
    /// The start offset is taken relative to [`process_start_ns`] and the
    /// delay is clamped to the calibrated minimum.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let calibration = calibration::init()?;
        let Some(targets_path) = lookup(ENV_TARGETS).filter(|p| !p.is_empty()) else {
            return Ok(None);
        };

        let path = PathBuf::from(&targets_path);
        if !path.exists() {
            return Err(ConfigError::TargetsNotFound {
                name: ENV_TARGETS.to_string(),
                path,
            });
        }

        let targets = patterns::load_targets(&path)?;
        if targets.is_empty() {
            tracing::warn!(path = %targets_path, "no patterns found in targets file");
            return Ok(None);
        }

        let delay_ns = parse_int(&lookup, ENV_DELAY_NS, DEFAULT_DELAY_NS as i64, 0)? as u64;
        let frequency = parse_int(&lookup, ENV_FREQUENCY, 1, 1)?;
        let start_ms = parse_int(&lookup, ENV_START_MS, 0, 0)?;
        let duration_ms = parse_int(&lookup, ENV_DURATION_MS, 0, 0)?;

        let frequency = u32::try_from(frequency).map_err(|_| ConfigError::OutOfRange {
            name: ENV_FREQUENCY.to_string(),
            value: frequency,
        })?;
        let start_ns = ms_to_ns(ENV_START_MS, start_ms)?.saturating_add(process_start_ns());
        let end_ns = if duration_ms > 0 {
            start_ns.saturating_add(ms_to_ns(ENV_DURATION_MS, duration_ms)?)
        } else {
            0
        };

        let gate = GateConfig {
            delay_ns,
            frequency,
            start_ns,
            end_ns,
        }
        .clamped_to(calibration.min_delay_ns());

        tracing::info!(
            patterns = targets.len(),
            path = %targets_path,
            delay_ns = gate.delay_ns,
            frequency = gate.frequency,
            start_offset_ms = start_ms,
            duration_ms,
            "loaded configuration from environment"
        );

        Ok(Some(Self {
            targets: targets.iter().map(|p| p.original().to_string()).collect(),
            delay_ns: gate.delay_ns,
            frequency: gate.frequency,
            start_ns: gate.start_ns,
            end_ns: gate.end_ns,
        }))
    }
}

fn parse_int<F>(lookup: &F, name: &str, default: i64, min: i64) -> Result<i64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidInteger {
            name: name.to_string(),
            value: raw.clone(),
        })?;
    if value < min {
        return Err(ConfigError::BelowMinimum {
            name: name.to_string(),
            value,
            min,
        });
    }
    Ok(value)
}

fn ms_to_ns(name: &str, ms: i64) -> Result<i64, ConfigError> {
    ms.checked_mul(NS_PER_MS).ok_or(ConfigError::OutOfRange {
        name: name.to_string(),
        value: ms,
    })
}
