//! Speedbump - calibrated latency injection for chosen call sites
//!
//! Speedbump holds the calling thread of selected functions for a fixed,
//! calibrated number of nanoseconds, to answer "does my system tolerate a
//! slow dependency?" without touching the dependency itself.
//!
//! Pipeline per call event:
//!
//! ```text
//! probe!() / EngineHandle::on_call
//!     → MatchCache (is this site a target?)
//!     → activation window (wall clock)
//!     → frequency gate (every Nth call per site)
//!     → spin_delay (busy-wait, never yields)
//! ```
//!
//! # Example
//!
//! ```
//! use speedbump::InstallConfig;
//!
//! fn lookup(key: u32) -> u32 {
//!     speedbump::probe!();
//!     key + 1
//! }
//!
//! speedbump::init().unwrap();
//! let subscription = speedbump::install(&InstallConfig::new(["*:*lookup"], 20_000)).unwrap();
//! assert_eq!(lookup(1), 2); // took at least 20us
//! subscription.uninstall();
//! ```

pub mod calibration;
pub mod cli;
pub mod clock;
pub mod config;
pub mod counters;
pub mod engine;
pub mod match_cache;
pub mod native;
pub mod patterns;
pub mod probe;
pub mod spin;

pub use calibration::{get_clock_overhead_ns, get_min_delay_ns, is_calibrated, CalibrationState};
pub use config::{GateConfig, InstallConfig};
pub use engine::{CallOutcome, EngineError, EngineHandle, Subscription};
pub use match_cache::{CallSiteId, CallSiteInfo, CallSiteMatcher, MatchDecision};
pub use spin::spin_delay;

/// Calibrate the clock and pin the process start time
///
/// Call early in `main`; the calibration getters and the env loader do it on
/// first use otherwise.
pub fn init() -> Result<CalibrationState, clock::ClockError> {
    config::process_start_ns();
    calibration::init()
}

/// Install `config` on the process-wide engine
pub fn install(config: &InstallConfig) -> Result<Subscription, EngineError> {
    engine::global()?.install(config)
}

/// Install an untyped JSON configuration on the process-wide engine
///
/// Shape errors (`targets` not a list, non-integer `delay_ns`) are reported
/// before anything is attached.
pub fn install_json(config: serde_json::Value) -> Result<Subscription, EngineError> {
    let config = InstallConfig::from_json_value(config)?;
    install(&config)
}

/// Install the process-wide engine from `SPEEDBUMP_*` environment variables
///
/// `Ok(None)` when the environment leaves speedbump disabled.
pub fn install_from_env() -> Result<Option<Subscription>, EngineError> {
    init()?;
    match InstallConfig::from_env()? {
        Some(config) => install(&config).map(Some),
        None => Ok(None),
    }
}

/// Uninstall the process-wide engine; a no-op when nothing is installed
pub fn uninstall() -> bool {
    engine::installed_global().is_some_and(EngineHandle::uninstall)
}

/// Whether the process-wide engine is installed
pub fn is_installed() -> bool {
    engine::installed_global().is_some()
}

/// Gate of the process-wide installation, if any
pub fn get_config() -> Option<GateConfig> {
    engine::installed_global().and_then(EngineHandle::gate)
}

/// Forget the process-wide engine's cached match decisions
///
/// Sites are re-resolved and re-matched on their next call.
pub fn clear_cache() {
    if let Some(engine) = engine::installed_global() {
        engine.clear_cache();
    }
}
