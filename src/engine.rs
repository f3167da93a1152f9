//! Interception controller
//!
//! [`EngineHandle`] receives call events and decides, per event, whether and
//! how long to delay:
//!
//! ```text
//! on_call(site, locate)
//!   │
//!   ├─ not installed ───────────────────────────► Inactive
//!   ├─ MatchCache::decide == false ─────────────► NotTargeted   (no clock read)
//!   ├─ wall clock outside [start_ns, end_ns) ───► OutsideWindow
//!   ├─ frequency > 1 and count % frequency != 0 ► Skipped
//!   └─ spin_delay(delay_ns) ────────────────────► Delayed
//! ```
//!
//! Everything an event needs (gate, matcher, match cache, call counters) lives
//! in one immutable `Installation` published through an `ArcSwapOption`. An
//! event takes one lock-free load, so it sees one installation in full even if
//! another thread installs or uninstalls meanwhile, and events never contend
//! on a shared lock. Each successful install starts with an empty match
//! cache, so decisions made against an old target set can never leak into a
//! new one.
//!
//! The engine never touches arguments, return values or control flow of the
//! intercepted call. Its only effects are advancing a counter and keeping the
//! calling thread busy.

use crate::calibration::{self, CalibrationState};
use crate::clock::{ClockError, SystemWallClock, WallClock};
use crate::config::{ConfigError, GateConfig, InstallConfig};
use crate::counters::CallCounters;
use crate::match_cache::{CallSiteId, CallSiteInfo, CallSiteMatcher, MatchCache};
use crate::spin;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use thiserror::Error;

/// Errors from engine administration
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("speedbump is already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("clock calibration failed: {0}")]
    Clock(#[from] ClockError),
}

/// What the engine did with one call event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// No configuration installed
    Inactive,
    /// The site is not a target (or could not be resolved)
    NotTargeted,
    /// Target, but the wall clock is outside the activation window
    OutsideWindow,
    /// Target inside the window, but not the Nth call
    Skipped { count: u64 },
    /// The calling thread was held for `delay_ns`
    Delayed { delay_ns: u64 },
}

impl CallOutcome {
    pub fn is_delayed(&self) -> bool {
        matches!(self, CallOutcome::Delayed { .. })
    }
}

/// One installed configuration and its per-installation state
struct Installation {
    generation: u64,
    gate: GateConfig,
    matcher: Arc<dyn CallSiteMatcher>,
    cache: MatchCache,
    counters: CallCounters,
}

struct EngineInner {
    active: ArcSwapOption<Installation>,
    /// Serializes install and uninstall
    admin: Mutex<()>,
    next_generation: AtomicU64,
    wall: Arc<dyn WallClock>,
    calibration: CalibrationState,
}

/// Handle to one delay engine (cheap to clone; clones share state)
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("installed", &self.is_installed())
            .field("gate", &self.gate())
            .field("calibration", &self.inner.calibration)
            .finish()
    }
}

impl EngineHandle {
    /// Create an engine on the system wall clock
    ///
    /// Calibrates the process clock first; fails only if no monotonic clock
    /// is available.
    pub fn new() -> Result<Self, EngineError> {
        Self::with_wall_clock(Arc::new(SystemWallClock))
    }

    /// Create an engine reading activation windows from `wall`
    pub fn with_wall_clock(wall: Arc<dyn WallClock>) -> Result<Self, EngineError> {
        let calibration = calibration::init()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                active: ArcSwapOption::empty(),
                admin: Mutex::new(()),
                next_generation: AtomicU64::new(1),
                wall,
                calibration,
            }),
        })
    }

    /// Validate `config` and start delaying its targets
    ///
    /// Nothing is attached if validation fails.
    pub fn install(&self, config: &InstallConfig) -> Result<Subscription, EngineError> {
        let (gate, targets) = config.compile()?;
        let patterns = targets.len();
        let subscription = self.install_matcher(gate, Arc::new(targets))?;
        tracing::info!(
            patterns,
            delay_ns = gate.delay_ns,
            frequency = gate.frequency,
            start_ns = gate.start_ns,
            end_ns = gate.end_ns,
            "speedbump installed"
        );
        Ok(subscription)
    }

    /// Install with an arbitrary matcher instead of target patterns
    pub fn install_matcher(
        &self,
        gate: GateConfig,
        matcher: Arc<dyn CallSiteMatcher>,
    ) -> Result<Subscription, EngineError> {
        gate.validate()?;

        let _admin = self
            .inner
            .admin
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.active.load().is_some() {
            return Err(EngineError::AlreadyInstalled);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.active.store(Some(Arc::new(Installation {
            generation,
            gate,
            matcher,
            cache: MatchCache::new(),
            counters: CallCounters::new(),
        })));

        Ok(Subscription {
            engine: Arc::downgrade(&self.inner),
            generation,
        })
    }

    /// Stop delaying; returns whether anything was installed
    ///
    /// Idempotent: uninstalling an idle engine is a no-op.
    pub fn uninstall(&self) -> bool {
        self.inner.uninstall_if(|_| true)
    }

    /// Whether a configuration is installed
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.inner.active.load().is_some()
    }

    /// Gate of the current installation
    pub fn gate(&self) -> Option<GateConfig> {
        self.snapshot().map(|active| active.gate)
    }

    /// Calibration the engine was created with
    pub fn calibration(&self) -> CalibrationState {
        self.inner.calibration
    }

    /// Forget cached match decisions of the current installation
    pub fn clear_cache(&self) {
        if let Some(active) = self.snapshot() {
            active.cache.clear();
        }
    }

    /// Number of call sites with a cached decision
    pub fn cached_sites(&self) -> usize {
        self.snapshot().map_or(0, |active| active.cache.len())
    }

    /// Qualifying calls counted so far at `site` (only counted when frequency > 1)
    pub fn call_count(&self, site: CallSiteId) -> u64 {
        self.snapshot()
            .map_or(0, |active| active.counters.get(site))
    }

    fn snapshot(&self) -> Option<Arc<Installation>> {
        self.inner.active.load_full()
    }

    /// Handle one call-entry event
    ///
    /// `locate` resolves the site's names and runs only the first time the
    /// site is seen in this installation. Never fails: resolution or matcher
    /// failures mean "not a target".
    pub fn on_call<'a, L>(&self, site: CallSiteId, locate: L) -> CallOutcome
    where
        L: FnOnce() -> anyhow::Result<CallSiteInfo<'a>>,
    {
        let delay_ns = {
            let guard = self.inner.active.load();
            let Some(active) = guard.as_deref() else {
                return CallOutcome::Inactive;
            };

            if !active.cache.decide(site, locate, active.matcher.as_ref()) {
                return CallOutcome::NotTargeted;
            }

            let gate = active.gate;
            if !gate.in_window(self.inner.wall.now_ns()) {
                return CallOutcome::OutsideWindow;
            }

            if gate.frequency > 1 {
                let count = active.counters.increment(site);
                if !gate.is_due(count) {
                    return CallOutcome::Skipped { count };
                }
            }
            gate.delay_ns
        };

        spin::spin_delay(delay_ns);
        CallOutcome::Delayed { delay_ns }
    }
}

impl EngineInner {
    fn uninstall_if(&self, keep: impl FnOnce(&Installation) -> bool) -> bool {
        let removed = {
            let _admin = self.admin.lock().unwrap_or_else(PoisonError::into_inner);
            let current = self.active.load_full();
            if current.as_deref().is_some_and(keep) {
                self.active.store(None);
                current
            } else {
                None
            }
        };

        match removed {
            Some(installation) => {
                installation.counters.clear();
                installation.cache.clear();
                tracing::info!(generation = installation.generation, "speedbump uninstalled");
                true
            }
            None => false,
        }
    }
}

/// Proof of one successful install
///
/// Releasing it uninstalls that installation only; a stale subscription never
/// tears down a later one.
#[derive(Debug)]
#[must_use = "dropping a Subscription leaves the configuration installed"]
pub struct Subscription {
    engine: Weak<EngineInner>,
    generation: u64,
}

impl Subscription {
    /// Whether this installation is still the engine's current one
    pub fn is_active(&self) -> bool {
        self.engine.upgrade().is_some_and(|inner| {
            inner
                .active
                .load()
                .as_deref()
                .is_some_and(|active| active.generation == self.generation)
        })
    }

    /// Uninstall this installation; returns false if it was already gone
    pub fn uninstall(self) -> bool {
        let generation = self.generation;
        self.engine
            .upgrade()
            .is_some_and(|inner| inner.uninstall_if(|current| current.generation == generation))
    }
}

static GLOBAL: OnceLock<EngineHandle> = OnceLock::new();

/// The process-wide engine behind the free functions and [`crate::probe!`]
///
/// Created (and the clock calibrated) on first use.
pub fn global() -> Result<&'static EngineHandle, EngineError> {
    if let Some(engine) = GLOBAL.get() {
        return Ok(engine);
    }
    let engine = EngineHandle::new()?;
    Ok(GLOBAL.get_or_init(|| engine))
}

/// The process-wide engine, only if it exists and is installed
#[inline]
pub fn installed_global() -> Option<&'static EngineHandle> {
    GLOBAL.get().filter(|engine| engine.is_installed())
}
