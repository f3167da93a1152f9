//! Per-call-site memoized match decisions
//!
//! Deciding whether a call site is a target means resolving its names and
//! running every pattern against them, which is far too slow to repeat on
//! each call. The cache stores a terminal [`MatchDecision`] per
//! [`CallSiteId`] the first time a site is seen, after which lookups never
//! touch the collaborators again.
//!
//! # Concurrency
//!
//! The table is a `DashMap` keyed with FNV, so hits take one shard read lock
//! and unrelated sites rarely share a shard. Two threads seeing a new site at
//! the same time may both run the matcher; the first stored decision wins and
//! both return it, so a site never answers differently within one cache.
//!
//! # Failures
//!
//! A failing `locate` or matcher (error or panic) counts as "no match" for
//! that event and is not cached, so the site is re-evaluated next time.

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};

/// Opaque key identifying one call site for the lifetime of that site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteId(pub u64);

/// Names identifying a call site to the matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteInfo<'a> {
    /// Module the code lives in
    pub module: Cow<'a, str>,
    /// Qualified function name within the module
    pub qualified_name: Cow<'a, str>,
}

impl<'a> CallSiteInfo<'a> {
    pub fn new(module: impl Into<Cow<'a, str>>, qualified_name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            module: module.into(),
            qualified_name: qualified_name.into(),
        }
    }
}

/// Predicate deciding whether a call site is a target
///
/// Must be a pure function of its configuration: the answer for a site is
/// cached for the rest of the installation.
pub trait CallSiteMatcher: Send + Sync {
    fn matches(&self, module: &str, qualified_name: &str) -> anyhow::Result<bool>;
}

/// Cached decision for one call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchDecision {
    /// Never evaluated
    #[default]
    Unknown,
    NoMatch,
    Match,
}

impl MatchDecision {
    pub fn is_terminal(self) -> bool {
        self != MatchDecision::Unknown
    }
}

impl From<bool> for MatchDecision {
    fn from(matched: bool) -> Self {
        if matched {
            MatchDecision::Match
        } else {
            MatchDecision::NoMatch
        }
    }
}

/// Concurrent table of terminal match decisions
pub struct MatchCache {
    decisions: DashMap<CallSiteId, MatchDecision, FnvBuildHasher>,
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl MatchCache {
    pub fn new() -> Self {
        Self {
            decisions: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Cached decision for `site`, without evaluating anything
    #[inline]
    pub fn lookup(&self, site: CallSiteId) -> MatchDecision {
        self.decisions
            .get(&site)
            .map(|decision| *decision)
            .unwrap_or_default()
    }

    /// Store a terminal decision unless one is already present
    ///
    /// Returns the decision that is cached after the call.
    pub fn store(&self, site: CallSiteId, decision: MatchDecision) -> MatchDecision {
        if !decision.is_terminal() {
            return self.lookup(site);
        }
        *self.decisions.entry(site).or_insert(decision)
    }

    /// Whether `site` is a target, consulting the collaborators only on a miss
    pub fn decide<'a, L>(&self, site: CallSiteId, locate: L, matcher: &dyn CallSiteMatcher) -> bool
    where
        L: FnOnce() -> anyhow::Result<CallSiteInfo<'a>>,
    {
        match self.lookup(site) {
            MatchDecision::Match => return true,
            MatchDecision::NoMatch => return false,
            MatchDecision::Unknown => {}
        }

        let info = match locate() {
            Ok(info) => info,
            Err(err) => {
                tracing::trace!(site = site.0, error = %err, "call site could not be located");
                return false;
            }
        };

        let evaluated = panic::catch_unwind(AssertUnwindSafe(|| {
            matcher.matches(&info.module, &info.qualified_name)
        }));
        let matched = match evaluated {
            Ok(Ok(matched)) => matched,
            Ok(Err(err)) => {
                tracing::debug!(
                    module = %info.module,
                    name = %info.qualified_name,
                    error = %err,
                    "matcher failed, treating as no match"
                );
                return false;
            }
            Err(_) => {
                tracing::warn!(
                    module = %info.module,
                    name = %info.qualified_name,
                    "matcher panicked, treating as no match"
                );
                return false;
            }
        };

        self.store(site, matched.into()) == MatchDecision::Match
    }

    /// Number of cached decisions
    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached decision
    pub fn clear(&self) {
        self.decisions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMatcher {
        calls: AtomicUsize,
        answer: bool,
    }

    impl CountingMatcher {
        fn new(answer: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                answer,
            }
        }
    }

    impl CallSiteMatcher for CountingMatcher {
        fn matches(&self, _module: &str, _name: &str) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct FailingMatcher;

    impl CallSiteMatcher for FailingMatcher {
        fn matches(&self, _module: &str, _name: &str) -> anyhow::Result<bool> {
            Err(anyhow!("bad pattern"))
        }
    }

    struct PanickingMatcher;

    impl CallSiteMatcher for PanickingMatcher {
        fn matches(&self, _module: &str, _name: &str) -> anyhow::Result<bool> {
            panic!("matcher bug")
        }
    }

    fn locate_ok() -> anyhow::Result<CallSiteInfo<'static>> {
        Ok(CallSiteInfo::new("app", "handler"))
    }

    #[test]
    fn test_new_cache_is_empty() {
        let cache = MatchCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(CallSiteId(1)), MatchDecision::Unknown);
    }

    #[test]
    fn test_decide_caches_match() {
        let cache = MatchCache::new();
        let matcher = CountingMatcher::new(true);
        for _ in 0..5 {
            assert!(cache.decide(CallSiteId(7), locate_ok, &matcher));
        }
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.lookup(CallSiteId(7)), MatchDecision::Match);
    }

    #[test]
    fn test_decide_caches_no_match() {
        let cache = MatchCache::new();
        let matcher = CountingMatcher::new(false);
        for _ in 0..5 {
            assert!(!cache.decide(CallSiteId(7), locate_ok, &matcher));
        }
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.lookup(CallSiteId(7)), MatchDecision::NoMatch);
    }

    #[test]
    fn test_hit_skips_locate() {
        let cache = MatchCache::new();
        let matcher = CountingMatcher::new(true);
        assert!(cache.decide(CallSiteId(3), locate_ok, &matcher));

        let located = AtomicUsize::new(0);
        let locate = || {
            located.fetch_add(1, Ordering::SeqCst);
            locate_ok()
        };
        assert!(cache.decide(CallSiteId(3), locate, &matcher));
        assert_eq!(located.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_matcher_error_is_no_match_and_not_cached() {
        let cache = MatchCache::new();
        assert!(!cache.decide(CallSiteId(1), locate_ok, &FailingMatcher));
        assert_eq!(cache.lookup(CallSiteId(1)), MatchDecision::Unknown);

        // A later healthy evaluation is still possible
        let matcher = CountingMatcher::new(true);
        assert!(cache.decide(CallSiteId(1), locate_ok, &matcher));
    }

    #[test]
    fn test_matcher_panic_is_contained() {
        let cache = MatchCache::new();
        assert!(!cache.decide(CallSiteId(2), locate_ok, &PanickingMatcher));
        assert_eq!(cache.lookup(CallSiteId(2)), MatchDecision::Unknown);
    }

    #[test]
    fn test_locate_error_skips_matcher() {
        let cache = MatchCache::new();
        let matcher = CountingMatcher::new(true);
        let locate = || -> anyhow::Result<CallSiteInfo<'static>> { Err(anyhow!("no frame")) };
        assert!(!cache.decide(CallSiteId(4), locate, &matcher));
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_store_first_write_wins() {
        let cache = MatchCache::new();
        assert_eq!(
            cache.store(CallSiteId(9), MatchDecision::Match),
            MatchDecision::Match
        );
        assert_eq!(
            cache.store(CallSiteId(9), MatchDecision::NoMatch),
            MatchDecision::Match
        );
        assert_eq!(
            cache.store(CallSiteId(10), MatchDecision::Unknown),
            MatchDecision::Unknown
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_sites_are_independent() {
        let cache = MatchCache::new();
        let yes = CountingMatcher::new(true);
        let no = CountingMatcher::new(false);
        assert!(cache.decide(CallSiteId(100), locate_ok, &yes));
        assert!(!cache.decide(CallSiteId(200), locate_ok, &no));
        assert!(cache.decide(CallSiteId(100), locate_ok, &no));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear() {
        let cache = MatchCache::new();
        let matcher = CountingMatcher::new(true);
        for id in 0..100 {
            cache.decide(CallSiteId(id), locate_ok, &matcher);
        }
        assert_eq!(cache.len(), 100);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.decide(CallSiteId(5), locate_ok, &matcher));
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_racing_first_sight_agrees() {
        let cache = std::sync::Arc::new(MatchCache::new());
        let matcher = std::sync::Arc::new(CountingMatcher::new(true));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let matcher = matcher.clone();
                std::thread::spawn(move || cache.decide(CallSiteId(11), locate_ok, matcher.as_ref()))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(cache.len(), 1);
        assert!(matcher.calls.load(Ordering::SeqCst) <= 8);
    }

    #[test]
    fn test_decision_from_bool() {
        assert_eq!(MatchDecision::from(true), MatchDecision::Match);
        assert_eq!(MatchDecision::from(false), MatchDecision::NoMatch);
        assert!(!MatchDecision::Unknown.is_terminal());
    }
}
