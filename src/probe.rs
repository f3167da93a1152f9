//! Compile-time call-site probes
//!
//! A Rust program has no runtime hook that announces every function entry, so
//! the instrumentation point is placed in source instead:
//!
//! ```
//! fn fetch_row(id: u64) -> u64 {
//!     speedbump::probe!();
//!     id * 2
//! }
//! # assert_eq!(fetch_row(2), 4);
//! ```
//!
//! Each expansion declares a `static` [`StaticSite`]; its address is the
//! site's [`CallSiteId`], stable for the life of the process and distinct from
//! every other probe. The module id is `module_path!()` and the qualified name
//! is the enclosing function's path relative to that module (`Pool::get`,
//! `fetch_row`, `handler::{{closure}}`), derived from the type name of a
//! nested anchor function. Methods of trait impls are named after the
//! implementing type, so `impl Store for Disk { fn put() }` is `Disk::put`.
//!
//! `probe!()` fires the process-wide engine; when nothing is installed it
//! costs one atomic load. `probe!(&engine)` fires a specific [`EngineHandle`].

use crate::engine::{self, CallOutcome, EngineHandle};
use crate::match_cache::{CallSiteId, CallSiteInfo};
use std::borrow::Cow;

/// Suffix every anchor type name carries
pub const ANCHOR_SUFFIX: &str = "::__speedbump_anchor";

/// One probe location
#[derive(Debug)]
pub struct StaticSite {
    module: &'static str,
}

impl StaticSite {
    pub const fn new(module: &'static str) -> Self {
        Self { module }
    }

    /// Identity of this site (its address)
    #[inline]
    pub fn id(&'static self) -> CallSiteId {
        CallSiteId(self as *const Self as usize as u64)
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    /// Report a call to the process-wide engine, if one is installed
    #[inline]
    pub fn fire(&'static self, anchor: &'static str) -> CallOutcome {
        match engine::installed_global() {
            Some(engine) => self.fire_on(engine, anchor),
            None => CallOutcome::Inactive,
        }
    }

    /// Report a call to `engine`
    #[inline]
    pub fn fire_on(&'static self, engine: &EngineHandle, anchor: &'static str) -> CallOutcome {
        let module = self.module;
        engine.on_call(self.id(), move || {
            Ok(CallSiteInfo::new(module, qualified_name(module, anchor)))
        })
    }
}

/// Type name of the anchor function passed in
pub fn anchor_name<F: Fn()>(_anchor: F) -> &'static str {
    std::any::type_name::<F>()
}

/// Enclosing function path relative to `module`
///
/// `anchor` is the full type name of the probe's anchor function. Trait-impl
/// paths (`<app::Disk as app::Store>::put`) are reduced to the implementing
/// type (`Disk::put`). Falls back to the whole path when it does not start
/// with `module`.
pub fn qualified_name(module: &str, anchor: &'static str) -> Cow<'static, str> {
    let path = anchor.strip_suffix(ANCHOR_SUFFIX).unwrap_or(anchor);
    match split_trait_impl(path) {
        Some((self_ty, rest)) => {
            let self_ty = strip_generics(strip_module(module, self_ty));
            Cow::Owned(format!("{}{}", self_ty, rest))
        }
        None => Cow::Borrowed(strip_module(module, path)),
    }
}

fn strip_module<'p>(module: &str, path: &'p str) -> &'p str {
    path.strip_prefix(module)
        .and_then(|rest| rest.strip_prefix("::"))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(path)
}

/// `<T as Trait>::rest` into `(T, "::rest")`
fn split_trait_impl(path: &str) -> Option<(&str, &str)> {
    let inner_start = path.strip_prefix('<')?;
    let mut depth = 1usize;
    let mut close = None;
    for (idx, c) in inner_start.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let close = close?;
    let inner = &inner_start[..close];
    let rest = &inner_start[close + 1..];

    // Top-level " as " separates the self type from the trait
    let mut depth = 0usize;
    for (idx, byte) in inner.bytes().enumerate() {
        match byte {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b' ' if depth == 0 && inner[idx..].starts_with(" as ") => {
                return Some((&inner[..idx], rest));
            }
            _ => {}
        }
    }
    Some((inner, rest))
}

fn strip_generics(ty: &str) -> &str {
    ty.find('<').map_or(ty, |idx| &ty[..idx])
}

/// Mark a call site for latency injection
///
/// Evaluates to the [`CallOutcome`] of the event.
#[macro_export]
macro_rules! probe {
    () => {{
        fn __speedbump_anchor() {}
        static __SPEEDBUMP_SITE: $crate::probe::StaticSite =
            $crate::probe::StaticSite::new(::core::module_path!());
        __SPEEDBUMP_SITE.fire($crate::probe::anchor_name(__speedbump_anchor))
    }};
    ($engine:expr) => {{
        fn __speedbump_anchor() {}
        static __SPEEDBUMP_SITE: $crate::probe::StaticSite =
            $crate::probe::StaticSite::new(::core::module_path!());
        __SPEEDBUMP_SITE.fire_on($engine, $crate::probe::anchor_name(__speedbump_anchor))
    }};
}
