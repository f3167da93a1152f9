//! Native function probes through the speedbump kernel module
//!
//! The kernel module attaches uprobes to symbols of compiled binaries and
//! holds the probed calls for a fixed delay, filtered to one process tree.
//! It is driven by one command per write to its sysfs control file:
//!
//! ```text
//! +/usr/bin/python3:PyObject_GetAttr 1000 pid=4242   add
//! -/usr/bin/python3:PyObject_GetAttr                 remove
//! ```
//!
//! # Example
//! ```no_run
//! use speedbump::native::{NativeProbes, NativeTarget};
//!
//! let probes = NativeProbes::new();
//! if probes.is_available() {
//!     let target = NativeTarget::new("/usr/bin/python3", "PyObject_GetAttr").with_delay(1_000);
//!     let _guard = probes.probe(target).unwrap();
//!     // calls to PyObject_GetAttr from this process are delayed here
//! }
//! ```

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Control file exposed by the kernel module
pub const SYSFS_TARGETS: &str = "/sys/kernel/speed_bump/targets";

/// Errors from driving the kernel module
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("speedbump kernel module not available at {}", path.display())]
    Unavailable { path: PathBuf },

    #[error("failed to write probe command to {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Format an add command; `pid` defaults to the current process
pub fn format_add_spec(binary: &Path, symbol: &str, delay_ns: u64, pid: Option<u32>) -> String {
    let pid = pid.unwrap_or_else(std::process::id);
    format!("+{}:{} {} pid={}", binary.display(), symbol, delay_ns, pid)
}

/// Format a remove command
pub fn format_remove_spec(binary: &Path, symbol: &str) -> String {
    format!("-{}:{}", binary.display(), symbol)
}

/// One native symbol to delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTarget {
    pub binary: PathBuf,
    pub symbol: String,
    pub delay_ns: u64,
    /// Process whose tree is affected; `None` means this process
    pub pid: Option<u32>,
}

impl NativeTarget {
    pub fn new(binary: impl Into<PathBuf>, symbol: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            symbol: symbol.into(),
            delay_ns: 0,
            pid: None,
        }
    }

    pub fn with_delay(mut self, delay_ns: u64) -> Self {
        self.delay_ns = delay_ns;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn add_spec(&self) -> String {
        format_add_spec(&self.binary, &self.symbol, self.delay_ns, self.pid)
    }

    pub fn remove_spec(&self) -> String {
        format_remove_spec(&self.binary, &self.symbol)
    }
}

/// Writer for the kernel module's control file
#[derive(Debug, Clone)]
pub struct NativeProbes {
    path: PathBuf,
}

impl Default for NativeProbes {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeProbes {
    /// Drive the module through [`SYSFS_TARGETS`]
    pub fn new() -> Self {
        Self::with_path(SYSFS_TARGETS)
    }

    /// Drive the module through another control file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the control file exists and this process may write it
    pub fn is_available(&self) -> bool {
        if !self.path.exists() {
            return false;
        }
        let Ok(c_path) = CString::new(self.path.as_os_str().as_bytes()) else {
            return false;
        };
        // SAFETY: `c_path` is a valid NUL-terminated string for the call.
        unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
    }

    /// Start delaying `target`
    pub fn add(&self, target: &NativeTarget) -> Result<(), NativeError> {
        self.write_command(&target.add_spec())?;
        tracing::info!(
            binary = %target.binary.display(),
            symbol = %target.symbol,
            delay_ns = target.delay_ns,
            "native probe added"
        );
        Ok(())
    }

    /// Stop delaying `target`
    pub fn remove(&self, target: &NativeTarget) -> Result<(), NativeError> {
        self.write_command(&target.remove_spec())?;
        tracing::info!(
            binary = %target.binary.display(),
            symbol = %target.symbol,
            "native probe removed"
        );
        Ok(())
    }

    /// Add `target` until the returned guard is dropped
    pub fn probe(&self, target: NativeTarget) -> Result<NativeProbeGuard, NativeError> {
        self.add(&target)?;
        Ok(NativeProbeGuard {
            probes: self.clone(),
            target,
        })
    }

    fn write_command(&self, command: &str) -> Result<(), NativeError> {
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => NativeError::Unavailable {
                    path: self.path.clone(),
                },
                _ => NativeError::Write {
                    path: self.path.clone(),
                    source,
                },
            })?;
        tracing::debug!(command, "writing native probe command");
        file.write_all(command.as_bytes())
            .map_err(|source| NativeError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// Removes its probe when dropped
#[derive(Debug)]
#[must_use = "dropping the guard removes the probe immediately"]
pub struct NativeProbeGuard {
    probes: NativeProbes,
    target: NativeTarget,
}

impl NativeProbeGuard {
    pub fn target(&self) -> &NativeTarget {
        &self.target
    }
}

impl Drop for NativeProbeGuard {
    fn drop(&mut self) {
        if let Err(err) = self.probes.remove(&self.target) {
            tracing::warn!(error = %err, symbol = %self.target.symbol, "failed to remove native probe");
        }
    }
}
