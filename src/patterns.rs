//! Target pattern parsing and matching
//!
//! A targets file holds one pattern per line; blank lines and lines starting
//! with `#` are ignored.
//!
//! ```text
//! # every method of the connection pool
//! myapp::db:Pool::*
//!
//! # one function
//! myapp::http::client:send_request
//!
//! # everything in a module tree
//! myapp::cache*:*
//! ```
//!
//! Each pattern is `module_glob:name_glob`. The separator is the first single
//! `:`; the `::` of a Rust path never separates. Globs follow shell rules
//! (`*`, `?`, `[abc]`, `[!abc]`), are anchored at both ends and are
//! case-sensitive.

use crate::match_cache::CallSiteMatcher;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors in pattern syntax or targets files
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("line {line}: invalid pattern '{text}' - missing ':' separator, expected module_glob:name_glob")]
    MissingSeparator { line: usize, text: String },

    #[error("line {line}: empty module pattern in '{text}'")]
    EmptyModule { line: usize, text: String },

    #[error("line {line}: empty name pattern in '{text}'")]
    EmptyName { line: usize, text: String },

    #[error("line {line}: glob '{glob}' does not compile: {source}")]
    InvalidGlob {
        line: usize,
        glob: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot read targets file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A compiled `module_glob:name_glob` pattern
#[derive(Debug, Clone)]
pub struct TargetPattern {
    module_pattern: String,
    name_pattern: String,
    original: String,
    module_re: Regex,
    name_re: Regex,
}

impl TargetPattern {
    /// Module half of the pattern
    pub fn module_pattern(&self) -> &str {
        &self.module_pattern
    }

    /// Qualified-name half of the pattern
    pub fn name_pattern(&self) -> &str {
        &self.name_pattern
    }

    /// The pattern line as written
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Whether both halves match
    pub fn matches(&self, module: &str, qualified_name: &str) -> bool {
        self.module_re.is_match(module) && self.name_re.is_match(qualified_name)
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Find the first `:` that is not half of a `::`
fn find_separator(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            if bytes.get(i + 1) == Some(&b':') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Translate a shell glob into an anchored regex source
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 8);
    out.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    let mut j = i + 1;
                    out.push('[');
                    if chars[j] == '!' {
                        out.push('^');
                        j += 1;
                    }
                    for &c in &chars[j..end] {
                        if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = end;
                }
                None => out.push_str(r"\["),
            },
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `start`, if any
///
/// A `]` directly after `[` or `[!` is a literal member, as in fnmatch.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut j = start + 1;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    while j < chars.len() {
        if chars[j] == ']' {
            return Some(j);
        }
        j += 1;
    }
    None
}

fn compile_glob(glob: &str, line: usize) -> Result<Regex, PatternError> {
    Regex::new(&glob_to_regex(glob)).map_err(|source| PatternError::InvalidGlob {
        line,
        glob: glob.to_string(),
        source,
    })
}

/// Parse one pattern line (already trimmed)
pub fn parse_pattern(line: &str, line_number: usize) -> Result<TargetPattern, PatternError> {
    let Some(sep) = find_separator(line) else {
        return Err(PatternError::MissingSeparator {
            line: line_number,
            text: line.to_string(),
        });
    };

    let module_pattern = line[..sep].trim();
    let name_pattern = line[sep + 1..].trim();

    if module_pattern.is_empty() {
        return Err(PatternError::EmptyModule {
            line: line_number,
            text: line.to_string(),
        });
    }
    if name_pattern.is_empty() {
        return Err(PatternError::EmptyName {
            line: line_number,
            text: line.to_string(),
        });
    }

    Ok(TargetPattern {
        module_re: compile_glob(module_pattern, line_number)?,
        name_re: compile_glob(name_pattern, line_number)?,
        module_pattern: module_pattern.to_string(),
        name_pattern: name_pattern.to_string(),
        original: line.to_string(),
    })
}

/// Parse the contents of a targets file
pub fn parse_targets(text: &str) -> Result<Vec<TargetPattern>, PatternError> {
    let mut patterns = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        patterns.push(parse_pattern(line, idx + 1)?);
    }
    Ok(patterns)
}

/// Load and parse a targets file
pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<TargetPattern>, PatternError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| PatternError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_targets(&text)
}

/// Immutable, cheaply cloneable set of target patterns
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    patterns: Arc<[TargetPattern]>,
}

impl TargetSet {
    /// Wrap already compiled patterns
    pub fn new(patterns: Vec<TargetPattern>) -> Self {
        Self {
            patterns: patterns.into(),
        }
    }

    /// Compile descriptors such as those in an install configuration
    ///
    /// Line numbers in errors are the 1-based position in `descriptors`.
    pub fn compile<S: AsRef<str>>(descriptors: &[S]) -> Result<Self, PatternError> {
        let patterns = descriptors
            .iter()
            .enumerate()
            .map(|(idx, d)| parse_pattern(d.as_ref().trim(), idx + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetPattern> {
        self.patterns.iter()
    }

    /// Whether any pattern matches
    pub fn matches_any(&self, module: &str, qualified_name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches(module, qualified_name))
    }
}

impl CallSiteMatcher for TargetSet {
    fn matches(&self, module: &str, qualified_name: &str) -> anyhow::Result<bool> {
        Ok(self.matches_any(module, qualified_name))
    }
}
