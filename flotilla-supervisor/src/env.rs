//! Environment derivation for child processes.
//!
//! The supervisor keeps its children's environment as an ordered list of
//! `KEY=value` entries, the same shape the OS hands to `execve`. Order
//! matters only for [`dedup_env`], where the first occurrence of a name wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Prefix of every variable the supervisor itself sets; inherited ones are
/// dropped so a parent run cannot bleed into a child run.
pub const RESERVED_PREFIX: &str = "FLOTILLA_";

/// Location of the resolved cluster config, read by every child
pub const CONFIG_ENV: &str = "FLOTILLA_CONFIG";

/// The InternalURL a service-command child should listen on
pub const SERVICE_URL_ENV: &str = "FLOTILLA_SERVICE_INTERNAL_URL";

/// Non-empty and not `0` turns on debug logging, for the supervisor and
/// for the app servers it starts
pub const DEBUG_ENV: &str = "FLOTILLA_DEBUG";

/// True if the supervisor was started with [`DEBUG_ENV`] set
pub fn debug_requested() -> bool {
    std::env::var(DEBUG_ENV).is_ok_and(|v| !v.is_empty() && v != "0")
}

/// Ordered `KEY=value` environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environ {
    entries: Vec<String>,
}

impl Environ {
    /// Snapshot of the supervisor's own environment
    pub fn inherit() -> Self {
        Self {
            entries: std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect(),
        }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Drop every entry that starts with one of `prefixes`.
    ///
    /// Prefixes are matched against the whole `KEY=value` string, so
    /// `"GEM_HOME="` removes exactly that variable while `"FLOTILLA_"`
    /// removes a family.
    pub fn clean(&mut self, prefixes: &[&str]) {
        self.entries
            .retain(|entry| !prefixes.iter().any(|p| entry.starts_with(p)));
    }

    /// Replace `key` in place, or append it
    pub fn set(&mut self, key: &str, value: &str) {
        let needle = format!("{}=", key);
        let entry = format!("{}={}", key, value);
        match self.entries.iter_mut().find(|e| e.starts_with(&needle)) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Put `prefix` in front of the current value of `key` (for PATH-like
    /// variables the caller includes the separator)
    pub fn prepend(&mut self, key: &str, prefix: &str) {
        let needle = format!("{}=", key);
        match self.entries.iter_mut().find(|e| e.starts_with(&needle)) {
            Some(existing) => {
                let old = existing[needle.len()..].to_string();
                *existing = format!("{}{}{}", needle, prefix, old);
            }
            None => self.entries.push(format!("{}{}", needle, prefix)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let needle = format!("{}=", key);
        self.entries
            .iter()
            .find_map(|e| e.strip_prefix(needle.as_str()))
    }

    /// Resolve `program` against this environment's PATH rather than the
    /// supervisor's own. Names containing a slash are returned as given.
    pub fn look_path(&self, program: &str, cwd: &Path) -> Option<PathBuf> {
        if program.contains('/') {
            return Some(PathBuf::from(program));
        }
        let path = self.get("PATH")?;
        which::which_in(program, Some(path), cwd).ok()
    }
}

/// Split entries into pairs, keeping only the first occurrence of each name.
///
/// Entries without a `=` or with an empty name are skipped.
pub fn dedup_env<I, S>(entries: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.as_ref();
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if key.is_empty() || !seen.insert(key.to_string()) {
            continue;
        }
        out.push((key.to_string(), value.to_string()));
    }
    out
}

#[cfg(test)]
mod tests;
