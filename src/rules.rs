//! Host rules consulted by the dialer
//!
//! [`HostMapping`] rewrites a requested host before resolution and
//! [`LocalOnlyList`] decides which hosts bypass the tunnel.

use crate::socks::TargetAddr;
use anyhow::{bail, Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Exact host to host rewrite table
#[derive(Debug, Default)]
pub struct HostMapping {
    table: RwLock<HashMap<String, String>>,
}

impl HostMapping {
    /// Mapping seeded from `entries`
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            table: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Mapped host, or `host` itself when no entry exists
    pub fn get(&self, host: &str) -> String {
        match self.table.read().get(host) {
            Some(mapped) => {
                debug!("host map: {} >>> {}", host, mapped);
                mapped.clone()
            }
            None => host.to_string(),
        }
    }

    /// Apply the mapping to a target, keeping its port
    pub fn map_target(&self, target: &TargetAddr) -> TargetAddr {
        let host = target.host();
        let mapped = self.get(&host);
        if mapped == host {
            target.clone()
        } else {
            target.with_host(&mapped)
        }
    }

    /// Add or replace an entry
    pub fn add(&self, host: impl Into<String>, target: impl Into<String>) {
        self.table.write().insert(host.into(), target.into());
    }

    /// Remove an entry
    pub fn remove(&self, host: &str) -> Option<String> {
        self.table.write().remove(host)
    }

    /// Copy of the current table
    pub fn list(&self) -> HashMap<String, String> {
        self.table.read().clone()
    }
}

/// Regex list of hosts that are always dialed directly
///
/// Patterns added inline survive a [`reload`](LocalOnlyList::reload); those
/// read from the file are replaced by it.
#[derive(Debug, Default)]
pub struct LocalOnlyList {
    patterns: RwLock<Vec<Regex>>,
    from_file: RwLock<Vec<Regex>>,
    file: Option<PathBuf>,
}

impl LocalOnlyList {
    /// List built from inline patterns and an optional pattern file
    ///
    /// Inline patterns must compile; bad lines in the file are skipped.
    pub fn new(patterns: &[String], file: Option<PathBuf>) -> Result<Self> {
        let list = Self {
            patterns: RwLock::new(Vec::new()),
            from_file: RwLock::new(Vec::new()),
            file,
        };
        for pattern in patterns {
            list.add(pattern)?;
        }
        if list.file.is_some() {
            list.reload()?;
        }
        Ok(list)
    }

    /// Whether `host` matches any pattern
    pub fn is_local_only(&self, host: &str) -> bool {
        self.patterns.read().iter().any(|r| r.is_match(host))
            || self.from_file.read().iter().any(|r| r.is_match(host))
    }

    /// Append a pattern
    pub fn add(&self, expr: &str) -> Result<()> {
        let regex =
            Regex::new(expr).with_context(|| format!("Invalid local-only pattern: {}", expr))?;
        self.patterns.write().push(regex);
        Ok(())
    }

    /// Remove the first pattern whose source equals `expr`
    pub fn remove(&self, expr: &str) -> bool {
        for list in [&self.patterns, &self.from_file] {
            let mut patterns = list.write();
            if let Some(pos) = patterns.iter().position(|r| r.as_str() == expr) {
                patterns.remove(pos);
                return true;
            }
        }
        false
    }

    /// Pattern sources in match order
    pub fn list(&self) -> Vec<String> {
        let inline = self.patterns.read();
        let from_file = self.from_file.read();
        inline
            .iter()
            .chain(from_file.iter())
            .map(|r| r.as_str().to_string())
            .collect()
    }

    /// Re-read the pattern file, replacing the patterns it supplied
    ///
    /// Without a configured file this is a no-op.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let fresh = parse_pattern_file(path)?;
        info!("Loaded {} local-only patterns from {:?}", fresh.len(), path);
        *self.from_file.write() = fresh;
        Ok(())
    }
}

/// Reloads a [`LocalOnlyList`] whenever its pattern file changes
///
/// Watching stops when this value is dropped.
pub struct LocalOnlyWatcher {
    _watcher: RecommendedWatcher,
}

impl LocalOnlyWatcher {
    /// Watch the list's pattern file; `Ok(None)` when it has none
    pub fn spawn(list: Arc<LocalOnlyList>) -> Result<Option<Self>> {
        let Some(path) = list.file.clone() else {
            return Ok(None);
        };
        // Editors replace files, so watch the directory rather than the file.
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            bail!("Local-only file has no parent directory: {:?}", path);
        };
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };

        let file_name = path.file_name().map(|n| n.to_os_string());
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let touches_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !touches_file {
                        return;
                    }
                    match event.kind {
                        EventKind::Modify(_) | EventKind::Create(_) => {
                            if let Err(e) = list.reload() {
                                warn!("Local-only reload failed: {:#}", e);
                            }
                        }
                        EventKind::Remove(_) => {
                            warn!("Local-only file removed, keeping current patterns")
                        }
                        _ => {}
                    }
                }
                Err(e) => error!("Local-only watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create local-only file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;
        info!("Watching {:?} for local-only changes", path);
        Ok(Some(Self { _watcher: watcher }))
    }
}

fn parse_pattern_file(path: &Path) -> Result<Vec<Regex>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read local-only file: {:?}", path))?;
    let mut patterns = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Regex::new(line) {
            Ok(regex) => patterns.push(regex),
            Err(e) => warn!("Skipping local-only pattern {:?}: {}", line, e),
        }
    }
    Ok(patterns)
}
