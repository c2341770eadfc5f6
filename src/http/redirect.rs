//! Path redirect table
//!
//! Maps request URLs to locally served responses. Entries are consulted by
//! kind (custom, then file, then folder) and in configuration order within a
//! kind.

use crate::config::{Fallback, RedirectKind, RedirectRule};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// What to answer instead of forwarding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Fixed response
    Custom {
        /// Status code
        status: u16,
        /// Content type
        content_type: String,
        /// Extra headers
        headers: Vec<(String, String)>,
        /// Body
        body: String,
    },
    /// Serve a local file
    File(PathBuf),
    /// Answer 404
    NotFound,
}

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Prefix(String),
}

#[derive(Debug)]
struct Entry {
    matcher: Matcher,
    rule: RedirectRule,
}

/// Ordered redirect entries
#[derive(Debug, Default)]
pub struct PathRedirects {
    entries: RwLock<Vec<Entry>>,
}

impl PathRedirects {
    /// Table built from configured rules
    pub fn new(rules: &[RedirectRule]) -> Result<Self> {
        let table = Self::default();
        for rule in rules {
            table.add(rule.clone())?;
        }
        Ok(table)
    }

    /// Append an entry
    pub fn add(&self, rule: RedirectRule) -> Result<()> {
        let matcher = match rule.kind {
            RedirectKind::Folder => Matcher::Prefix(rule.pattern.clone()),
            RedirectKind::Custom | RedirectKind::File => Matcher::Regex(
                Regex::new(&rule.pattern)
                    .with_context(|| format!("Invalid redirect pattern: {}", rule.pattern))?,
            ),
        };
        if rule.kind == RedirectKind::Custom {
            rule.target
                .parse::<u16>()
                .with_context(|| format!("Redirect {} needs a numeric status", rule.pattern))?;
        }
        self.entries.write().push(Entry { matcher, rule });
        Ok(())
    }

    /// Remove every entry with this pattern
    pub fn remove(&self, pattern: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.rule.pattern != pattern);
        entries.len() != before
    }

    /// Configured rules in insertion order
    pub fn list(&self) -> Vec<RedirectRule> {
        self.entries.read().iter().map(|e| e.rule.clone()).collect()
    }

    /// Local answer for `url`, if any
    ///
    /// A file or folder entry whose target is missing yields `None` (forward
    /// the request) or [`Redirect::NotFound`], per its fallback. The table
    /// lock is released before the file system is consulted.
    pub async fn lookup(&self, url: &str) -> Option<Redirect> {
        let matched = {
            let entries = self.entries.read();
            [RedirectKind::Custom, RedirectKind::File, RedirectKind::Folder]
                .into_iter()
                .find_map(|kind| {
                    entries
                        .iter()
                        .filter(|e| e.rule.kind == kind)
                        .find_map(|entry| resolve(entry, url))
                })
        }?;
        let found = match matched {
            Matched::Answer(redirect) => Some(redirect),
            Matched::Path(path, fallback) => serve_path(path, fallback).await,
        };
        debug!("redirect {} >>> {:?}", url, found);
        found
    }
}

/// First matching entry, resolved as far as possible without I/O
enum Matched {
    Answer(Redirect),
    Path(PathBuf, Fallback),
}

fn resolve(entry: &Entry, url: &str) -> Option<Matched> {
    let rule = &entry.rule;
    match (&entry.matcher, rule.kind) {
        (Matcher::Regex(re), RedirectKind::Custom) if re.is_match(url) => {
            Some(Matched::Answer(Redirect::Custom {
                status: rule.target.parse().unwrap_or(200),
                content_type: rule
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "text/plain".to_string()),
                headers: rule
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                body: rule.body.clone(),
            }))
        }
        (Matcher::Regex(re), RedirectKind::File) if re.is_match(url) => {
            Some(Matched::Path(PathBuf::from(&rule.target), rule.fallback))
        }
        (Matcher::Prefix(prefix), RedirectKind::Folder) => {
            let rest = url.strip_prefix(prefix.as_str())?;
            let rest = rest.split(['?', '#']).next().unwrap_or_default();
            match folder_path(Path::new(&rule.target), rest) {
                Some(path) => Some(Matched::Path(path, rule.fallback)),
                None => Some(Matched::Answer(Redirect::NotFound)),
            }
        }
        _ => None,
    }
}

async fn serve_path(path: PathBuf, fallback: Fallback) -> Option<Redirect> {
    let is_file = tokio::fs::metadata(&path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if is_file {
        return Some(Redirect::File(path));
    }
    debug!("redirect target {:?} missing", path);
    match fallback {
        Fallback::Source => None,
        Fallback::NotFound => Some(Redirect::NotFound),
    }
}

/// Join a URL sub-path under `dir`, refusing to leave it
fn folder_path(dir: &Path, sub: &str) -> Option<PathBuf> {
    let sub = Path::new(sub.trim_start_matches('/'));
    let mut path = dir.to_path_buf();
    for component in sub.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

/// Content type guessed from the file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("crt") | Some("der") => "application/x-x509-ca-cert",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rule(pattern: &str, kind: RedirectKind, target: &str) -> RedirectRule {
        RedirectRule {
            pattern: pattern.into(),
            kind,
            target: target.into(),
            body: String::new(),
            content_type: None,
            headers: HashMap::new(),
            fallback: Fallback::Source,
        }
    }

    #[tokio::test]
    async fn test_custom_redirect() {
        let mut r = rule("^http://ads\\.", RedirectKind::Custom, "204");
        r.headers.insert("X-Blocked".into(), "1".into());
        let table = PathRedirects::new(&[r]).unwrap();

        match table.lookup("http://ads.example.com/banner.js").await {
            Some(Redirect::Custom {
                status,
                content_type,
                headers,
                ..
            }) => {
                assert_eq!(status, 204);
                assert_eq!(content_type, "text/plain");
                assert_eq!(headers, vec![("X-Blocked".to_string(), "1".to_string())]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(table.lookup("http://example.com/").await.is_none());
    }

    #[tokio::test]
    async fn test_custom_checked_before_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        let table = PathRedirects::new(&[
            rule("example", RedirectKind::File, file.to_str().unwrap()),
            rule("example", RedirectKind::Custom, "418"),
        ])
        .unwrap();
        assert!(matches!(
            table.lookup("http://example.com/").await,
            Some(Redirect::Custom { status: 418, .. })
        ));
    }

    #[tokio::test]
    async fn test_file_redirect_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.js");
        std::fs::write(&file, "console.log(1)").unwrap();

        let mut missing = rule("missing\\.js$", RedirectKind::File, "/nonexistent/file.js");
        missing.fallback = Fallback::NotFound;
        let table = PathRedirects::new(&[
            rule("app\\.js$", RedirectKind::File, file.to_str().unwrap()),
            missing,
            rule("gone\\.js$", RedirectKind::File, "/nonexistent/gone.js"),
        ])
        .unwrap();

        assert_eq!(
            table.lookup("http://cdn.test/app.js").await,
            Some(Redirect::File(file))
        );
        assert_eq!(
            table.lookup("http://cdn.test/missing.js").await,
            Some(Redirect::NotFound)
        );
        assert_eq!(table.lookup("http://cdn.test/gone.js").await, None);
    }

    #[tokio::test]
    async fn test_folder_redirect() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        let css = dir.path().join("css").join("site.css");
        std::fs::write(&css, "body{}").unwrap();
        let mut r = rule("http://static.test/", RedirectKind::Folder, dir.path().to_str().unwrap());
        r.fallback = Fallback::NotFound;
        let table = PathRedirects::new(&[r]).unwrap();

        assert_eq!(
            table.lookup("http://static.test/css/site.css?v=3").await,
            Some(Redirect::File(css))
        );
        assert_eq!(
            table.lookup("http://static.test/css/none.css").await,
            Some(Redirect::NotFound)
        );
        assert_eq!(
            table.lookup("http://static.test/../etc/passwd").await,
            Some(Redirect::NotFound)
        );
        assert_eq!(table.lookup("http://other.test/css/site.css").await, None);
    }

    #[tokio::test]
    async fn test_lookup_does_not_block_writers() {
        fn assert_send<T: Send>(_: &T) {}
        let dir = tempfile::tempdir().unwrap();
        let mut r = rule("http://static.test/", RedirectKind::Folder, dir.path().to_str().unwrap());
        r.fallback = Fallback::NotFound;
        let table = PathRedirects::new(&[r]).unwrap();

        let pending = table.lookup("http://static.test/late.txt");
        assert_send(&pending);
        table.add(rule("^http://x\\.", RedirectKind::Custom, "204")).unwrap();
        assert_eq!(pending.await, Some(Redirect::NotFound));
        assert_eq!(table.list().len(), 2);
    }

    #[test]
    fn test_add_remove_list() {
        let table = PathRedirects::default();
        table.add(rule("^a", RedirectKind::Custom, "200")).unwrap();
        assert!(table.add(rule("(", RedirectKind::Custom, "200")).is_err());
        assert!(table.add(rule("^b", RedirectKind::Custom, "ok")).is_err());
        assert_eq!(table.list().len(), 1);
        assert!(table.remove("^a"));
        assert!(!table.remove("^a"));
        assert!(table.list().is_empty());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }
}
