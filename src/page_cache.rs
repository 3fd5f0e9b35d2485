//! Static-file response cache with mtime revalidation (spec.md §3 Page,
//! §4.7).
//!
//! Grounded on the teacher's `http::Resources`: an `ArcSwap`-backed,
//! read-mostly registry that lets readers take a lock-free snapshot while
//! a single writer installs a new value. The page cache uses the same
//! shape per path — many connection tasks read a `Page` concurrently, at
//! most one revalidation rebuilds it — which is exactly the "page cache
//! buckets are not locked; single writer convention" spec.md §5 calls for,
//! realized here as one `ArcSwap<Page>` per path behind a `DashMap`-free
//! `RwLock<HashMap<..>>` (the map's own shape changes only on first-miss
//! insertion and eviction, which are rare compared to reads).
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use log::warn;

use crate::handler::HandlerResponse;
use crate::mime::MimeTable;
use crate::text::Text;

const REVALIDATE_INTERVAL: Duration = Duration::from_secs(5);

struct Page {
    text: Text,
    mtime: SystemTime,
    last_check: Instant,
    immutable: bool,
}

/// A URL prefix mapped to an ordered list of filesystem directories to
/// search for static files (spec.md §3, Group/Dir).
#[derive(Clone, Debug)]
pub struct Group {
    pub prefix: String,
    pub dirs: Vec<PathBuf>,
}

/// The path-keyed static file cache.
pub struct PageCache {
    root: RwLock<Option<PathBuf>>,
    groups: RwLock<Vec<Group>>,
    pages: RwLock<HashMap<String, ArcSwap<Page>>>,
    mime: MimeTable,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Lookup {
    Hit(Text),
    NotFound,
    /// The request path contains a `../` traversal attempt.
    Rejected,
}

impl Default for PageCache {
    fn default() -> Self {
        PageCache {
            root: RwLock::new(None),
            groups: RwLock::new(Vec::new()),
            pages: RwLock::new(HashMap::new()),
            mime: MimeTable::new(),
        }
    }
}

impl PageCache {
    pub fn new() -> Self {
        PageCache::default()
    }

    pub fn set_root(&self, path: impl Into<PathBuf>) {
        *self.root.write().unwrap() = Some(path.into());
    }

    pub fn path_group(&self, prefix: impl Into<String>, dirs: Vec<PathBuf>) {
        self.groups.write().unwrap().push(Group { prefix: prefix.into(), dirs });
    }

    pub fn add_mime(&self, ext: &str, content_type: impl Into<String>) {
        self.mime.set(ext, content_type);
    }

    /// Looks up (and, on a stale or first hit, rebuilds) the cached
    /// response for `request_path`.
    pub async fn lookup(&self, request_path: &str) -> Lookup {
        if request_path.contains("../") {
            return Lookup::Rejected;
        }

        if let Some(page) = self.pages.read().unwrap().get(request_path) {
            let snapshot = page.load();
            if snapshot.immutable || snapshot.last_check.elapsed() < REVALIDATE_INTERVAL {
                return Lookup::Hit(snapshot.text.clone());
            }
        }

        self.resolve_and_cache(request_path).await
    }

    async fn resolve_and_cache(&self, request_path: &str) -> Lookup {
        let fs_path = match self.resolve_fs_path(request_path) {
            Some(p) => p,
            None => return Lookup::NotFound,
        };

        let metadata = match tokio::fs::metadata(&fs_path).await {
            Ok(m) => m,
            Err(_) => {
                self.pages.write().unwrap().remove(request_path);
                return Lookup::NotFound;
            }
        };
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if let Some(page) = self.pages.read().unwrap().get(request_path) {
            let snapshot = page.load();
            if snapshot.mtime == mtime {
                page.store(std::sync::Arc::new(Page {
                    text: snapshot.text.clone(),
                    mtime,
                    last_check: Instant::now(),
                    immutable: snapshot.immutable,
                }));
                return Lookup::Hit(snapshot.text.clone());
            }
        }

        let body = match tokio::fs::read(&fs_path).await {
            Ok(b) => b,
            Err(e) => {
                warn!("page cache: failed to read {}: {e}", fs_path.display());
                return Lookup::NotFound;
            }
        };
        let content_type = self.mime.lookup(request_path);
        let resp = HandlerResponse::with_body(200, body).header("Content-Type", content_type);
        let text = resp.render(false);

        let page = Page { text: text.clone(), mtime, last_check: Instant::now(), immutable: false };
        self.pages.write().unwrap().insert(request_path.to_string(), ArcSwap::new(std::sync::Arc::new(page)));
        Lookup::Hit(text)
    }

    /// Registers a page that never revalidates, for hosts that manage their
    /// own cache invalidation (spec.md §4.7: "Immutable entries, created by
    /// the host, never revalidate").
    pub fn insert_immutable(&self, request_path: &str, text: Text) {
        let page = Page { text, mtime: SystemTime::UNIX_EPOCH, last_check: Instant::now(), immutable: true };
        self.pages.write().unwrap().insert(request_path.to_string(), ArcSwap::new(std::sync::Arc::new(page)));
    }

    fn resolve_fs_path(&self, request_path: &str) -> Option<PathBuf> {
        let candidates = self.candidate_dirs(request_path);
        for (dir, rel) in candidates {
            let mut full = dir.join(&rel);
            if looks_like_directory(&rel) {
                full = full.join("index.html");
            }
            if full.exists() {
                return Some(full);
            }
        }
        None
    }

    /// Returns every `(base dir, relative path)` pair worth trying, in
    /// order: the longest-matching group prefix's directories, then the
    /// plain root (spec.md §4.7: "compose full path = root + path (or
    /// iterate a matching Group's directories)").
    fn candidate_dirs(&self, request_path: &str) -> Vec<(PathBuf, PathBuf)> {
        let groups = self.groups.read().unwrap();
        if let Some(group) = groups.iter().find(|g| request_path.starts_with(&g.prefix)) {
            let rel = request_path.strip_prefix(&group.prefix).unwrap_or(request_path);
            let rel = rel.trim_start_matches('/');
            return group.dirs.iter().map(|d| (d.clone(), PathBuf::from(rel))).collect();
        }
        match &*self.root.read().unwrap() {
            Some(root) => vec![(root.clone(), PathBuf::from(request_path.trim_start_matches('/')))],
            None => Vec::new(),
        }
    }
}

fn looks_like_directory(rel: &Path) -> bool {
    let s = rel.to_string_lossy();
    s.is_empty() || s.ends_with('/') || rel.extension().is_none()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("corehttpd-pagecache-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let cache = PageCache::new();
        cache.set_root(tempdir());
        assert_eq!(cache.lookup("/../etc/passwd").await, Lookup::Rejected);
    }

    #[tokio::test]
    async fn serves_a_file_and_chooses_mime_by_extension() {
        let dir = tempdir();
        let mut f = std::fs::File::create(dir.join("hello.txt")).unwrap();
        f.write_all(b"hi there").unwrap();

        let cache = PageCache::new();
        cache.set_root(dir);
        let hit = cache.lookup("/hello.txt").await;
        match hit {
            Lookup::Hit(text) => {
                let rendered = String::from_utf8_lossy(text.as_bytes()).into_owned();
                assert!(rendered.contains("Content-Type: text/plain"));
                assert!(rendered.ends_with("hi there"));
            }
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let cache = PageCache::new();
        cache.set_root(tempdir());
        assert_eq!(cache.lookup("/does-not-exist.txt").await, Lookup::NotFound);
    }

    #[tokio::test]
    async fn directory_index_resolves_to_index_html() {
        let dir = tempdir();
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        let mut f = std::fs::File::create(dir.join("sub").join("index.html")).unwrap();
        f.write_all(b"<html></html>").unwrap();

        let cache = PageCache::new();
        cache.set_root(dir);
        let hit = cache.lookup("/sub").await;
        assert!(matches!(hit, Lookup::Hit(_)));
    }
}
