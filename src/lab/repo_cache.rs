//! Process-wide cache of bare repository clones, keyed by remote URL.
//!
//! A bare clone is made at most once per URL and reused by every sandbox
//! after that, across runs as well since the clones live on disk. Clones
//! are staged under a temporary name and renamed into place, so a failed
//! or interrupted clone never leaves a half-populated entry behind.

use super::git;
use crate::util::sanitize_component;
use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

type Slot = Arc<Mutex<Option<PathBuf>>>;

const URL_DIGEST_BYTES: usize = 6;

pub struct RepoCache {
    root: PathBuf,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Advisory lock serializing clone-or-reuse for one URL across processes.
struct CloneLock {
    file: fs::File,
}

impl Drop for CloneLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl CloneLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open repo lock '{}'", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock '{}'", path.display()))?;
        Ok(Self { file })
    }
}

impl RepoCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the bare clone for `url`, cloning it first if needed.
    ///
    /// Concurrent callers for the same URL wait for a single clone; callers
    /// for different URLs do not block each other. A failed clone leaves the
    /// slot empty so a later attempt can try again.
    pub fn bare_repo(&self, url: &str) -> Result<PathBuf> {
        let slot = self.slot(url);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }
        let path = self.populate(url)?;
        *cached = Some(path.clone());
        Ok(path)
    }

    fn slot(&self, url: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(url.to_string()).or_default())
    }

    fn populate(&self, url: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create repo cache '{}'", self.root.display())
        })?;
        let name = bare_repo_dir_name(url);
        let dest = self.root.join(&name);
        let _lock = CloneLock::acquire(&self.root.join(format!("{}.lock", name)))?;

        if dest.join("HEAD").exists() {
            debug!(url, path = %dest.display(), "reusing cached bare repo");
            return Ok(dest);
        }
        if dest.exists() {
            fs::remove_dir_all(&dest).with_context(|| {
                format!("Failed to clear incomplete cache entry '{}'", dest.display())
            })?;
        }

        let staging = self
            .root
            .join(format!(".{}.partial-{}", name, Uuid::new_v4().simple()));
        info!(url, path = %dest.display(), "cloning bare repo");
        if let Err(err) = git::clone_bare(url, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        if let Err(err) = fs::rename(&staging, &dest) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err).with_context(|| {
                format!("Failed to move bare clone into '{}'", dest.display())
            });
        }
        Ok(dest)
    }
}

/// Directory name for the bare clone of `url`: the last two path segments
/// (`owner__name`) for readability, then a digest of the whole URL so
/// mirrors and same-named local paths never share an entry.
pub fn bare_repo_dir_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let location = match Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() || parsed.scheme() == "file" => parsed.path().to_string(),
        _ => match trimmed.split_once(':') {
            // scp-style remote: git@host:owner/name.git
            Some((prefix, rest)) if prefix.contains('@') => rest.to_string(),
            _ => trimmed.to_string(),
        },
    };
    let segments: Vec<&str> = location
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let tail = &segments[segments.len().saturating_sub(2)..];
    let joined = tail.join("__");
    let stem = joined.strip_suffix(".git").unwrap_or(&joined);
    format!("{}-{}.git", sanitize_component(stem), url_digest(trimmed))
}

fn url_digest(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest[..URL_DIGEST_BYTES]
        .iter()
        .fold(String::with_capacity(URL_DIGEST_BYTES * 2), |mut out, byte| {
            let _ = write!(out, "{:02x}", byte);
            out
        })
}

#[cfg(test)]
impl RepoCache {
    /// Already-known bare clone for `url`, without touching the disk.
    fn cached_path(&self, url: &str) -> Option<PathBuf> {
        let slot = self.slot(url);
        let cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        cached.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::git::test_support::{git, init_repo, source_repo};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn dir_name_uses_owner_and_repo() {
        let name = bare_repo_dir_name("https://github.com/django/django");
        assert!(name.starts_with("django__django-"), "{}", name);
        assert!(name.ends_with(".git"));
        assert_eq!(name.len(), "django__django-".len() + 12 + ".git".len());

        for (url, prefix) in [
            ("https://github.com/psf/requests.git/", "psf__requests-"),
            ("git@github.com:sympy/sympy.git", "sympy__sympy-"),
            ("/tmp/work/source", "work__source-"),
            ("file:///srv/git/app.git", "git__app-"),
        ] {
            let name = bare_repo_dir_name(url);
            assert!(name.starts_with(prefix), "{} -> {}", url, name);
        }
    }

    #[test]
    fn dir_name_is_stable_and_ignores_a_trailing_slash() {
        assert_eq!(
            bare_repo_dir_name("https://github.com/psf/requests"),
            bare_repo_dir_name("https://github.com/psf/requests/")
        );
    }

    #[test]
    fn urls_sharing_owner_and_name_get_separate_entries() {
        assert_ne!(
            bare_repo_dir_name("https://github.com/team/app"),
            bare_repo_dir_name("https://gitlab.com/team/app")
        );

        let roots = (tempdir().unwrap(), tempdir().unwrap());
        let repo_a = roots.0.path().join("team").join("app");
        let repo_b = roots.1.path().join("team").join("app");
        let head_a = init_repo(&repo_a, "a = 1\n");
        let head_b = init_repo(&repo_b, "b = 2\n");

        let cache_root = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());
        let bare_a = cache.bare_repo(&repo_a.to_string_lossy()).unwrap();
        let bare_b = cache.bare_repo(&repo_b.to_string_lossy()).unwrap();
        assert_ne!(bare_a, bare_b);
        assert_eq!(git(&bare_a, &["rev-parse", "HEAD"]), head_a);
        assert_eq!(git(&bare_b, &["rev-parse", "HEAD"]), head_b);
    }

    #[test]
    fn bare_repo_clones_once_and_reuses_the_entry() {
        let (_src, repo, _first, _second) = source_repo();
        let cache_root = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());
        let url = repo.to_string_lossy().to_string();

        assert!(cache.cached_path(&url).is_none());
        let first = cache.bare_repo(&url).unwrap();
        assert!(first.join("HEAD").exists());

        // A marker inside the clone survives a second lookup, so nothing was re-cloned.
        std::fs::write(first.join("marker"), "x").unwrap();
        let second = cache.bare_repo(&url).unwrap();
        assert_eq!(first, second);
        assert!(second.join("marker").exists());
        assert_eq!(cache.cached_path(&url), Some(first));
    }

    #[test]
    fn on_disk_clone_is_reused_by_a_new_cache() {
        let (_src, repo, _first, _second) = source_repo();
        let cache_root = tempdir().unwrap();
        let url = repo.to_string_lossy().to_string();

        let path = RepoCache::new(cache_root.path()).bare_repo(&url).unwrap();
        std::fs::write(path.join("marker"), "x").unwrap();

        let reopened = RepoCache::new(cache_root.path()).bare_repo(&url).unwrap();
        assert_eq!(reopened, path);
        assert!(reopened.join("marker").exists());
    }

    #[test]
    fn concurrent_lookups_share_one_clone() {
        let (_src, repo, _first, _second) = source_repo();
        let cache_root = tempdir().unwrap();
        let cache = Arc::new(RepoCache::new(cache_root.path()));
        let url = repo.to_string_lossy().to_string();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let url = url.clone();
                thread::spawn(move || cache.bare_repo(&url).unwrap())
            })
            .collect();
        let paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));

        let leftovers: Vec<_> = std::fs::read_dir(cache_root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".partial-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_clone_leaves_no_entry_and_can_be_retried() {
        let cache_root = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());
        let missing = cache_root.path().join("nowhere").join("repo");
        let url = missing.to_string_lossy().to_string();

        assert!(cache.bare_repo(&url).is_err());
        assert!(cache.cached_path(&url).is_none());
        assert!(!cache_root.path().join(bare_repo_dir_name(&url)).exists());
        assert!(cache.bare_repo(&url).is_err());
    }
}
