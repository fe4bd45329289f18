use super::git;
use super::repo_cache::RepoCache;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SANDBOX_PREFIX: &str = "patchbench-sandbox-";

/// Disposable working copy of a repository at one commit, owned by a single trial.
///
/// The directory is removed when the sandbox is dropped, whichever way the
/// trial ended.
#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
    base_commit: String,
}

impl Sandbox {
    /// Check out `commit` of `repo_url` into a fresh temporary directory,
    /// cloning the bare repo into `cache` first if this URL was never seen.
    pub fn provision(
        cache: &RepoCache,
        repo_url: &str,
        commit: &str,
        scratch_root: Option<&Path>,
    ) -> Result<Self> {
        let bare = cache.bare_repo(repo_url)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix(SANDBOX_PREFIX);
        let dir = match scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).with_context(|| {
                    format!("Failed to create sandbox root '{}'", root.display())
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .context("Failed to create sandbox directory")?;

        // On error `dir` is dropped here, taking the partial checkout with it.
        git::clone_working_copy(&bare, dir.path())?;
        git::checkout_detached(dir.path(), commit)?;

        Ok(Self {
            dir,
            base_commit: commit.to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Unified diff of the current tree against the base commit.
    pub fn diff_versus_base(&self) -> Result<String> {
        git::diff_versus_commit(self.path(), &self.base_commit)
    }

    /// Remove the sandbox now and report failures, instead of on drop.
    pub fn cleanup(self) -> Result<()> {
        let path: PathBuf = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("Failed to remove sandbox '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::git::test_support::{git, source_repo};
    use tempfile::tempdir;

    #[test]
    fn sandbox_lifecycle_checks_out_commit_and_cleans_up() {
        let (_src, repo, first, _second) = source_repo();
        let cache_root = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());

        let sandbox =
            Sandbox::provision(&cache, &repo.to_string_lossy(), &first, None).unwrap();
        let path = sandbox.path().to_path_buf();
        assert_eq!(git(&path, &["rev-parse", "HEAD"]), first);
        assert!(!path.join("README.md").exists());

        std::fs::write(path.join("app.py"), "def answer():\n    return 42\n").unwrap();
        let source = std::fs::read_to_string(repo.join("app.py")).unwrap();
        assert!(source.contains("return 41"));
        let diff = sandbox.diff_versus_base().unwrap();
        assert!(diff.contains("+++ b/app.py"));

        sandbox.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sandboxes_are_isolated_from_each_other() {
        let (_src, repo, _first, second) = source_repo();
        let cache_root = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());
        let url = repo.to_string_lossy().to_string();

        let a = Sandbox::provision(&cache, &url, &second, None).unwrap();
        let b = Sandbox::provision(&cache, &url, &second, None).unwrap();
        assert_ne!(a.path(), b.path());
        std::fs::write(a.path().join("app.py"), "changed\n").unwrap();
        assert!(b.diff_versus_base().unwrap().is_empty());
        assert!(!a.diff_versus_base().unwrap().is_empty());
    }

    #[test]
    fn dropped_sandbox_is_removed() {
        let (_src, repo, first, _second) = source_repo();
        let cache_root = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());
        let path = {
            let sandbox =
                Sandbox::provision(&cache, &repo.to_string_lossy(), &first, None).unwrap();
            sandbox.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn failed_checkout_leaves_no_directory_behind() {
        let (_src, repo, _first, _second) = source_repo();
        let cache_root = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let cache = RepoCache::new(cache_root.path());

        let result = Sandbox::provision(
            &cache,
            &repo.to_string_lossy(),
            "0123456789abcdef0123456789abcdef01234567",
            Some(scratch.path()),
        );
        assert!(result.is_err());
        let remaining = std::fs::read_dir(scratch.path()).unwrap().count();
        assert_eq!(remaining, 0);
    }
}
