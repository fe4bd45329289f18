//! `git` subprocess plumbing for repo caching and sandbox checkouts.

use crate::util::{run_command_with_timeout, truncate};
use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

const CLONE_TIMEOUT: Duration = Duration::from_secs(1_200);
const LOCAL_CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(120);
const DIFF_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_EXCERPT_CHARS: usize = 240;

/// Environment applied to every git invocation so nothing ever blocks on a prompt.
pub fn env_overrides() -> Vec<(String, String)> {
    vec![
        ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ("GIT_ASKPASS".to_string(), "/bin/true".to_string()),
    ]
}

struct GitOutput {
    ok: bool,
    stdout: Vec<u8>,
    stderr: String,
    truncated: bool,
}

fn run_git(cwd: Option<&Path>, args: &[&str], timeout: Duration) -> Result<GitOutput> {
    let mut cmd = Command::new("git");
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.args(args);
    for (k, v) in env_overrides() {
        cmd.env(k, v);
    }
    let output = run_command_with_timeout(&mut cmd, timeout)
        .map_err(|e| anyhow!("Failed to start git command: {}", e))?;
    if output.timed_out {
        return Err(anyhow!(
            "git {} timed out after {}s",
            args.join(" "),
            timeout.as_secs()
        ));
    }
    Ok(GitOutput {
        ok: output.success(),
        stderr: output.stderr_text(),
        stdout: output.stdout,
        truncated: output.output_truncated,
    })
}

/// Full, non-working clone of `url` into `dest`.
pub fn clone_bare(url: &str, dest: &Path) -> Result<()> {
    let dest_str = dest.to_string_lossy().to_string();
    let output = run_git(None, &["clone", "--bare", url, &dest_str], CLONE_TIMEOUT)?;
    if output.ok {
        return Ok(());
    }
    Err(anyhow!(
        "git clone --bare failed for {}: {}",
        url,
        truncate(output.stderr.trim(), ERROR_EXCERPT_CHARS)
    ))
}

/// Working clone of a local bare repository, without populating the tree.
pub fn clone_working_copy(bare_repo: &Path, dest: &Path) -> Result<()> {
    let source = bare_repo.to_string_lossy().to_string();
    let dest_str = dest.to_string_lossy().to_string();
    let output = run_git(
        None,
        &["clone", "--no-checkout", "--quiet", &source, &dest_str],
        LOCAL_CLONE_TIMEOUT,
    )?;
    if output.ok {
        return Ok(());
    }
    Err(anyhow!(
        "git clone of cached repo '{}' failed: {}",
        bare_repo.display(),
        truncate(output.stderr.trim(), ERROR_EXCERPT_CHARS)
    ))
}

pub fn checkout_detached(repo_dir: &Path, commit: &str) -> Result<()> {
    let output = run_git(
        Some(repo_dir),
        &[
            "-c",
            "advice.detachedHead=false",
            "checkout",
            "--quiet",
            "--detach",
            commit,
        ],
        CHECKOUT_TIMEOUT,
    )?;
    if output.ok {
        return Ok(());
    }
    Err(anyhow!(
        "git checkout --detach {} failed in {}: {}",
        commit,
        repo_dir.display(),
        truncate(output.stderr.trim(), ERROR_EXCERPT_CHARS)
    ))
}

/// Diff of the working tree of `repo_dir` against `commit`.
///
/// The patch is returned exactly as git wrote it. Output that is not UTF-8
/// or was cut short is an error rather than a patch that cannot be applied.
pub fn diff_versus_commit(repo_dir: &Path, commit: &str) -> Result<String> {
    let output = run_git(
        Some(repo_dir),
        &["-c", "core.quotepath=false", "diff", "--no-color", commit],
        DIFF_TIMEOUT,
    )?;
    if !output.ok {
        return Err(anyhow!(
            "git diff {} failed in {}: {}",
            commit,
            repo_dir.display(),
            truncate(output.stderr.trim(), ERROR_EXCERPT_CHARS)
        ));
    }
    if output.truncated {
        return Err(anyhow!(
            "git diff {} in {} did not finish writing its output",
            commit,
            repo_dir.display()
        ));
    }
    String::from_utf8(output.stdout).map_err(|err| {
        anyhow!(
            "git diff {} in {} is not valid UTF-8 (invalid byte at offset {})",
            commit,
            repo_dir.display(),
            err.utf8_error().valid_up_to()
        )
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::{git, source_repo};
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bare_clone_then_detached_checkout_reaches_requested_commit() {
        let (_src, repo, first, _second) = source_repo();
        let scratch = tempdir().unwrap();
        let bare = scratch.path().join("cache.git");
        clone_bare(&repo.to_string_lossy(), &bare).unwrap();
        assert!(bare.join("HEAD").exists());

        let work = scratch.path().join("work");
        clone_working_copy(&bare, &work).unwrap();
        checkout_detached(&work, &first).unwrap();
        assert_eq!(git(&work, &["rev-parse", "HEAD"]), first);
        assert!(work.join("app.py").exists());
        assert!(!work.join("README.md").exists());
    }

    #[test]
    fn diff_versus_commit_reports_working_tree_edits() {
        let (_src, repo, _first, second) = source_repo();
        std::fs::write(repo.join("app.py"), "def answer():\n    return 42\n").unwrap();
        let diff = diff_versus_commit(&repo, &second).unwrap();
        assert!(diff.contains("--- a/app.py"));
        assert!(diff.contains("+    return 42"));
    }

    #[test]
    fn non_utf8_diff_is_an_error_not_a_mangled_patch() {
        let (_src, repo, _first, second) = source_repo();
        std::fs::write(repo.join("app.py"), b"name = 'caf\xe9'\n").unwrap();
        let err = diff_versus_commit(&repo, &second).unwrap_err();
        assert!(err.to_string().contains("not valid UTF-8"));
    }

    #[test]
    fn clone_bare_of_missing_repo_fails() {
        let scratch = tempdir().unwrap();
        let missing = scratch.path().join("does-not-exist");
        let err = clone_bare(&missing.to_string_lossy(), &scratch.path().join("x.git"))
            .unwrap_err();
        assert!(err.to_string().contains("git clone --bare failed"));
    }

    #[test]
    fn checkout_of_unknown_commit_fails() {
        let (_src, repo, _first, _second) = source_repo();
        let err = checkout_detached(&repo, "0123456789abcdef0123456789abcdef01234567").unwrap_err();
        assert!(err.to_string().contains("checkout --detach"));
    }

    #[test]
    fn env_overrides_disable_prompts() {
        let env = env_overrides();
        assert!(env
            .iter()
            .any(|(k, v)| k == "GIT_TERMINAL_PROMPT" && v == "0"));
    }
}
