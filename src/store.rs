//! Append-only predictions file.
//!
//! The file is a single JSON array. Every append is a read-modify-write
//! under an in-process mutex and an advisory lock on a sidecar file, and the
//! new array is written to a temp file and renamed over the old one, so a
//! crash mid-write leaves the previous contents intact.

use crate::lab::record::Prediction;
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, warn};

const STORE_LOCK_TIMEOUT_SECS: u64 = 60;
const STORE_LOCK_RETRY_MS: u64 = 25;
const DEFAULT_PERSIST_ATTEMPTS: usize = 3;
const DEFAULT_PERSIST_DELAY: Duration = Duration::from_millis(500);

pub struct ResultStore {
    path: PathBuf,
    write_guard: Mutex<()>,
    persist_attempts: usize,
    persist_delay: Duration,
}

struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            persist_delay: DEFAULT_PERSIST_DELAY,
        }
    }

    /// How many times `append_with_retry` tries, and how long it waits between tries.
    pub fn with_retry(mut self, attempts: usize, delay: Duration) -> Self {
        self.persist_attempts = attempts.max(1);
        self.persist_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where predictions that could not be appended are dumped, one JSON object per line.
    pub fn rescue_path(&self) -> PathBuf {
        sidecar(&self.path, "rescue.jsonl")
    }

    /// Where the run report goes. The extension keeps it out of
    /// `load_finished_instances` when the output directory is reused as
    /// prior results.
    pub fn report_path(&self) -> PathBuf {
        sidecar(&self.path, "report")
    }

    /// Add one prediction to the end of the array.
    ///
    /// A missing or blank file counts as an empty array. A file that exists
    /// but does not parse is an error and is left untouched.
    pub fn append(&self, prediction: &Prediction) -> Result<()> {
        let entry = serde_json::to_value(prediction).context("Failed to serialize prediction")?;
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let _lock = self.lock()?;

        let mut entries = read_array(&self.path)?;
        entries.push(entry);
        let content =
            serde_json::to_string_pretty(&entries).context("Failed to serialize predictions")?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write '{}'", self.path.display()))
    }

    /// `append`, retried with a delay. If every try fails the prediction is
    /// written to the rescue file and the last error is returned.
    pub fn append_with_retry(&self, prediction: &Prediction) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.persist_attempts {
            match self.append(prediction) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        instance_id = %prediction.instance_id,
                        attempt,
                        error = %format!("{:#}", err),
                        "failed to persist prediction"
                    );
                    last_err = Some(err);
                    if attempt < self.persist_attempts {
                        thread::sleep(self.persist_delay);
                    }
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("prediction was never persisted"));

        let rescue = self.rescue_path();
        match self.write_rescue(prediction) {
            Ok(()) => error!(
                instance_id = %prediction.instance_id,
                rescue = %rescue.display(),
                "prediction saved to rescue file"
            ),
            Err(rescue_err) => error!(
                instance_id = %prediction.instance_id,
                error = %format!("{:#}", rescue_err),
                "rescue write failed too; prediction is lost"
            ),
        }
        Err(err).with_context(|| {
            format!(
                "Failed to persist prediction for '{}' to '{}'",
                prediction.instance_id,
                self.path.display()
            )
        })
    }

    /// Instance ids already present in the output file. Missing file means none.
    pub fn finished_instances(&self) -> Result<HashSet<String>> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let entries = read_entries(&self.path)?;
        Ok(instance_ids(&entries).collect())
    }

    fn write_rescue(&self, prediction: &Prediction) -> Result<()> {
        let path = self.rescue_path();
        let line = serde_json::to_string(prediction)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open '{}'", path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn lock(&self) -> Result<StoreLock> {
        let lock_path = sidecar(&self.path, "lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open '{}'", lock_path.display()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                        return Err(anyhow!(
                            "Timed out waiting for results lock ({}s)",
                            STORE_LOCK_TIMEOUT_SECS
                        ));
                    }
                    thread::sleep(Duration::from_millis(STORE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }
}

/// Collect instance ids from prior results: files, or directories whose
/// `.json`/`.jsonl` files are read. Any unreadable input is an error.
pub fn load_finished_instances(paths: &[PathBuf]) -> Result<HashSet<String>> {
    let mut finished = HashSet::new();
    for path in paths {
        for file in result_files(path)? {
            let entries = read_entries(&file)?;
            finished.extend(instance_ids(&entries));
        }
    }
    Ok(finished)
}

fn result_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(anyhow!("Prior results '{}' does not exist", path.display()));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json") | Some("jsonl")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn instance_ids(entries: &[Value]) -> impl Iterator<Item = String> + '_ {
    entries
        .iter()
        .filter_map(|entry| entry.get("instance_id")?.as_str().map(str::to_string))
}

/// Strict JSON array, for the file this store owns.
fn read_array(path: &Path) -> Result<Vec<Value>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read '{}'", path.display()))
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).with_context(|| {
        format!(
            "'{}' is not a JSON array of predictions; refusing to overwrite it",
            path.display()
        )
    })
}

/// JSON array or JSON Lines, for reading results written by any run.
fn read_entries(path: &Path) -> Result<Vec<Value>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read results '{}'", path.display()))?;
    let trimmed = content.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .with_context(|| format!("Failed to parse results '{}'", path.display()));
    }
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("Failed to parse results '{}' line {}", path.display(), idx + 1)
            })
        })
        .collect()
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "predictions".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Write content by writing a temp file next to `path` and renaming it over.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = sidecar(path, "tmp");
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
