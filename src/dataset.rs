//! Benchmark dataset loading and instance selection.
//!
//! A dataset file is a JSON array of entries, a JSON object keyed by
//! instance id, or JSON Lines. Fields other than the ones the harness needs
//! are kept verbatim so they can be copied into the results file.

use crate::patch::files_in_patch;
use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_GITHUB_BASE_URL: &str = "https://github.com/";

/// One benchmark problem: a repository at a commit plus an issue to fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkInstance {
    pub instance_id: String,
    /// `owner/name` or a full clone URL / local path.
    pub repo: String,
    pub base_commit: String,
    pub problem_statement: String,
    /// Reference patch. Only used to derive gold files; never shown to the agent.
    #[serde(default)]
    pub patch: Option<String>,
    /// Clone URL resolved from `repo` when the dataset is loaded.
    #[serde(skip)]
    pub repo_url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BenchmarkInstance {
    pub fn gold_files(&self) -> Vec<String> {
        files_in_patch(self.patch.as_deref().unwrap_or_default())
    }

    /// First line of the problem statement.
    pub fn headline(&self) -> &str {
        self.problem_statement.lines().next().unwrap_or("").trim()
    }
}

/// Resolve a dataset `repo` value into something `git clone` accepts.
pub fn resolve_repo_url(repo: &str, github_base_url: &str) -> String {
    let repo = repo.trim();
    let is_explicit = repo.contains("://")
        || repo.starts_with("git@")
        || repo.starts_with('/')
        || repo.starts_with('.')
        || repo.starts_with('~');
    if is_explicit {
        return repo.to_string();
    }
    format!("{}/{}", github_base_url.trim_end_matches('/'), repo)
}

#[derive(Debug, Clone)]
pub struct Dataset {
    instances: Vec<BenchmarkInstance>,
}

impl Dataset {
    pub fn load(path: &Path, github_base_url: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset '{}'", path.display()))?;
        let instances = parse_entries(&content)
            .with_context(|| format!("Failed to parse dataset '{}'", path.display()))?;
        Self::from_instances(instances, github_base_url)
    }

    pub fn from_instances(
        mut instances: Vec<BenchmarkInstance>,
        github_base_url: &str,
    ) -> Result<Self> {
        let mut seen: HashSet<String> = HashSet::new();
        for instance in &mut instances {
            if instance.instance_id.trim().is_empty() {
                return Err(anyhow!("Dataset entry has an empty instance_id"));
            }
            if !seen.insert(instance.instance_id.clone()) {
                return Err(anyhow!(
                    "Duplicate instance_id '{}' in dataset",
                    instance.instance_id
                ));
            }
            if instance.repo.trim().is_empty() {
                return Err(anyhow!(
                    "Instance '{}' has an empty repo",
                    instance.instance_id
                ));
            }
            if instance.base_commit.trim().is_empty() {
                return Err(anyhow!(
                    "Instance '{}' has an empty base_commit",
                    instance.instance_id
                ));
            }
            instance.repo_url = resolve_repo_url(&instance.repo, github_base_url);
        }
        Ok(Self { instances })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[BenchmarkInstance] {
        &self.instances
    }

    pub fn get(&self, instance_id: &str) -> Option<&BenchmarkInstance> {
        self.instances
            .iter()
            .find(|instance| instance.instance_id == instance_id)
    }

    /// Apply `selection` and return the chosen instances in dataset order
    /// (or in the order of explicitly requested ids).
    pub fn select(&self, selection: &InstanceSelection) -> Result<Vec<BenchmarkInstance>> {
        let mut picked: Vec<BenchmarkInstance> = if selection.instance_ids.is_empty() {
            self.instances.clone()
        } else {
            let mut requested = Vec::with_capacity(selection.instance_ids.len());
            let mut seen = HashSet::new();
            for id in &selection.instance_ids {
                if !seen.insert(id.as_str()) {
                    continue;
                }
                let instance = self
                    .get(id)
                    .ok_or_else(|| anyhow!("Unknown instance id '{}'", id))?;
                requested.push(instance.clone());
            }
            requested
        };

        if let Some(pattern) = selection.filter.as_deref() {
            let regex = Regex::new(pattern)
                .with_context(|| format!("Invalid instance filter regex '{}'", pattern))?;
            picked.retain(|instance| regex.is_match(&instance.instance_id));
        }

        if let Some(range) = selection.slice {
            let end = range.end.unwrap_or(picked.len());
            if range.start >= end || end > picked.len() {
                return Err(anyhow!(
                    "Instance slice {} is out of range for {} instances",
                    range,
                    picked.len()
                ));
            }
            picked = picked[range.start..end].to_vec();
        }

        if let Some(sample) = selection.sample {
            if sample < picked.len() {
                let mut rng = match selection.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_os_rng(),
                };
                let mut indices = rand::seq::index::sample(&mut rng, picked.len(), sample).into_vec();
                indices.sort_unstable();
                picked = indices.into_iter().map(|idx| picked[idx].clone()).collect();
            }
        }

        if picked.is_empty() {
            return Err(anyhow!("Instance selection matched no instances"));
        }
        Ok(picked)
    }
}

fn parse_entries(content: &str) -> Result<Vec<BenchmarkInstance>> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Array(entries)) => entries
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| {
                serde_json::from_value(entry)
                    .with_context(|| format!("Invalid dataset entry at index {}", idx))
            })
            .collect(),
        Ok(Value::Object(map)) if !map.contains_key("instance_id") => map
            .into_iter()
            .map(|(id, mut entry)| {
                if let Value::Object(fields) = &mut entry {
                    fields
                        .entry("instance_id")
                        .or_insert_with(|| Value::String(id.clone()));
                }
                serde_json::from_value(entry)
                    .with_context(|| format!("Invalid dataset entry '{}'", id))
            })
            .collect(),
        _ => parse_json_lines(content),
    }
}

fn parse_json_lines(content: &str) -> Result<Vec<BenchmarkInstance>> {
    let mut instances = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let instance = serde_json::from_str(line)
            .with_context(|| format!("Invalid dataset line {}", idx + 1))?;
        instances.push(instance);
    }
    Ok(instances)
}

/// Which dataset instances a run should process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSelection {
    #[serde(default)]
    pub instance_ids: Vec<String>,
    /// Regex matched against instance ids.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub slice: Option<IndexRange>,
    /// Random sample size, applied after the slice.
    #[serde(default)]
    pub sample: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Half-open index range written as `start..end` or `start..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IndexRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl FromStr for IndexRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .trim()
            .split_once("..")
            .ok_or_else(|| anyhow!("Invalid slice '{}' (expected start..end)", s))?;
        let start = if start.is_empty() {
            0
        } else {
            start
                .parse::<usize>()
                .with_context(|| format!("Invalid slice start in '{}'", s))?
        };
        let end = if end.is_empty() {
            None
        } else {
            Some(
                end.parse::<usize>()
                    .with_context(|| format!("Invalid slice end in '{}'", s))?,
            )
        };
        if let Some(end) = end {
            if end <= start {
                return Err(anyhow!("Slice '{}' is empty", s));
            }
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for IndexRange {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<IndexRange> for String {
    fn from(range: IndexRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..{}", self.start, end),
            None => write!(f, "{}..", self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str) -> Value {
        serde_json::json!({
            "instance_id": id,
            "repo": "psf/requests",
            "base_commit": "abc123",
            "problem_statement": format!("Problem {}\nmore detail", id),
            "patch": "--- a/requests/api.py\n+++ b/requests/api.py\n",
            "version": "2.0",
        })
    }

    fn dataset(ids: &[&str]) -> Dataset {
        let instances = ids
            .iter()
            .map(|id| serde_json::from_value(entry(id)).unwrap())
            .collect();
        Dataset::from_instances(instances, DEFAULT_GITHUB_BASE_URL).unwrap()
    }

    #[test]
    fn load_accepts_array_map_and_json_lines() {
        let dir = tempdir().unwrap();

        let array_path = dir.path().join("array.json");
        std::fs::write(&array_path, serde_json::to_string(&vec![entry("a-1"), entry("a-2")]).unwrap())
            .unwrap();
        let loaded = Dataset::load(&array_path, DEFAULT_GITHUB_BASE_URL).unwrap();
        assert_eq!(loaded.len(), 2);

        let map_path = dir.path().join("map.json");
        let mut map = Map::new();
        let mut without_id = entry("ignored");
        without_id.as_object_mut().unwrap().remove("instance_id");
        map.insert("m-1".to_string(), without_id);
        std::fs::write(&map_path, Value::Object(map).to_string()).unwrap();
        let loaded = Dataset::load(&map_path, DEFAULT_GITHUB_BASE_URL).unwrap();
        assert_eq!(loaded.instances()[0].instance_id, "m-1");

        let lines_path = dir.path().join("lines.jsonl");
        let lines = format!("{}\n\n{}\n", entry("l-1"), entry("l-2"));
        std::fs::write(&lines_path, lines).unwrap();
        let loaded = Dataset::load(&lines_path, DEFAULT_GITHUB_BASE_URL).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.instances()[1].instance_id, "l-2");
    }

    #[test]
    fn load_keeps_extra_fields_and_resolves_repo_url() {
        let data = dataset(&["x-1"]);
        let instance = &data.instances()[0];
        assert_eq!(instance.repo_url, "https://github.com/psf/requests");
        assert_eq!(instance.extra.get("version"), Some(&Value::from("2.0")));
        assert_eq!(instance.gold_files(), vec!["requests/api.py"]);
        assert_eq!(instance.headline(), "Problem x-1");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let instances = vec![
            serde_json::from_value(entry("dup")).unwrap(),
            serde_json::from_value(entry("dup")).unwrap(),
        ];
        let err = Dataset::from_instances(instances, DEFAULT_GITHUB_BASE_URL).unwrap_err();
        assert!(err.to_string().contains("Duplicate instance_id"));
    }

    #[test]
    fn resolve_repo_url_leaves_explicit_locations_alone() {
        assert_eq!(
            resolve_repo_url("django/django", "https://example.org/"),
            "https://example.org/django/django"
        );
        assert_eq!(resolve_repo_url("/tmp/repo", DEFAULT_GITHUB_BASE_URL), "/tmp/repo");
        assert_eq!(
            resolve_repo_url("git@github.com:a/b.git", DEFAULT_GITHUB_BASE_URL),
            "git@github.com:a/b.git"
        );
        assert_eq!(
            resolve_repo_url("https://gitlab.com/a/b", DEFAULT_GITHUB_BASE_URL),
            "https://gitlab.com/a/b"
        );
    }

    #[test]
    fn select_by_ids_keeps_request_order_and_rejects_unknown() {
        let data = dataset(&["a", "b", "c"]);
        let selection = InstanceSelection {
            instance_ids: vec!["c".into(), "a".into(), "c".into()],
            ..Default::default()
        };
        let ids: Vec<_> = data
            .select(&selection)
            .unwrap()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(ids, vec!["c", "a"]);

        let unknown = InstanceSelection {
            instance_ids: vec!["zzz".into()],
            ..Default::default()
        };
        assert!(data.select(&unknown).is_err());
    }

    #[test]
    fn select_applies_filter_then_slice() {
        let data = dataset(&["django-1", "flask-1", "django-2", "django-3"]);
        let selection = InstanceSelection {
            filter: Some("^django".into()),
            slice: Some("1..3".parse().unwrap()),
            ..Default::default()
        };
        let ids: Vec<_> = data
            .select(&selection)
            .unwrap()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(ids, vec!["django-2", "django-3"]);
    }

    #[test]
    fn select_rejects_out_of_range_slice() {
        let data = dataset(&["a", "b"]);
        let selection = InstanceSelection {
            slice: Some("1..5".parse().unwrap()),
            ..Default::default()
        };
        assert!(data.select(&selection).is_err());
    }

    #[test]
    fn seeded_sample_is_reproducible_and_keeps_dataset_order() {
        let ids: Vec<String> = (0..30).map(|i| format!("inst-{:02}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let data = dataset(&refs);
        let selection = InstanceSelection {
            sample: Some(5),
            seed: Some(7),
            ..Default::default()
        };
        let first: Vec<_> = data
            .select(&selection)
            .unwrap()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        let second: Vec<_> = data
            .select(&selection)
            .unwrap()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
    }

    #[test]
    fn index_range_parses_open_and_closed_forms() {
        let closed: IndexRange = "2..10".parse().unwrap();
        assert_eq!(closed, IndexRange { start: 2, end: Some(10) });
        let open: IndexRange = "5..".parse().unwrap();
        assert_eq!(open.end, None);
        assert_eq!(open.to_string(), "5..");
        assert!("4..4".parse::<IndexRange>().is_err());
        assert!("nope".parse::<IndexRange>().is_err());
    }
}
