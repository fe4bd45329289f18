//! Serialized shapes of attempt history entries and finalized predictions.
//!
//! Field names follow what downstream patch scorers read: `instance_id`,
//! `model_name_or_path` and `model_patch` are required by them, everything
//! else is bookkeeping for later analysis.

use crate::dataset::BenchmarkInstance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    AgentError,
    DiffError,
    ProvisionError,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Completed => "completed",
            TrialStatus::AgentError => "agent_error",
            TrialStatus::DiffError => "diff_error",
            TrialStatus::ProvisionError => "provision_error",
        }
    }
}

/// How the winner of an instance was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// First attempt with a non-empty patch and a passing lint.
    Plausible,
    /// Best of the non-plausible attempts.
    Fallback,
    /// Nothing usable; the prediction is a placeholder with a null patch.
    NoWinner,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Plausible => "plausible",
            Resolution::Fallback => "fallback",
            Resolution::NoWinner => "no_winner",
        }
    }
}

/// Run-level values stamped on every record.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub run_id: String,
    pub model_name_or_path: String,
    pub temperature: f64,
}

/// One (attempt, model) execution in an instance's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: String,
    pub model: String,
    pub temperature: f64,
    pub cost: f64,
    pub added_files: Vec<String>,
    pub gold_files: Vec<String>,
    pub edited_files: Vec<String>,
    pub lint_outcome: Option<bool>,
    pub test_outcome: Option<bool>,
    #[serde(rename = "try")]
    pub attempt: usize,
    pub status: TrialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Diff left behind by an agent that failed mid-session. Never a candidate patch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_patch: Option<String>,
    #[serde(default)]
    pub reprompted: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TrialRecord {
    pub fn has_patch(&self) -> bool {
        !self.model_patch.trim().is_empty()
    }

    pub fn lint_passed(&self) -> bool {
        self.lint_outcome == Some(true)
    }

    /// Non-empty patch and passing lint. Test outcome never gates.
    pub fn is_plausible(&self) -> bool {
        self.status == TrialStatus::Completed && self.has_patch() && self.lint_passed()
    }
}

/// Fields owned by the prediction itself; instance extras with these names are dropped.
const RESERVED_FIELDS: &[&str] = &[
    "instance_id",
    "model_name_or_path",
    "model_patch",
    "model",
    "try",
    "temperature",
    "added_files",
    "gold_files",
    "edited_files",
    "lint_outcome",
    "test_outcome",
    "cost",
    "tries",
    "all_results",
    "resolution",
    "error",
    "run_id",
    "finished_at",
    "repo",
    "base_commit",
    "problem_statement",
    "patch",
];

/// The one finalized entry written for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub model_name_or_path: String,
    pub model_patch: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(rename = "try", default)]
    pub winning_try: Option<usize>,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub added_files: Vec<String>,
    #[serde(default)]
    pub gold_files: Vec<String>,
    #[serde(default)]
    pub edited_files: Vec<String>,
    #[serde(default)]
    pub lint_outcome: Option<bool>,
    #[serde(default)]
    pub test_outcome: Option<bool>,
    /// Total across every executed attempt, not just the winner.
    pub cost: f64,
    /// Number of (attempt, model) executions for this instance.
    pub tries: usize,
    pub all_results: Vec<TrialRecord>,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub run_id: String,
    pub finished_at: DateTime<Utc>,
    pub repo: String,
    pub base_commit: String,
    pub problem_statement: String,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Prediction {
    /// Build the prediction for `instance` from its full attempt history.
    pub fn finalize(
        instance: &BenchmarkInstance,
        identity: &RunIdentity,
        history: Vec<TrialRecord>,
        winner: Option<usize>,
        resolution: Resolution,
    ) -> Self {
        let cost = history.iter().map(|record| record.cost).sum();
        let mut prediction = Self::base(instance, identity, cost, history);
        let winner = winner.and_then(|idx| prediction.all_results.get(idx).cloned());
        match winner {
            Some(record) => {
                prediction.model_patch = Some(record.model_patch);
                prediction.model = Some(record.model);
                prediction.winning_try = Some(record.attempt);
                prediction.added_files = record.added_files;
                prediction.edited_files = record.edited_files;
                prediction.lint_outcome = record.lint_outcome;
                prediction.test_outcome = record.test_outcome;
                prediction.resolution = resolution;
            }
            None => prediction.resolution = Resolution::NoWinner,
        }
        prediction
    }

    /// Minimal entry for an instance whose pipeline failed outright.
    pub fn placeholder(
        instance: &BenchmarkInstance,
        identity: &RunIdentity,
        error: impl Into<String>,
    ) -> Self {
        let mut prediction = Self::base(instance, identity, 0.0, Vec::new());
        prediction.error = Some(error.into());
        prediction
    }

    fn base(
        instance: &BenchmarkInstance,
        identity: &RunIdentity,
        cost: f64,
        history: Vec<TrialRecord>,
    ) -> Self {
        let extra = instance
            .extra
            .iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            instance_id: instance.instance_id.clone(),
            model_name_or_path: identity.model_name_or_path.clone(),
            model_patch: None,
            model: None,
            winning_try: None,
            temperature: identity.temperature,
            added_files: Vec::new(),
            gold_files: instance.gold_files(),
            edited_files: Vec::new(),
            lint_outcome: None,
            test_outcome: None,
            cost,
            tries: history.len(),
            all_results: history,
            resolution: Resolution::NoWinner,
            error: None,
            run_id: identity.run_id.clone(),
            finished_at: Utc::now(),
            repo: instance.repo.clone(),
            base_commit: instance.base_commit.clone(),
            problem_statement: instance.problem_statement.clone(),
            patch: instance.patch.clone(),
            extra,
        }
    }
}
