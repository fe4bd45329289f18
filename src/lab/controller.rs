//! Attempt/model retry loop for one instance.
//!
//! Attempts are the outer loop and models the inner one. The first plausible
//! trial wins and stops both loops; if none turns up, the best completed
//! trial is chosen as a fallback once every pair has run.

use super::dispatcher::InstanceSolver;
use super::executor::{elapsed_ms, TrialExecutor, TrialOutcome, TrialRequest};
use super::record::{Prediction, Resolution, RunIdentity, TrialRecord, TrialStatus};
use super::repo_cache::RepoCache;
use super::sandbox::Sandbox;
use crate::dataset::BenchmarkInstance;
use crate::util::sanitize_component;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn};

/// Which (attempt, model) pairs to try and in what order.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub models: Vec<String>,
    pub num_tries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// `attempt` is 1-based; `model_index` points into the policy's models.
    AttemptPending { attempt: usize, model_index: usize },
    /// `winner` indexes the attempt history.
    Won { winner: usize },
    Exhausted,
}

impl RetryPolicy {
    pub fn start(&self) -> ControllerState {
        if self.num_tries == 0 || self.models.is_empty() {
            return ControllerState::Exhausted;
        }
        ControllerState::AttemptPending {
            attempt: 1,
            model_index: 0,
        }
    }

    /// State after the pending pair ran and was appended at `record_index`.
    pub fn next_state(
        &self,
        state: ControllerState,
        plausible: bool,
        record_index: usize,
    ) -> ControllerState {
        let ControllerState::AttemptPending {
            attempt,
            model_index,
        } = state
        else {
            return state;
        };
        if plausible {
            return ControllerState::Won {
                winner: record_index,
            };
        }
        if model_index + 1 < self.models.len() {
            ControllerState::AttemptPending {
                attempt,
                model_index: model_index + 1,
            }
        } else if attempt < self.num_tries {
            ControllerState::AttemptPending {
                attempt: attempt + 1,
                model_index: 0,
            }
        } else {
            ControllerState::Exhausted
        }
    }
}

/// Fallback winner among trials that completed: a passing lint beats a
/// non-empty patch, and the earliest trial wins ties. Trials with neither
/// are never chosen.
pub fn pick_winner(history: &[TrialRecord]) -> Option<usize> {
    let mut best: Option<((bool, bool), usize)> = None;
    for (idx, record) in history.iter().enumerate() {
        if record.status != TrialStatus::Completed {
            continue;
        }
        let rank = (record.lint_passed(), record.has_patch());
        if rank == (false, false) {
            continue;
        }
        match best {
            Some((best_rank, _)) if best_rank >= rank => {}
            _ => best = Some((rank, idx)),
        }
    }
    best.map(|(_, idx)| idx)
}

/// Attempt history for one instance plus how it was resolved.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub history: Vec<TrialRecord>,
    pub winner: Option<usize>,
    pub resolution: Resolution,
}

impl InstanceOutcome {
    pub fn total_cost(&self) -> f64 {
        self.history.iter().map(|record| record.cost).sum()
    }
}

pub struct RetryController {
    cache: Arc<RepoCache>,
    executor: TrialExecutor,
    policy: RetryPolicy,
    identity: RunIdentity,
    scratch_root: Option<PathBuf>,
    chat_log_dir: Option<PathBuf>,
}

impl RetryController {
    pub fn new(
        cache: Arc<RepoCache>,
        executor: TrialExecutor,
        policy: RetryPolicy,
        identity: RunIdentity,
    ) -> Self {
        Self {
            cache,
            executor,
            policy,
            identity,
            scratch_root: None,
            chat_log_dir: None,
        }
    }

    /// Parent directory for sandboxes instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// Directory receiving `<instance_id>-chat-history.md` files.
    pub fn with_chat_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chat_log_dir = Some(dir.into());
        self
    }

    /// Run (attempt, model) pairs in order until one is plausible or all are spent.
    pub fn run_attempts(&self, instance: &BenchmarkInstance) -> InstanceOutcome {
        let chat_history = self.prepare_chat_history(&instance.instance_id);
        let mut history: Vec<TrialRecord> = Vec::new();
        let mut running_cost = 0.0;
        let mut state = self.policy.start();

        while let ControllerState::AttemptPending {
            attempt,
            model_index,
        } = state
        {
            let model = &self.policy.models[model_index];
            let record = self.run_pair(instance, model, attempt, chat_history.as_deref());
            running_cost += record.cost;
            let plausible = record.is_plausible();
            info!(
                model = %model,
                attempt,
                status = record.status.as_str(),
                plausible,
                cost = record.cost,
                instance_cost = running_cost,
                "trial finished"
            );
            history.push(record);
            state = self.policy.next_state(state, plausible, history.len() - 1);
        }

        match state {
            ControllerState::Won { winner } => InstanceOutcome {
                history,
                winner: Some(winner),
                resolution: Resolution::Plausible,
            },
            _ => {
                let winner = pick_winner(&history);
                InstanceOutcome {
                    history,
                    winner,
                    resolution: if winner.is_some() {
                        Resolution::Fallback
                    } else {
                        Resolution::NoWinner
                    },
                }
            }
        }
    }

    fn run_pair(
        &self,
        instance: &BenchmarkInstance,
        model: &str,
        attempt: usize,
        chat_history: Option<&Path>,
    ) -> TrialRecord {
        let started = Instant::now();
        let sandbox = match Sandbox::provision(
            &self.cache,
            &instance.repo_url,
            &instance.base_commit,
            self.scratch_root.as_deref(),
        ) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                let error = format!("{:#}", err);
                warn!(model, attempt, %error, "sandbox provisioning failed");
                let mut record = self.empty_record(instance, model, attempt, TrialStatus::ProvisionError);
                record.error = Some(error);
                record.duration_ms = elapsed_ms(started);
                return record;
            }
        };

        let outcome = self.executor.execute(
            &sandbox,
            &TrialRequest {
                instance,
                model,
                attempt,
                chat_history_file: chat_history,
            },
        );
        if let Err(err) = sandbox.cleanup() {
            warn!(error = %format!("{:#}", err), "sandbox cleanup failed");
        }
        self.record_from(instance, outcome)
    }

    fn record_from(&self, instance: &BenchmarkInstance, outcome: TrialOutcome) -> TrialRecord {
        let (attempt, status, error, partial_patch) = match outcome {
            TrialOutcome::Completed(attempt) => (attempt, TrialStatus::Completed, None, None),
            TrialOutcome::AgentFailed {
                attempt,
                error,
                partial_patch,
            } => (attempt, TrialStatus::AgentError, Some(error), partial_patch),
            TrialOutcome::DiffFailed { attempt, error } => {
                (attempt, TrialStatus::DiffError, Some(error), None)
            }
        };
        TrialRecord {
            instance_id: instance.instance_id.clone(),
            model_name_or_path: self.identity.model_name_or_path.clone(),
            model_patch: attempt.model_patch,
            model: attempt.model,
            temperature: self.identity.temperature,
            cost: attempt.cost,
            added_files: attempt.added_files,
            gold_files: attempt.gold_files,
            edited_files: attempt.edited_files,
            lint_outcome: attempt.lint_outcome,
            test_outcome: attempt.test_outcome,
            attempt: attempt.attempt,
            status,
            error,
            partial_patch,
            reprompted: attempt.reprompted,
            duration_ms: attempt.duration_ms,
        }
    }

    fn empty_record(
        &self,
        instance: &BenchmarkInstance,
        model: &str,
        attempt: usize,
        status: TrialStatus,
    ) -> TrialRecord {
        TrialRecord {
            instance_id: instance.instance_id.clone(),
            model_name_or_path: self.identity.model_name_or_path.clone(),
            model_patch: String::new(),
            model: model.to_string(),
            temperature: self.identity.temperature,
            cost: 0.0,
            added_files: Vec::new(),
            gold_files: instance.gold_files(),
            edited_files: Vec::new(),
            lint_outcome: None,
            test_outcome: None,
            attempt,
            status,
            error: None,
            partial_patch: None,
            reprompted: false,
            duration_ms: 0,
        }
    }

    /// History file for this instance, with any leftover from an aborted run removed.
    fn prepare_chat_history(&self, instance_id: &str) -> Option<PathBuf> {
        let dir = self.chat_log_dir.as_ref()?;
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(path = %dir.display(), error = %err, "cannot create chat log directory");
            return None;
        }
        let path = dir.join(format!("{}-chat-history.md", sanitize_component(instance_id)));
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "cannot remove stale chat history");
            }
        }
        Some(path)
    }
}

impl InstanceSolver for RetryController {
    fn solve(&self, instance: &BenchmarkInstance) -> Prediction {
        let _span = info_span!("instance", instance_id = %instance.instance_id).entered();
        info!(headline = instance.headline(), "instance started");
        let outcome = self.run_attempts(instance);
        let prediction = Prediction::finalize(
            instance,
            &self.identity,
            outcome.history,
            outcome.winner,
            outcome.resolution,
        );
        info!(
            resolution = prediction.resolution.as_str(),
            tries = prediction.tries,
            cost = prediction.cost,
            "instance finished"
        );
        prediction
    }

    fn placeholder(&self, instance: &BenchmarkInstance, error: &str) -> Prediction {
        Prediction::placeholder(instance, &self.identity, error)
    }
}
