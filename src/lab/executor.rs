//! Runs one agent session against one sandbox and reports what it produced.

use super::sandbox::Sandbox;
use crate::agent::{AgentLauncher, AgentSession, CodingAgent};
use crate::dataset::BenchmarkInstance;
use crate::patch::files_in_patch;
use crate::prompt;
use crate::util::panic_message;
use anyhow::Result;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything observed about one (attempt, model) execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialAttempt {
    pub model: String,
    pub attempt: usize,
    pub model_patch: String,
    pub cost: f64,
    pub lint_outcome: Option<bool>,
    pub test_outcome: Option<bool>,
    pub added_files: Vec<String>,
    pub gold_files: Vec<String>,
    pub edited_files: Vec<String>,
    /// The follow-up asking the agent to name files was sent.
    pub reprompted: bool,
    pub duration_ms: u64,
}

impl TrialAttempt {
    fn new(model: &str, attempt: usize, gold_files: Vec<String>) -> Self {
        Self {
            model: model.to_string(),
            attempt,
            model_patch: String::new(),
            cost: 0.0,
            lint_outcome: None,
            test_outcome: None,
            added_files: Vec::new(),
            gold_files,
            edited_files: Vec::new(),
            reprompted: false,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Completed(TrialAttempt),
    /// Launch failure, an error from the session, or a panic inside it.
    /// `attempt.model_patch` stays empty; whatever the agent left is in `partial_patch`.
    AgentFailed {
        attempt: TrialAttempt,
        error: String,
        partial_patch: Option<String>,
    },
    /// The agent finished but the sandbox diff could not be computed.
    DiffFailed { attempt: TrialAttempt, error: String },
}

/// Which trial to run.
#[derive(Debug, Clone, Copy)]
pub struct TrialRequest<'a> {
    pub instance: &'a BenchmarkInstance,
    pub model: &'a str,
    pub attempt: usize,
    pub chat_history_file: Option<&'a Path>,
}

pub struct TrialExecutor {
    launcher: Arc<dyn AgentLauncher>,
    temperature: f64,
}

impl TrialExecutor {
    pub fn new(launcher: Arc<dyn AgentLauncher>, temperature: f64) -> Self {
        Self {
            launcher,
            temperature,
        }
    }

    /// Run one agent session in `sandbox`. Never fails: every problem is
    /// folded into the returned outcome so the caller can keep retrying.
    pub fn execute(&self, sandbox: &Sandbox, request: &TrialRequest<'_>) -> TrialOutcome {
        let started = Instant::now();
        let mut attempt = TrialAttempt::new(
            request.model,
            request.attempt,
            request.instance.gold_files(),
        );
        let session = AgentSession {
            instance_id: &request.instance.instance_id,
            model: request.model,
            temperature: self.temperature,
            workdir: sandbox.path(),
            chat_history_file: request.chat_history_file.map(Path::to_path_buf),
        };

        let mut agent = match self.launcher.launch(&session) {
            Ok(agent) => agent,
            Err(err) => {
                attempt.duration_ms = elapsed_ms(started);
                let error = format!("agent launch failed: {:#}", err);
                warn!(model = request.model, attempt = request.attempt, %error, "trial failed");
                return TrialOutcome::AgentFailed {
                    attempt,
                    error,
                    partial_patch: None,
                };
            }
        };

        let driven = panic::catch_unwind(AssertUnwindSafe(|| {
            drive_agent(agent.as_mut(), &request.instance.problem_statement)
        }));
        let session_result = match driven {
            Ok(Ok(reprompted)) => {
                attempt.reprompted = reprompted;
                Ok(())
            }
            Ok(Err(failure)) => {
                attempt.reprompted = failure.reprompted;
                Err(format!("{:#}", failure.error))
            }
            Err(payload) => Err(format!("agent panicked: {}", panic_message(&*payload))),
        };

        attempt.cost = agent.total_cost();
        attempt.added_files = agent.added_files();
        attempt.lint_outcome = agent.lint_outcome();
        attempt.test_outcome = agent.test_outcome();
        drop(agent);

        let diff = sandbox.diff_versus_base();
        attempt.duration_ms = elapsed_ms(started);

        match (session_result, diff) {
            (Ok(()), Ok(patch)) => {
                attempt.edited_files = files_in_patch(&patch);
                attempt.model_patch = patch;
                debug!(
                    model = request.model,
                    attempt = request.attempt,
                    edited = attempt.edited_files.len(),
                    lint = ?attempt.lint_outcome,
                    "trial completed"
                );
                TrialOutcome::Completed(attempt)
            }
            (Ok(()), Err(err)) => {
                let error = format!("diff failed: {:#}", err);
                warn!(model = request.model, attempt = request.attempt, %error, "trial failed");
                TrialOutcome::DiffFailed { attempt, error }
            }
            (Err(error), diff) => {
                warn!(model = request.model, attempt = request.attempt, %error, "trial failed");
                attempt.edited_files = diff
                    .as_ref()
                    .map(|patch| files_in_patch(patch))
                    .unwrap_or_default();
                TrialOutcome::AgentFailed {
                    attempt,
                    error,
                    partial_patch: diff.ok().filter(|patch| !patch.trim().is_empty()),
                }
            }
        }
    }
}

struct SessionFailure {
    error: anyhow::Error,
    reprompted: bool,
}

/// Send the problem, then ask once for file names if the agent added none.
/// Returns whether the follow-up was sent.
fn drive_agent(agent: &mut dyn CodingAgent, problem_statement: &str) -> Result<bool, SessionFailure> {
    send(agent, &prompt::initial_instruction(problem_statement), false)?;
    if !agent.added_files().is_empty() {
        return Ok(false);
    }
    send(agent, prompt::NAME_FILES_FOLLOW_UP, true)?;
    Ok(true)
}

fn send(agent: &mut dyn CodingAgent, instruction: &str, reprompted: bool) -> Result<(), SessionFailure> {
    agent
        .run(instruction)
        .map_err(|error| SessionFailure { error, reprompted })
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
