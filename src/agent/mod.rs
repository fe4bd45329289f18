//! Coding agent collaborator.
//!
//! The harness never looks inside the agent. It starts a session bound to a
//! sandbox checkout, sends it instructions, and reads back cost, the files
//! the agent pulled into its working set, and lint/test outcomes.

pub mod command;
#[cfg(test)]
pub(crate) mod scripted;

use std::path::{Path, PathBuf};

pub use command::{AgentCommandConfig, CommandAgentLauncher};

/// One agent session, alive for a single trial.
pub trait CodingAgent: Send {
    /// Send one instruction. `Err` means the session failed irrecoverably.
    fn run(&mut self, instruction: &str) -> anyhow::Result<()>;

    /// Cost accumulated by this session so far. Never decreases.
    fn total_cost(&self) -> f64;

    /// Repository-relative files the agent added to its working set.
    fn added_files(&self) -> Vec<String>;

    /// `None` when the agent never linted.
    fn lint_outcome(&self) -> Option<bool>;

    /// `None` when the agent never ran tests.
    fn test_outcome(&self) -> Option<bool>;
}

/// What an agent session is bound to.
#[derive(Debug, Clone)]
pub struct AgentSession<'a> {
    pub instance_id: &'a str,
    pub model: &'a str,
    pub temperature: f64,
    pub workdir: &'a Path,
    pub chat_history_file: Option<PathBuf>,
}

/// Creates agent sessions. Shared by every worker.
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, session: &AgentSession<'_>) -> anyhow::Result<Box<dyn CodingAgent>>;
}
