//! Agent adapter that drives an external agent program.
//!
//! Every instruction is one invocation of the configured program inside the
//! sandbox. The instruction text is handed over in a file, and the program
//! may leave a JSON report describing what it did:
//!
//! ```json
//! {"cost": 0.42, "added_files": ["src/x.py"], "lint_outcome": true, "test_outcome": null}
//! ```

use super::{AgentLauncher, AgentSession, CodingAgent};
use crate::util::{run_command_with_timeout, tail_chars};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 3_600;
const STDERR_TAIL_MAX_CHARS: usize = 2_000;
const REPORT_FILE: &str = "report.json";

fn default_timeout_secs() -> u64 {
    DEFAULT_AGENT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    pub program: String,
    /// Supports `{model}`, `{temperature}`, `{workdir}`, `{instruction_file}`,
    /// `{report_file}` and `{instance_id}` placeholders.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandAgentLauncher {
    config: AgentCommandConfig,
}

impl CommandAgentLauncher {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }
}

impl AgentLauncher for CommandAgentLauncher {
    fn launch(&self, session: &AgentSession<'_>) -> Result<Box<dyn CodingAgent>> {
        let agent = CommandAgent::start(self.config.clone(), session)?;
        Ok(Box::new(agent))
    }
}

/// Report left behind by one agent invocation.
#[derive(Debug, Clone, Default, Deserialize)]
struct AgentReport {
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    added_files: Vec<String>,
    #[serde(default)]
    lint_outcome: Option<bool>,
    #[serde(default)]
    test_outcome: Option<bool>,
}

pub struct CommandAgent {
    config: AgentCommandConfig,
    instance_id: String,
    model: String,
    temperature: f64,
    workdir: PathBuf,
    chat_history_file: Option<PathBuf>,
    // Lives outside the sandbox so agent bookkeeping never shows up in the diff.
    state_dir: TempDir,
    turns: usize,
    total_cost: f64,
    added_files: Vec<String>,
    lint_outcome: Option<bool>,
    test_outcome: Option<bool>,
}

impl CommandAgent {
    fn start(config: AgentCommandConfig, session: &AgentSession<'_>) -> Result<Self> {
        if config.program.trim().is_empty() {
            return Err(anyhow!("Agent program is not configured"));
        }
        let state_dir = tempfile::Builder::new()
            .prefix("patchbench-agent-")
            .tempdir()
            .context("Failed to create agent session directory")?;
        Ok(Self {
            config,
            instance_id: session.instance_id.to_string(),
            model: session.model.to_string(),
            temperature: session.temperature,
            workdir: session.workdir.to_path_buf(),
            chat_history_file: session.chat_history_file.clone(),
            state_dir,
            turns: 0,
            total_cost: 0.0,
            added_files: Vec::new(),
            lint_outcome: None,
            test_outcome: None,
        })
    }

    fn report_path(&self) -> PathBuf {
        self.state_dir.path().join(REPORT_FILE)
    }

    fn render_arg(&self, template: &str, instruction_file: &Path) -> String {
        template
            .replace("{model}", &self.model)
            .replace("{temperature}", &self.temperature.to_string())
            .replace("{workdir}", &self.workdir.to_string_lossy())
            .replace("{instruction_file}", &instruction_file.to_string_lossy())
            .replace("{report_file}", &self.report_path().to_string_lossy())
            .replace("{instance_id}", &self.instance_id)
    }

    fn apply_report(&mut self, report: AgentReport) {
        if report.cost.is_finite() && report.cost > 0.0 {
            self.total_cost += report.cost;
        }
        for file in report.added_files {
            if !self.added_files.contains(&file) {
                self.added_files.push(file);
            }
        }
        if report.lint_outcome.is_some() {
            self.lint_outcome = report.lint_outcome;
        }
        if report.test_outcome.is_some() {
            self.test_outcome = report.test_outcome;
        }
    }
}

impl CodingAgent for CommandAgent {
    fn run(&mut self, instruction: &str) -> Result<()> {
        self.turns += 1;
        let instruction_file = self
            .state_dir
            .path()
            .join(format!("instruction-{}.md", self.turns));
        std::fs::write(&instruction_file, instruction).with_context(|| {
            format!(
                "Failed to write instruction file '{}'",
                instruction_file.display()
            )
        })?;
        let report_path = self.report_path();
        if report_path.exists() {
            std::fs::remove_file(&report_path).with_context(|| {
                format!("Failed to clear stale report '{}'", report_path.display())
            })?;
        }

        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| self.render_arg(arg, &instruction_file))
            .collect();
        let mut cmd = Command::new(&self.config.program);
        cmd.current_dir(&self.workdir).args(&args);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .env("PATCHBENCH_INSTANCE_ID", &self.instance_id)
            .env("PATCHBENCH_MODEL", &self.model)
            .env("PATCHBENCH_TEMPERATURE", self.temperature.to_string())
            .env("PATCHBENCH_WORKDIR", &self.workdir)
            .env("PATCHBENCH_INSTRUCTION_FILE", &instruction_file)
            .env("PATCHBENCH_REPORT_FILE", &report_path);
        if let Some(history) = &self.chat_history_file {
            cmd.env("PATCHBENCH_CHAT_HISTORY_FILE", history);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        let output = run_command_with_timeout(&mut cmd, timeout)
            .map_err(|e| anyhow!("Agent '{}' could not run: {}", self.config.program, e))?;

        // Whatever the agent managed to report still counts toward cost.
        let report = read_report(&report_path);
        if let Ok(Some(report)) = &report {
            self.apply_report(report.clone());
        }

        if output.timed_out {
            return Err(anyhow!(
                "Agent timed out after {}s on turn {}",
                timeout.as_secs(),
                self.turns
            ));
        }
        if !output.success() {
            return Err(anyhow!(
                "Agent exited with {} on turn {}: {}",
                output
                    .status
                    .and_then(|s| s.code())
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                self.turns,
                tail_chars(output.stderr_text().trim(), STDERR_TAIL_MAX_CHARS)
            ));
        }
        report?;
        Ok(())
    }

    fn total_cost(&self) -> f64 {
        self.total_cost
    }

    fn added_files(&self) -> Vec<String> {
        self.added_files.clone()
    }

    fn lint_outcome(&self) -> Option<bool> {
        self.lint_outcome
    }

    fn test_outcome(&self) -> Option<bool> {
        self.test_outcome
    }
}

fn read_report(path: &Path) -> Result<Option<AgentReport>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read agent report '{}'", path.display()))?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    let report = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse agent report '{}'", path.display()))?;
    Ok(Some(report))
}
