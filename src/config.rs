//! Run configuration for patchbench
//!
//! Three layers, later ones winning: built-in defaults, a TOML file
//! (`--config`, else `./patchbench.toml`, else
//! `~/.config/patchbench/config.toml`), then command-line flags.

use crate::agent::AgentCommandConfig;
use crate::dataset::{InstanceSelection, IndexRange, DEFAULT_GITHUB_BASE_URL};
use crate::lab::record::RunIdentity;
use crate::util::sanitize_component;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const LOCAL_CONFIG_FILE: &str = "patchbench.toml";
const DEFAULT_REPOS_DIR: &str = "repos";
const DEFAULT_CHAT_LOGS_DIR: &str = "chat-logs";
const DEFAULT_PREDICTIONS_DIR: &str = "predictions";
const DEFAULT_NUM_TRIES: usize = 1;
const DEFAULT_CONCURRENCY: usize = 1;

/// The TOML file layer. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub run_id: Option<String>,
    pub dataset: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub models: Option<Vec<String>>,
    pub model_name_or_path: Option<String>,
    pub num_tries: Option<usize>,
    pub concurrency: Option<usize>,
    pub temperature: Option<f64>,
    pub repos_dir: Option<PathBuf>,
    pub chat_logs_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub prior_results: Option<Vec<PathBuf>>,
    pub resume: Option<bool>,
    pub github_base_url: Option<String>,
    #[serde(default)]
    pub selection: InstanceSelection,
    pub agent: Option<AgentCommandConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML '{}'", path.display()))
    }
}

/// Command-line layer. `None` / empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub run_id: Option<String>,
    pub dataset: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub models: Vec<String>,
    pub model_name_or_path: Option<String>,
    pub num_tries: Option<usize>,
    pub concurrency: Option<usize>,
    pub temperature: Option<f64>,
    pub repos_dir: Option<PathBuf>,
    pub chat_logs_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub prior_results: Vec<PathBuf>,
    pub no_resume: bool,
    pub github_base_url: Option<String>,
    pub instance_ids: Vec<String>,
    pub filter: Option<String>,
    pub slice: Option<IndexRange>,
    pub sample: Option<usize>,
    pub seed: Option<u64>,
    pub agent_program: Option<String>,
    pub agent_args: Vec<String>,
    pub agent_timeout_secs: Option<u64>,
}

/// Fully resolved and validated settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub run_id: String,
    pub dataset: PathBuf,
    pub output: PathBuf,
    pub models: Vec<String>,
    pub model_name_or_path: String,
    pub num_tries: usize,
    pub concurrency: usize,
    pub temperature: f64,
    pub repos_dir: PathBuf,
    pub chat_logs_dir: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub prior_results: Vec<PathBuf>,
    pub resume: bool,
    pub github_base_url: String,
    pub selection: InstanceSelection,
    pub agent: AgentCommandConfig,
}

/// User-level config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("patchbench").join("config.toml"))
}

/// The config file to load, if any. An explicit path must exist.
pub fn discover_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(anyhow!("Config file '{}' does not exist", path.display()));
        }
        return Ok(Some(path.to_path_buf()));
    }
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Ok(Some(local));
    }
    Ok(default_config_path().filter(|p| p.is_file()))
}

impl RunConfig {
    /// Load the file layer (if any) and apply `cli` on top.
    pub fn resolve(explicit_config: Option<&Path>, cli: CliOverrides) -> Result<Self> {
        let file = match discover_config_file(explicit_config)? {
            Some(path) => FileConfig::load(&path)?,
            None => FileConfig::default(),
        };
        Self::from_layers(file, cli)
    }

    pub fn from_layers(file: FileConfig, cli: CliOverrides) -> Result<Self> {
        let run_id = cli
            .run_id
            .or(file.run_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let dataset = cli
            .dataset
            .or(file.dataset)
            .ok_or_else(|| anyhow!("No dataset given (use --dataset or `dataset` in the config file)"))?;
        let output = cli.output.or(file.output).unwrap_or_else(|| {
            PathBuf::from(DEFAULT_PREDICTIONS_DIR)
                .join(format!("{}.json", sanitize_component(&run_id)))
        });
        let models = if cli.models.is_empty() {
            file.models.unwrap_or_default()
        } else {
            cli.models
        };
        let model_name_or_path = cli
            .model_name_or_path
            .or(file.model_name_or_path)
            .or_else(|| models.first().cloned())
            .unwrap_or_default();
        let prior_results = if cli.prior_results.is_empty() {
            file.prior_results.unwrap_or_default()
        } else {
            cli.prior_results
        };

        let mut selection = file.selection;
        if !cli.instance_ids.is_empty() {
            selection.instance_ids = cli.instance_ids;
        }
        selection.filter = cli.filter.or(selection.filter);
        selection.slice = cli.slice.or(selection.slice);
        selection.sample = cli.sample.or(selection.sample);
        selection.seed = cli.seed.or(selection.seed);

        let mut agent = file.agent.unwrap_or_default();
        if let Some(program) = cli.agent_program {
            agent.program = program;
        }
        if !cli.agent_args.is_empty() {
            agent.args = cli.agent_args;
        }
        if let Some(timeout) = cli.agent_timeout_secs {
            agent.timeout_secs = timeout;
        }

        let config = Self {
            run_id,
            dataset,
            output,
            models,
            model_name_or_path,
            num_tries: cli.num_tries.or(file.num_tries).unwrap_or(DEFAULT_NUM_TRIES),
            concurrency: cli
                .concurrency
                .or(file.concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            temperature: cli.temperature.or(file.temperature).unwrap_or(0.0),
            repos_dir: cli
                .repos_dir
                .or(file.repos_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPOS_DIR)),
            chat_logs_dir: cli
                .chat_logs_dir
                .or(file.chat_logs_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHAT_LOGS_DIR)),
            scratch_dir: cli.scratch_dir.or(file.scratch_dir),
            prior_results,
            resume: !cli.no_resume && file.resume.unwrap_or(true),
            github_base_url: cli
                .github_base_url
                .or(file.github_base_url)
                .unwrap_or_else(|| DEFAULT_GITHUB_BASE_URL.to_string()),
            selection,
            agent,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that apply to every command.
    fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            return Err(anyhow!("run_id must not be empty"));
        }
        if self.num_tries == 0 {
            return Err(anyhow!("num_tries must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be at least 1"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(anyhow!(
                "temperature must be a finite number >= 0 (got {})",
                self.temperature
            ));
        }
        if let Some(pattern) = self.selection.filter.as_deref() {
            Regex::new(pattern)
                .with_context(|| format!("Invalid instance filter regex '{}'", pattern))?;
        }
        if self.selection.sample == Some(0) {
            return Err(anyhow!("sample size must be at least 1"));
        }
        if let Some(model) = self.models.iter().find(|m| m.trim().is_empty()) {
            return Err(anyhow!("model names must not be empty (got '{}')", model));
        }
        Ok(())
    }

    /// Extra checks before actually running agents.
    pub fn require_agent(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(anyhow!(
                "No models given (use --model or `models` in the config file)"
            ));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!(
                "No agent program given (use --agent-program or [agent] program in the config file)"
            ));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent timeout_secs must be at least 1"));
        }
        Ok(())
    }

    /// Per-run directory holding agent chat histories.
    pub fn chat_log_dir(&self) -> PathBuf {
        self.chat_logs_dir.join(sanitize_component(&self.run_id))
    }

    pub fn identity(&self) -> RunIdentity {
        RunIdentity {
            run_id: self.run_id.clone(),
            model_name_or_path: self.model_name_or_path.clone(),
            temperature: self.temperature,
        }
    }
}
