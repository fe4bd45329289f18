//! Deterministic agents for tests.

use super::{AgentLauncher, AgentSession, CodingAgent};
use anyhow::anyhow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// What a scripted session does on its first instruction.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedPlan {
    /// File (relative to the sandbox) and new content written on the first turn.
    pub edit: Option<(String, Vec<u8>)>,
    pub cost: f64,
    pub added_files: Vec<String>,
    pub lint: Option<bool>,
    pub test: Option<bool>,
    /// Fail the first turn (after applying the edit) with this message.
    pub error: Option<String>,
    pub panic: bool,
}

impl ScriptedPlan {
    pub fn editing(file: &str, content: &str) -> Self {
        Self::editing_bytes(file, content.as_bytes())
    }

    pub fn editing_bytes(file: &str, content: &[u8]) -> Self {
        Self {
            edit: Some((file.to_string(), content.to_vec())),
            added_files: vec![file.to_string()],
            ..Default::default()
        }
    }

    pub fn lint(mut self, lint: Option<bool>) -> Self {
        self.lint = lint;
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LaunchRecord {
    pub instance_id: String,
    pub model: String,
    /// 1-based count of launches for this (instance, model) pair.
    pub nth: usize,
}

type PlanFn = dyn Fn(&str, &str, usize) -> ScriptedPlan + Send + Sync;

pub(crate) struct ScriptedLauncher {
    plan_for: Box<PlanFn>,
    launches: Mutex<Vec<LaunchRecord>>,
    counts: Mutex<HashMap<(String, String), usize>>,
    instructions: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedLauncher {
    /// `plan_for(instance_id, model, nth)` decides what each session does.
    pub fn new(plan_for: impl Fn(&str, &str, usize) -> ScriptedPlan + Send + Sync + 'static) -> Self {
        Self {
            plan_for: Box::new(plan_for),
            launches: Mutex::new(Vec::new()),
            counts: Mutex::new(HashMap::new()),
            instructions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().unwrap().clone()
    }

    /// Every instruction sent, as (instance_id, text).
    pub fn instructions(&self) -> Vec<(String, String)> {
        self.instructions.lock().unwrap().clone()
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(&self, session: &AgentSession<'_>) -> anyhow::Result<Box<dyn CodingAgent>> {
        let nth = {
            let mut counts = self.counts.lock().unwrap();
            let count = counts
                .entry((session.instance_id.to_string(), session.model.to_string()))
                .or_insert(0);
            *count += 1;
            *count
        };
        self.launches.lock().unwrap().push(LaunchRecord {
            instance_id: session.instance_id.to_string(),
            model: session.model.to_string(),
            nth,
        });
        let plan = (self.plan_for)(session.instance_id, session.model, nth);
        Ok(Box::new(ScriptedAgent {
            plan,
            instance_id: session.instance_id.to_string(),
            workdir: session.workdir.to_path_buf(),
            turns: 0,
            cost: 0.0,
            instructions: Arc::clone(&self.instructions),
        }))
    }
}

struct ScriptedAgent {
    plan: ScriptedPlan,
    instance_id: String,
    workdir: PathBuf,
    turns: usize,
    cost: f64,
    instructions: Arc<Mutex<Vec<(String, String)>>>,
}

impl CodingAgent for ScriptedAgent {
    fn run(&mut self, instruction: &str) -> anyhow::Result<()> {
        self.turns += 1;
        self.instructions
            .lock()
            .unwrap()
            .push((self.instance_id.clone(), instruction.to_string()));
        if self.turns > 1 {
            return Ok(());
        }
        if self.plan.panic {
            panic!("scripted agent panic");
        }
        if let Some((file, content)) = &self.plan.edit {
            std::fs::write(self.workdir.join(file), content)?;
        }
        self.cost += self.plan.cost;
        match &self.plan.error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    fn total_cost(&self) -> f64 {
        self.cost
    }

    fn added_files(&self) -> Vec<String> {
        self.plan.added_files.clone()
    }

    fn lint_outcome(&self) -> Option<bool> {
        self.plan.lint
    }

    fn test_outcome(&self) -> Option<bool> {
        self.plan.test
    }
}
