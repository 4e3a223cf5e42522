//! Backend-neutral description of what an agent step should do.
//!
//! A [`WorkflowSpec`] is built by each agent definition from its resolved
//! inputs. Every backend runner consumes the same workflow; only the way it is
//! turned into a runnable differs.

use serde::{Deserialize, Serialize};

use crate::error::OmaError;
use crate::tools::dedup_names;

pub const DEFAULT_MAX_STEPS: usize = 50;
pub const DEFAULT_MAX_ITER: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub role: String,
    pub goal: String,
    pub backstory: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
}

fn default_max_iter() -> usize {
    DEFAULT_MAX_ITER
}

impl AgentSpec {
    pub fn new(
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
            tools: Vec::new(),
            max_iter: DEFAULT_MAX_ITER,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn system_prompt(&self) -> String {
        format!(
            "You are {}.\n\nGoal: {}\n\n{}",
            self.role,
            self.goal.trim(),
            self.backstory.trim()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub expected_output: String,
    /// Role of the [`AgentSpec`] that performs this task.
    pub agent: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl TaskSpec {
    pub fn new(
        agent: impl Into<String>,
        description: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            expected_output: expected_output.into(),
            agent: agent.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Prompt for this task, with the text of earlier tasks as context.
    pub fn prompt(&self, prior_outputs: &[String]) -> String {
        let mut prompt = format!(
            "{}\n\nExpected output: {}",
            self.description.trim(),
            self.expected_output.trim()
        );
        if !prior_outputs.is_empty() {
            prompt.push_str("\n\nContext from previous tasks:");
            for (idx, output) in prior_outputs.iter().enumerate() {
                prompt.push_str(&format!("\n[{}] {}", idx + 1, output.trim()));
            }
        }
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    /// Upper bound on model turns for reactive agents.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    pub agents: Vec<AgentSpec>,
    pub tasks: Vec<TaskSpec>,
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            temperature: 0.0,
            max_steps: DEFAULT_MAX_STEPS,
            agents: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn agent_for(&self, task: &TaskSpec) -> Option<&AgentSpec> {
        self.agents.iter().find(|agent| agent.role == task.agent)
    }

    /// Every tool named anywhere in the workflow, first-seen order.
    pub fn tool_names(&self) -> Vec<String> {
        dedup_names(
            self.agents
                .iter()
                .flat_map(|agent| agent.tools.iter())
                .chain(self.tasks.iter().flat_map(|task| task.tools.iter())),
        )
    }

    /// Tools available while performing `task`: its agent's tools plus its own.
    pub fn tools_for_task(&self, task: &TaskSpec) -> Vec<String> {
        let agent_tools = self
            .agent_for(task)
            .map(|agent| agent.tools.as_slice())
            .unwrap_or_default();
        dedup_names(agent_tools.iter().chain(task.tools.iter()))
    }

    pub fn validate(&self) -> Result<(), OmaError> {
        if self.tasks.is_empty() {
            return Err(OmaError::InvalidConfiguration(format!(
                "workflow `{}` has no tasks",
                self.name
            )));
        }
        if self.max_steps == 0 {
            return Err(OmaError::InvalidConfiguration(format!(
                "workflow `{}` must allow at least one step",
                self.name
            )));
        }
        for task in &self.tasks {
            let agent = self.agent_for(task).ok_or_else(|| {
                OmaError::InvalidConfiguration(format!(
                    "task in workflow `{}` refers to unknown agent `{}`",
                    self.name, task.agent
                ))
            })?;
            if agent.max_iter == 0 {
                return Err(OmaError::InvalidConfiguration(format!(
                    "agent `{}` must allow at least one iteration",
                    agent.role
                )));
            }
        }
        Ok(())
    }

    /// The whole workflow as one instruction, for backends that take a single prompt.
    pub fn render_prompt(&self) -> String {
        let mut prompt = String::new();
        for agent in &self.agents {
            prompt.push_str(&agent.system_prompt());
            prompt.push_str("\n\n");
        }
        prompt.push_str("Complete the following tasks in order.");
        for (idx, task) in self.tasks.iter().enumerate() {
            prompt.push_str(&format!(
                "\n\n## Task {}\n{}\n\nExpected output: {}",
                idx + 1,
                task.description.trim(),
                task.expected_output.trim()
            ));
        }
        prompt
    }
}
