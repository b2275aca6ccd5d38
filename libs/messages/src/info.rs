//! Entity descriptions exchanged between the master, agents and executors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use skiff_id::{AgentId, ExecutorId, FrameworkId, TaskId};

use crate::resources::Resources;
use crate::update::TaskState;

/// Free-form `name:value` attributes advertised to the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    /// Parses a semicolon-separated `name:value` list, e.g. `rack:r1;zone:z2`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let mut map = BTreeMap::new();
        for pair in s.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((name, value)) = pair.split_once(':') {
                map.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
        Self(map)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What the agent advertises about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    /// Hostname shown to operators; may differ behind NAT.
    pub public_hostname: String,
    pub resources: Resources,
    pub attributes: Attributes,
    pub checkpoint: bool,
    /// Assigned by the master on first registration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<AgentId>,
}

impl AgentInfo {
    /// Whether a recovered info is interchangeable with the current one.
    ///
    /// The assigned ID is excluded: it is adopted from disk, not configured.
    #[must_use]
    pub fn compatible(&self, other: &AgentInfo) -> bool {
        self.hostname == other.hostname
            && self.resources == other.resources
            && self.attributes == other.attributes
            && self.checkpoint == other.checkpoint
    }
}

/// A command an executor (or the bundled task runner) should execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

impl CommandInfo {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Description of an executor within a framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    /// Set when the executor is reported to the master.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_id: Option<FrameworkId>,
    pub name: String,
    /// Origin label, e.g. the task a command executor was synthesized for.
    #[serde(default)]
    pub source: String,
    pub command: CommandInfo,
    #[serde(default)]
    pub resources: Resources,
}

/// Description of a framework (tenant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub user: String,
    pub name: String,
    /// Whether the agent should checkpoint this framework's state.
    #[serde(default)]
    pub checkpoint: bool,
}

/// A task the framework asks to run.
///
/// Exactly one of `executor` and `command` is set: either the framework
/// brings its own executor, or the agent synthesizes a command executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
}

impl TaskInfo {
    /// True for command-only tasks (the agent supplies the executor).
    #[must_use]
    pub fn has_command(&self) -> bool {
        self.command.is_some()
    }
}

/// The agent-side record of a launched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    /// Unset for command-only tasks; used to tell command executors apart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_executor_id: Option<ExecutorId>,
    pub resources: Resources,
    pub state: TaskState,
}

impl Task {
    /// Builds the record for a freshly accepted task.
    #[must_use]
    pub fn from_info(
        info: &TaskInfo,
        state: TaskState,
        executor_id: ExecutorId,
        framework_id: FrameworkId,
    ) -> Self {
        Self {
            task_id: info.task_id.clone(),
            name: info.name.clone(),
            framework_id,
            executor_id,
            explicit_executor_id: info.executor.as_ref().map(|e| e.executor_id.clone()),
            resources: info.resources.clone(),
            state,
        }
    }

    /// True if the task was launched without an explicit executor.
    #[must_use]
    pub fn is_command_task(&self) -> bool {
        self.explicit_executor_id.is_none()
    }
}
