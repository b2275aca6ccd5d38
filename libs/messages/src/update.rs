//! Task states and status updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_id::{AgentId, ExecutorId, FrameworkId, TaskId, UpdateId};

/// Execution state of a task as last reported.
///
/// The agent drives the basic flow (staging through the first terminal
/// state); the extended states are recognized so counters and snapshots can
/// represent them, but the agent never produces them itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted by the agent, not yet reported running by the executor.
    Staging,
    /// Executor has begun starting the task.
    Starting,
    /// Task is running.
    Running,
    /// Task finished successfully.
    Finished,
    /// Task was killed on request.
    Killed,
    /// Task (or its executor) failed.
    Failed,
    /// Task was lost before reaching a terminal state.
    Lost,

    // Extended states, counted but not produced by the agent core.
    Killing,
    Unreachable,
    Gone,
    GoneByOperator,
    Error,
    Dropped,
}

impl TaskState {
    /// States the agent itself drives and counts from startup.
    pub const CORE: [TaskState; 7] = [
        TaskState::Staging,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Finished,
        TaskState::Killed,
        TaskState::Failed,
        TaskState::Lost,
    ];

    /// Returns `true` once the task can never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Killed
                | TaskState::Failed
                | TaskState::Lost
                | TaskState::Gone
                | TaskState::GoneByOperator
                | TaskState::Error
                | TaskState::Dropped
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Staging => "staging",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Killed => "killed",
            TaskState::Failed => "failed",
            TaskState::Lost => "lost",
            TaskState::Killing => "killing",
            TaskState::Unreachable => "unreachable",
            TaskState::Gone => "gone",
            TaskState::GoneByOperator => "gone_by_operator",
            TaskState::Error => "error",
            TaskState::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// A status update: the latest known state of one task.
///
/// Identified by `update_id` for acknowledgement purposes. Updates flow
/// executor → agent → master → framework, and each hop acknowledges by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: String,
    pub update_id: UpdateId,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    /// Creates an update with a fresh ID and the current time.
    #[must_use]
    pub fn new(
        framework_id: FrameworkId,
        agent_id: Option<AgentId>,
        task_id: TaskId,
        state: TaskState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            framework_id,
            agent_id,
            executor_id: None,
            task_id,
            state,
            message: message.into(),
            update_id: UpdateId::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attaches the source executor.
    #[must_use]
    pub fn with_executor(mut self, executor_id: ExecutorId) -> Self {
        self.executor_id = Some(executor_id);
        self
    }
}

impl std::fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) for task {} of framework {}",
            self.state, self.update_id, self.task_id, self.framework_id
        )
    }
}
