//! The direction-scoped message sets.
//!
//! Three enums, one per direction the agent cares about: inbound from the
//! master, inbound from executors, and everything the agent itself emits.
//! All are tagged JSON so a transport can route on the `type` field.

use serde::{Deserialize, Serialize};
use skiff_id::{AgentId, ExecutorId, FrameworkId, TaskId, UpdateId};

use crate::info::{AgentInfo, ExecutorInfo, FrameworkInfo, Task, TaskInfo};
use crate::update::StatusUpdate;

/// A message-endpoint address, e.g. `http://10.0.0.7:5051`.
///
/// Opaque to the agent: it only stores, compares and hands endpoints to the
/// outbox for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Messages the agent receives from the master (or master detector).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterToAgent {
    NewMasterDetected {
        master: Endpoint,
    },
    NoMasterDetected,
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentReregistered {
        agent_id: AgentId,
    },
    RunTask {
        framework: FrameworkInfo,
        framework_id: FrameworkId,
        framework_endpoint: Endpoint,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    FrameworkToExecutor {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },
    UpdateFramework {
        framework_id: FrameworkId,
        framework_endpoint: Endpoint,
    },
    StatusUpdateAcknowledgement {
        agent_id: AgentId,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },
    Shutdown,
    Ping,
}

/// Messages the agent receives from local executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorToAgent {
    RegisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    /// The executor's view of the world after an agent restart.
    ReregisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<TaskInfo>,
        updates: Vec<StatusUpdate>,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    ExecutorToFramework {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },
}

/// Everything the agent sends: to the master, to executors, to frameworks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutbound {
    // --- to the master ---
    RegisterAgent {
        agent: AgentInfo,
    },
    ReregisterAgent {
        agent_id: AgentId,
        agent: AgentInfo,
        executors: Vec<ExecutorInfo>,
        tasks: Vec<Task>,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    ExitedExecutor {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
    },
    Pong,

    // --- to executors ---
    RunTask {
        framework: FrameworkInfo,
        framework_id: FrameworkId,
        framework_endpoint: Endpoint,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    ExecutorRegistered {
        executor: ExecutorInfo,
        framework_id: FrameworkId,
        framework: FrameworkInfo,
        agent_id: AgentId,
        agent: AgentInfo,
    },
    ExecutorReregistered {
        agent_id: AgentId,
        agent: AgentInfo,
    },
    ReconnectExecutor {
        agent_id: AgentId,
    },
    ShutdownExecutor,
    StatusUpdateAcknowledgement {
        agent_id: AgentId,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },
    FrameworkToExecutor {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },

    // --- to frameworks ---
    ExecutorToFramework {
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },
}
