//! The isolation capability the agent delegates executor processes to.
//!
//! The agent never touches processes or containers itself; it asks the
//! isolator to launch, kill and re-limit executors, and hears back about
//! terminations through its event mailbox. A mock implementation records
//! calls for tests.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use skiff_id::{AgentId, ExecutorId, FrameworkId, RunId};
use skiff_messages::{ExecutorInfo, FrameworkInfo, Resources};
use tracing::{debug, info};

use crate::state::RecoveredAgent;

/// Isolation capability.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Launch an executor process in the given sandbox.
    #[allow(clippy::too_many_arguments)]
    async fn launch_executor(
        &self,
        agent_id: Option<AgentId>,
        framework_id: FrameworkId,
        framework: FrameworkInfo,
        executor: ExecutorInfo,
        run_id: RunId,
        directory: std::path::PathBuf,
        resources: Resources,
    ) -> Result<()>;

    /// Forcibly terminate an executor.
    async fn kill_executor(&self, framework_id: FrameworkId, executor_id: ExecutorId)
        -> Result<()>;

    /// Inform the isolator of an executor's current resource demand.
    async fn resources_changed(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        resources: Resources,
    ) -> Result<()>;

    /// Adopt (or sweep away) whatever survived an agent restart. `None`
    /// means no checkpointed state existed; orphans should be destroyed.
    async fn recover(&self, state: Option<&RecoveredAgent>) -> Result<()>;
}

/// A recorded isolator invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum IsolatorCall {
    Launch {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_id: RunId,
    },
    Kill {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
    ResourcesChanged {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        resources: Resources,
    },
    Recover {
        had_state: bool,
    },
}

/// Mock isolator that records every call.
#[derive(Default)]
pub struct MockIsolator {
    calls: Mutex<Vec<IsolatorCall>>,
}

impl MockIsolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<IsolatorCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Kill calls so far.
    pub fn killed(&self) -> Vec<(FrameworkId, ExecutorId)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                IsolatorCall::Kill {
                    framework_id,
                    executor_id,
                } => Some((framework_id, executor_id)),
                _ => None,
            })
            .collect()
    }

    /// Launch calls so far.
    pub fn launched(&self) -> Vec<(FrameworkId, ExecutorId, RunId)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                IsolatorCall::Launch {
                    framework_id,
                    executor_id,
                    run_id,
                } => Some((framework_id, executor_id, run_id)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: IsolatorCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Isolator for MockIsolator {
    async fn launch_executor(
        &self,
        _agent_id: Option<AgentId>,
        framework_id: FrameworkId,
        _framework: FrameworkInfo,
        executor: ExecutorInfo,
        run_id: RunId,
        directory: std::path::PathBuf,
        _resources: Resources,
    ) -> Result<()> {
        info!(
            framework_id = %framework_id,
            executor_id = %executor.executor_id,
            directory = %directory.display(),
            "[MOCK] Launching executor"
        );
        self.record(IsolatorCall::Launch {
            framework_id,
            executor_id: executor.executor_id,
            run_id,
        });
        Ok(())
    }

    async fn kill_executor(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    ) -> Result<()> {
        info!(
            framework_id = %framework_id,
            executor_id = %executor_id,
            "[MOCK] Killing executor"
        );
        self.record(IsolatorCall::Kill {
            framework_id,
            executor_id,
        });
        Ok(())
    }

    async fn resources_changed(
        &self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        resources: Resources,
    ) -> Result<()> {
        debug!(
            framework_id = %framework_id,
            executor_id = %executor_id,
            resources = %resources,
            "[MOCK] Resources changed"
        );
        self.record(IsolatorCall::ResourcesChanged {
            framework_id,
            executor_id,
            resources,
        });
        Ok(())
    }

    async fn recover(&self, state: Option<&RecoveredAgent>) -> Result<()> {
        debug!(had_state = state.is_some(), "[MOCK] Recovering isolator");
        self.record(IsolatorCall::Recover {
            had_state: state.is_some(),
        });
        Ok(())
    }
}
