//! Shared helpers for the agent scenario tests.
//!
//! Agents run with a mock isolator and a channel outbox; tests drive them
//! by delivering master/executor messages and assert on the outbound
//! traffic and on snapshots.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use skiff_agent::agent::{Agent, AgentHandle};
use skiff_agent::config::{Config, RecoveryMode};
use skiff_agent::isolator::MockIsolator;
use skiff_agent::outbox::ChannelOutbox;
use skiff_messages::{
    AgentOutbound, CommandInfo, Endpoint, ExecutorToAgent, FrameworkInfo, MasterToAgent,
    Resources, StatusUpdate, TaskInfo, TaskState,
};
use tokio::sync::mpsc;

pub const MASTER: &str = "http://m1:5050";

/// Configuration with timeouts short enough to exercise in tests.
pub fn test_config(work_dir: &Path, checkpoint: bool) -> Config {
    Config {
        recover: RecoveryMode::Reconnect,
        safe: true,
        checkpoint,
        work_dir: work_dir.to_path_buf(),
        resources: Some("cpus:2;mem:512;disk:1024".to_string()),
        attributes: None,
        disk_watch_interval: Duration::from_secs(3600),
        gc_delay: Duration::from_secs(14 * 86400),
        executor_registration_timeout: Duration::from_secs(5),
        executor_shutdown_grace_period: Duration::from_millis(100),
        executor_reregister_timeout: Duration::from_millis(400),
        resource_monitoring_interval: Duration::from_secs(1),
        launcher_dir: Path::new("/usr/libexec/skiff").to_path_buf(),
        registration_backoff: Duration::from_millis(50),
        update_retry_interval: Duration::from_secs(30),
        http_listen_addr: "127.0.0.1:0".parse().unwrap(),
    }
}

/// Outbound traffic with a consumed-message log for "never happened"
/// assertions.
pub struct OutboxStream {
    rx: mpsc::UnboundedReceiver<(Endpoint, AgentOutbound)>,
    pub log: Vec<(Endpoint, AgentOutbound)>,
}

impl OutboxStream {
    /// Waits (2 s) for the first message satisfying the predicate,
    /// logging everything consumed along the way.
    pub async fn wait_for(
        &mut self,
        what: &str,
        pred: impl Fn(&Endpoint, &AgentOutbound) -> bool,
    ) -> (Endpoint, AgentOutbound) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {what}"));
            let (to, message) = tokio::time::timeout(remaining, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
                .expect("outbox closed");
            self.log.push((to.clone(), message.clone()));
            if pred(&to, &message) {
                return (to, message);
            }
        }
    }

    /// Drains anything currently buffered into the log.
    pub fn drain(&mut self) {
        while let Ok(entry) = self.rx.try_recv() {
            self.log.push(entry);
        }
    }

    /// True if any logged message satisfies the predicate.
    pub fn saw(&self, pred: impl Fn(&Endpoint, &AgentOutbound) -> bool) -> bool {
        self.log.iter().any(|(to, m)| pred(to, m))
    }
}

pub struct TestAgent {
    pub handle: AgentHandle,
    pub isolator: Arc<MockIsolator>,
    pub outbox: OutboxStream,
}

pub fn spawn_agent(config: Config) -> TestAgent {
    let isolator = Arc::new(MockIsolator::new());
    let (outbox, rx) = ChannelOutbox::new();
    let handle =
        Agent::spawn(config, isolator.clone(), Arc::new(outbox)).expect("failed to spawn agent");
    TestAgent {
        handle,
        isolator,
        outbox: OutboxStream { rx, log: Vec::new() },
    }
}

impl TestAgent {
    pub async fn master_says(&self, message: MasterToAgent) {
        self.handle
            .deliver_master(message, Some(Endpoint::new(MASTER)))
            .await;
    }

    pub async fn executor_says(&self, from: &str, message: ExecutorToAgent) {
        self.handle
            .deliver_executor(message, Endpoint::new(from))
            .await;
    }

    /// Drives `NewMasterDetected` + first registration to completion.
    pub async fn register(&mut self, agent_id: &str) {
        self.master_says(MasterToAgent::NewMasterDetected {
            master: Endpoint::new(MASTER),
        })
        .await;
        self.outbox
            .wait_for("agent registration", |to, m| {
                to.as_str() == MASTER && matches!(m, AgentOutbound::RegisterAgent { .. })
            })
            .await;
        self.master_says(MasterToAgent::AgentRegistered {
            agent_id: agent_id.parse().unwrap(),
        })
        .await;
    }
}

pub fn framework_info(checkpoint: bool) -> FrameworkInfo {
    FrameworkInfo {
        user: "tests".to_string(),
        name: "test-framework".to_string(),
        checkpoint,
    }
}

pub fn command_task(id: &str, command: &str, resources: &str) -> TaskInfo {
    TaskInfo {
        task_id: id.parse().unwrap(),
        name: id.to_string(),
        resources: Resources::parse(resources).unwrap(),
        executor: None,
        command: Some(CommandInfo::new(command)),
    }
}

pub fn run_task_message(checkpoint: bool, task: TaskInfo) -> MasterToAgent {
    MasterToAgent::RunTask {
        framework: framework_info(checkpoint),
        framework_id: "f1".parse().unwrap(),
        framework_endpoint: Endpoint::new("http://framework-f1:8080"),
        task,
    }
}

pub fn running_update(task: &str) -> StatusUpdate {
    StatusUpdate::new(
        "f1".parse().unwrap(),
        Some("s1".parse().unwrap()),
        task.parse().unwrap(),
        TaskState::Running,
        "",
    )
    .with_executor(task.parse().unwrap())
}

/// Extracts the update from an outbound `StatusUpdate`, if it is one.
pub fn as_status_update(message: &AgentOutbound) -> Option<&StatusUpdate> {
    match message {
        AgentOutbound::StatusUpdate { update } => Some(update),
        _ => None,
    }
}

/// Polls until the predicate holds or 2 s pass.
pub async fn eventually(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !pred() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
