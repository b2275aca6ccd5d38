//! The agent actor.
//!
//! One task, one mailbox. Every message from the master, every message from
//! a local executor, every isolator callback and every timer firing arrives
//! as an [`AgentEvent`] and is handled to completion before the next is
//! dequeued. The entity graph (frameworks → executors → tasks) is owned
//! here and carries no locks.
//!
//! Timers capture the executor run ID they were armed for; a timer whose
//! run ID no longer matches is a stale leftover from an earlier run and is
//! dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use skiff_id::{AgentId, ExecutorId, FrameworkId, RunId, TaskId, UpdateId};
use skiff_messages::{
    AgentInfo, AgentOutbound, Attributes, Endpoint, ExecutorToAgent, FrameworkInfo, MasterToAgent,
    Resources, StatusUpdate, Task, TaskInfo, TaskState,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checkpoint;
use crate::config::{Config, RecoveryMode};
use crate::files::Files;
use crate::framework::{
    synthesized_update, Executor, ExecutorState, Framework, FrameworkState,
    MAX_COMPLETED_FRAMEWORKS,
};
use crate::gc::GarbageCollector;
use crate::isolator::Isolator;
use crate::monitor::ResourceMonitor;
use crate::outbox::Outbox;
use crate::paths;
use crate::resources;
use crate::state::{self, RecoveredAgent};
use crate::update_manager::{RecoveredStream, StatusUpdateManager, UpdateManagerError};

/// Mailbox capacity; producers back off when the agent falls behind.
const MAILBOX_SIZE: usize = 1024;

// =============================================================================
// Events
// =============================================================================

/// Everything that can wake the agent.
#[derive(Debug)]
pub enum AgentEvent {
    /// A message from the master (or the master detector). `from` is the
    /// sender's endpoint when the transport knows it.
    Master {
        message: MasterToAgent,
        from: Option<Endpoint>,
    },

    /// A message from a local executor; `from` is its reply endpoint.
    Executor {
        message: ExecutorToAgent,
        from: Endpoint,
    },

    /// Isolator callback: an executor process is gone.
    ExecutorTerminated {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
        /// True when the isolator destroyed it (e.g. resource limits).
        destroyed: bool,
        message: String,
    },

    /// The link to the master dropped.
    MasterExited,

    // --- timers ---
    RegistrationTick {
        epoch: u64,
    },
    RegisterExecutorTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_id: RunId,
    },
    ShutdownExecutorTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_id: RunId,
    },
    ReregisterExecutorTimeout,
    CheckDiskUsage,

    // --- read-only queries ---
    GetState {
        reply: oneshot::Sender<StateSnapshot>,
    },
    GetStats {
        reply: oneshot::Sender<StatsSnapshot>,
    },
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Default)]
pub struct Stats {
    tasks: HashMap<TaskState, u64>,
    valid_status_updates: u64,
    invalid_status_updates: u64,
    valid_framework_messages: u64,
    invalid_framework_messages: u64,
}

impl Stats {
    fn new() -> Self {
        let mut stats = Self::default();
        for state in TaskState::CORE {
            stats.tasks.insert(state, 0);
        }
        stats
    }

    fn count_task(&mut self, state: TaskState) {
        *self.tasks.entry(state).or_insert(0) += 1;
    }

    pub fn task_count(&self, state: TaskState) -> u64 {
        self.tasks.get(&state).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: f64,
    pub connected: bool,
    pub tasks: BTreeMap<String, u64>,
    pub valid_status_updates: u64,
    pub invalid_status_updates: u64,
    pub valid_framework_messages: u64,
    pub invalid_framework_messages: u64,
}

// =============================================================================
// State snapshot (read-only view for HTTP)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub agent_id: Option<AgentId>,
    pub hostname: String,
    pub resources: Resources,
    pub attributes: Attributes,
    pub master: Option<Endpoint>,
    pub connected: bool,
    pub start_time: DateTime<Utc>,
    pub registered_time: Option<DateTime<Utc>>,
    pub reregistered_time: Option<DateTime<Utc>>,
    pub frameworks: Vec<FrameworkSnapshot>,
    pub completed_frameworks: Vec<FrameworkSnapshot>,
    pub attached_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkSnapshot {
    pub id: FrameworkId,
    pub name: String,
    pub user: String,
    pub checkpoint: bool,
    pub state: String,
    pub endpoint: Endpoint,
    pub executors: Vec<ExecutorSnapshot>,
    pub completed_executors: Vec<ExecutorSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorSnapshot {
    pub id: ExecutorId,
    pub run_id: RunId,
    pub state: String,
    pub endpoint: Option<Endpoint>,
    pub directory: String,
    pub resources: Resources,
    pub queued_tasks: Vec<Task>,
    pub launched_tasks: Vec<Task>,
    pub completed_tasks: Vec<Task>,
}

fn executor_snapshot(executor: &Executor) -> ExecutorSnapshot {
    ExecutorSnapshot {
        id: executor.id.clone(),
        run_id: executor.run_id,
        state: format!("{:?}", executor.state),
        endpoint: executor.endpoint.clone(),
        directory: executor.directory.to_string_lossy().into_owned(),
        resources: executor.resources.clone(),
        queued_tasks: executor.queued_records(),
        launched_tasks: executor.launched_records(),
        completed_tasks: executor.completed_tasks.iter().cloned().collect(),
    }
}

fn framework_snapshot(framework: &Framework) -> FrameworkSnapshot {
    FrameworkSnapshot {
        id: framework.id.clone(),
        name: framework.info.name.clone(),
        user: framework.info.user.clone(),
        checkpoint: framework.info.checkpoint,
        state: format!("{:?}", framework.state),
        endpoint: framework.endpoint.clone(),
        executors: framework.executors.values().map(executor_snapshot).collect(),
        completed_executors: framework
            .completed_executors
            .iter()
            .map(executor_snapshot)
            .collect(),
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a spawned agent.
pub struct AgentHandle {
    tx: mpsc::Sender<AgentEvent>,
    join: JoinHandle<Result<()>>,
}

impl AgentHandle {
    pub fn sender(&self) -> mpsc::Sender<AgentEvent> {
        self.tx.clone()
    }

    pub async fn deliver(&self, event: AgentEvent) {
        let _ = self.tx.send(event).await;
    }

    pub async fn deliver_master(&self, message: MasterToAgent, from: Option<Endpoint>) {
        self.deliver(AgentEvent::Master { message, from }).await;
    }

    pub async fn deliver_executor(&self, message: ExecutorToAgent, from: Endpoint) {
        self.deliver(AgentEvent::Executor { message, from }).await;
    }

    /// Snapshot of the entity graph; `None` once the agent has stopped.
    pub async fn state(&self) -> Option<StateSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AgentEvent::GetState { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Counter snapshot; `None` once the agent has stopped.
    pub async fn stats(&self) -> Option<StatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AgentEvent::GetStats { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Waits for the agent to stop.
    pub async fn join(self) -> Result<()> {
        self.join.await.context("agent task panicked")?
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}

// =============================================================================
// Agent
// =============================================================================

pub struct Agent {
    config: Config,
    info: AgentInfo,

    frameworks: BTreeMap<FrameworkId, Framework>,
    completed_frameworks: VecDeque<FrameworkSnapshot>,

    master: Option<Endpoint>,
    connected: bool,
    halting: bool,
    /// Local recovery finished; registration may proceed.
    recovered: bool,
    registration_epoch: u64,

    start_time: DateTime<Utc>,
    registered_time: Option<DateTime<Utc>>,
    reregistered_time: Option<DateTime<Utc>>,
    stats: Stats,

    isolator: Arc<dyn Isolator>,
    outbox: Arc<dyn Outbox>,
    updates: StatusUpdateManager,
    gc: GarbageCollector,
    monitor: ResourceMonitor,
    files: Files,

    tx: mpsc::Sender<AgentEvent>,
}

impl Agent {
    /// Builds the advertised description from configuration and host probes.
    pub fn build_info(config: &Config) -> Result<AgentInfo> {
        let (hostname, public_hostname) = resources::detect_hostname()?;
        let resources =
            resources::default_resources(config.resources.as_deref(), &config.work_dir)?;
        let attributes = config
            .attributes
            .as_deref()
            .map(Attributes::parse)
            .unwrap_or_default();

        Ok(AgentInfo {
            hostname,
            public_hostname,
            resources,
            attributes,
            checkpoint: config.checkpoint,
            id: None,
        })
    }

    /// Spawns the agent actor. Recovery runs before the first message is
    /// handled; a recovery failure stops the agent with an error.
    pub fn spawn(
        config: Config,
        isolator: Arc<dyn Isolator>,
        outbox: Arc<dyn Outbox>,
    ) -> Result<AgentHandle> {
        let info = Self::build_info(&config)?;
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);

        let updates = StatusUpdateManager::spawn(outbox.clone(), config.update_retry_interval);

        let agent = Agent {
            config,
            info,
            frameworks: BTreeMap::new(),
            completed_frameworks: VecDeque::new(),
            master: None,
            connected: false,
            halting: false,
            recovered: false,
            registration_epoch: 0,
            start_time: Utc::now(),
            registered_time: None,
            reregistered_time: None,
            stats: Stats::new(),
            isolator,
            outbox,
            updates,
            gc: GarbageCollector::new(),
            monitor: ResourceMonitor::new(),
            files: Files::new(),
            tx: tx.clone(),
        };

        let join = tokio::spawn(agent.run(rx));
        Ok(AgentHandle { tx, join })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<AgentEvent>) -> Result<()> {
        if let Err(e) = self.initialize().await {
            error!(error = %e, "Recovery failure");
            return Err(e);
        }

        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle(event).await {
                error!(error = %e, "Fatal agent error");
                return Err(e);
            }
            if self.halting {
                break;
            }
        }

        self.finalize().await;
        Ok(())
    }

    fn delay(&self, duration: Duration, event: AgentEvent) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(event).await;
        });
    }

    async fn handle(&mut self, event: AgentEvent) -> Result<()> {
        match event {
            AgentEvent::Master { message, from } => self.handle_master(message, from).await,
            AgentEvent::Executor { message, from } => self.handle_executor(message, from).await,
            AgentEvent::ExecutorTerminated {
                framework_id,
                executor_id,
                status,
                destroyed,
                message,
            } => {
                self.executor_terminated(framework_id, executor_id, status, destroyed, message)
                    .await
            }
            AgentEvent::MasterExited => {
                warn!("Master disconnected, waiting for a new master to be elected");
                self.connected = false;
                Ok(())
            }
            AgentEvent::RegistrationTick { epoch } => {
                if epoch == self.registration_epoch {
                    self.reliable_registration().await;
                }
                Ok(())
            }
            AgentEvent::RegisterExecutorTimeout {
                framework_id,
                executor_id,
                run_id,
            } => {
                self.register_executor_timeout(framework_id, executor_id, run_id)
                    .await
            }
            AgentEvent::ShutdownExecutorTimeout {
                framework_id,
                executor_id,
                run_id,
            } => {
                self.shutdown_executor_timeout(framework_id, executor_id, run_id)
                    .await
            }
            AgentEvent::ReregisterExecutorTimeout => self.reregister_executor_timeout().await,
            AgentEvent::CheckDiskUsage => {
                self.check_disk_usage().await;
                Ok(())
            }
            AgentEvent::GetState { reply } => {
                let _ = reply.send(self.state_snapshot());
                Ok(())
            }
            AgentEvent::GetStats { reply } => {
                let _ = reply.send(self.stats_snapshot());
                Ok(())
            }
        }
    }

    async fn handle_master(
        &mut self,
        message: MasterToAgent,
        from: Option<Endpoint>,
    ) -> Result<()> {
        match message {
            MasterToAgent::NewMasterDetected { master } => {
                self.new_master_detected(master).await;
                Ok(())
            }
            MasterToAgent::NoMasterDetected => {
                info!("Lost master(s), waiting");
                self.master = None;
                self.connected = false;
                Ok(())
            }
            MasterToAgent::AgentRegistered { agent_id } => self.registered(agent_id),
            MasterToAgent::AgentReregistered { agent_id } => self.reregistered(agent_id),
            MasterToAgent::RunTask {
                framework,
                framework_id,
                framework_endpoint,
                task,
            } => {
                self.run_task(framework, framework_id, framework_endpoint, task)
                    .await
            }
            MasterToAgent::KillTask {
                framework_id,
                task_id,
            } => self.kill_task(framework_id, task_id).await,
            MasterToAgent::ShutdownFramework { framework_id } => {
                if !self.from_registered_master(&from) {
                    warn!(
                        from = ?from,
                        "Ignoring shutdown framework message, not from the registered master"
                    );
                    return Ok(());
                }
                self.shutdown_framework(framework_id).await
            }
            MasterToAgent::FrameworkToExecutor {
                agent_id: _,
                framework_id,
                executor_id,
                data,
            } => {
                self.framework_message(framework_id, executor_id, data).await;
                Ok(())
            }
            MasterToAgent::UpdateFramework {
                framework_id,
                framework_endpoint,
            } => self.update_framework(framework_id, framework_endpoint),
            MasterToAgent::StatusUpdateAcknowledgement {
                agent_id: _,
                framework_id,
                task_id,
                update_id,
            } => {
                self.status_update_acknowledgement(framework_id, task_id, update_id)
                    .await
            }
            MasterToAgent::Shutdown => {
                if !self.from_registered_master(&from) {
                    warn!(from = ?from, "Ignoring shutdown message, not from the registered master");
                    return Ok(());
                }
                info!(from = ?from, "Agent asked to shut down");
                self.halting = true;
                Ok(())
            }
            MasterToAgent::Ping => {
                if let Some(from) = from {
                    self.outbox.send(&from, AgentOutbound::Pong).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_executor(&mut self, message: ExecutorToAgent, from: Endpoint) -> Result<()> {
        match message {
            ExecutorToAgent::RegisterExecutor {
                framework_id,
                executor_id,
            } => self.register_executor(framework_id, executor_id, from).await,
            ExecutorToAgent::ReregisterExecutor {
                framework_id,
                executor_id,
                tasks,
                updates,
            } => {
                self.reregister_executor(framework_id, executor_id, tasks, updates, from)
                    .await
            }
            ExecutorToAgent::StatusUpdate { update } => self.status_update(update).await,
            ExecutorToAgent::ExecutorToFramework {
                agent_id,
                framework_id,
                executor_id,
                data,
            } => {
                self.executor_message(agent_id, framework_id, executor_id, data)
                    .await;
                Ok(())
            }
        }
    }

    /// Messages that control the agent are honored only from the current
    /// master (or when the transport has no sender identity, e.g. tests).
    fn from_registered_master(&self, from: &Option<Endpoint>) -> bool {
        match from {
            None => true,
            Some(from) => self.master.as_ref() == Some(from),
        }
    }

    // =========================================================================
    // Registration controller
    // =========================================================================

    async fn new_master_detected(&mut self, master: Endpoint) {
        info!(master = %master, "New master detected");
        self.master = Some(master.clone());
        self.connected = false;

        // Retarget pending status-update retries.
        self.updates.new_master(master).await;

        match self.config.recover {
            RecoveryMode::Reconnect => {
                if self.recovered {
                    self.reliable_registration().await;
                }
                // Otherwise registration starts when recovery finishes.
            }
            RecoveryMode::Cleanup => {
                info!("Skipping registration, agent started in cleanup mode");
            }
        }
    }

    /// Sends (re-)registration and re-arms the retry timer. The chain stops
    /// once connected and is restarted by master changes.
    async fn reliable_registration(&mut self) {
        if self.connected || self.halting || !self.recovered {
            return;
        }
        if self.config.recover != RecoveryMode::Reconnect {
            return;
        }
        let Some(master) = self.master.clone() else {
            return;
        };

        match self.info.id.clone() {
            None => {
                debug!(master = %master, "Registering with master");
                self.outbox
                    .send(
                        &master,
                        AgentOutbound::RegisterAgent {
                            agent: self.info.clone(),
                        },
                    )
                    .await;
            }
            Some(agent_id) => {
                // Re-registering: include the full live view, queued tasks
                // presented as staging.
                let mut executors = Vec::new();
                let mut tasks = Vec::new();
                for framework in self.frameworks.values() {
                    for executor in framework.executors.values() {
                        let mut executor_info = executor.info.clone();
                        executor_info.framework_id = Some(framework.id.clone());
                        executors.push(executor_info);
                        tasks.extend(executor.launched_records());
                        tasks.extend(executor.queued_records());
                    }
                }

                debug!(
                    master = %master,
                    executors = executors.len(),
                    tasks = tasks.len(),
                    "Re-registering with master"
                );
                self.outbox
                    .send(
                        &master,
                        AgentOutbound::ReregisterAgent {
                            agent_id,
                            agent: self.info.clone(),
                            executors,
                            tasks,
                        },
                    )
                    .await;
            }
        }

        self.registration_epoch += 1;
        self.delay(
            self.config.registration_backoff,
            AgentEvent::RegistrationTick {
                epoch: self.registration_epoch,
            },
        );
    }

    fn registered(&mut self, agent_id: AgentId) -> Result<()> {
        info!(agent_id = %agent_id, "Registered with master");
        self.info.id = Some(agent_id.clone());
        self.connected = true;
        self.registered_time = Some(Utc::now());

        if self.config.checkpoint {
            let meta_root = paths::meta_root(&self.config.work_dir);
            checkpoint::write_json(&paths::agent_info_path(&meta_root, &agent_id), &self.info)?;
            checkpoint::write_pointer(&paths::latest_agent_path(&meta_root), agent_id.as_str())?;
        }

        // Anything left behind by other agent IDs in the work directory is
        // garbage now.
        let agents_dir = paths::agents_dir(&self.config.work_dir);
        if let Ok(entries) = std::fs::read_dir(&agents_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && entry.file_name().to_string_lossy() != agent_id.as_str() {
                    self.gc.schedule(self.config.gc_delay, path);
                }
            }
        }

        Ok(())
    }

    fn reregistered(&mut self, agent_id: AgentId) -> Result<()> {
        info!("Re-registered with master");
        if self.info.id.as_ref() != Some(&agent_id) {
            bail!(
                "re-registered with the wrong agent ID: expected {:?}, got {agent_id}",
                self.info.id
            );
        }
        self.connected = true;
        self.reregistered_time = Some(Utc::now());
        Ok(())
    }

    // =========================================================================
    // Task dispatch
    // =========================================================================

    async fn run_task(
        &mut self,
        framework_info: FrameworkInfo,
        framework_id: FrameworkId,
        framework_endpoint: Endpoint,
        task: TaskInfo,
    ) -> Result<()> {
        info!(
            task_id = %task.task_id,
            framework_id = %framework_id,
            "Got assigned task"
        );

        if framework_info.checkpoint && !self.config.checkpoint {
            warn!(
                framework_id = %framework_id,
                "Framework expects checkpointing but checkpointing is disabled on this agent"
            );
            let update = synthesized_update(
                &framework_id,
                self.info.id.as_ref(),
                &task.task_id,
                TaskState::Lost,
                "Framework expects checkpointing, but checkpointing is disabled on this agent",
                None,
            );
            return self.status_update(update).await;
        }

        if task.command.is_some() == task.executor.is_some() {
            warn!(task_id = %task.task_id, "Task carries neither or both of command and executor");
            let update = synthesized_update(
                &framework_id,
                self.info.id.as_ref(),
                &task.task_id,
                TaskState::Lost,
                "Malformed task: exactly one of command and executor is required",
                None,
            );
            return self.status_update(update).await;
        }

        if !self.frameworks.contains_key(&framework_id) {
            let Some(agent_id) = self.info.id.clone() else {
                warn!(task_id = %task.task_id, "Dropping task, agent has no ID yet");
                let update = synthesized_update(
                    &framework_id,
                    None,
                    &task.task_id,
                    TaskState::Lost,
                    "Agent has not completed registration",
                    None,
                );
                return self.status_update(update).await;
            };

            let framework = Framework::create(
                agent_id,
                framework_id.clone(),
                framework_info.clone(),
                framework_endpoint.clone(),
                &self.config.work_dir,
            )?;
            self.frameworks.insert(framework_id.clone(), framework);
        }

        let framework_state = self
            .frameworks
            .get(&framework_id)
            .map(|f| f.state)
            .expect("framework just ensured");

        match framework_state {
            FrameworkState::Initializing => {
                info!(
                    task_id = %task.task_id,
                    framework_id = %framework_id,
                    "Enqueuing task until framework is initialized"
                );
                if let Some(framework) = self.frameworks.get_mut(&framework_id) {
                    framework.pending.push(task);
                }
                return Ok(());
            }
            FrameworkState::Terminating => {
                warn!(
                    task_id = %task.task_id,
                    framework_id = %framework_id,
                    "Asked to run a task for a terminating framework"
                );
                let update = synthesized_update(
                    &framework_id,
                    self.info.id.as_ref(),
                    &task.task_id,
                    TaskState::Lost,
                    "Framework terminating",
                    None,
                );
                return self.status_update(update).await;
            }
            FrameworkState::Running => {}
        }

        // Re-delivery of an already-accepted task must not mutate anything.
        if self
            .frameworks
            .get(&framework_id)
            .is_some_and(|f| f.live_task_ids().contains(&task.task_id))
        {
            warn!(task_id = %task.task_id, "Ignoring duplicate task assignment");
            return Ok(());
        }

        let (executor_info, command_executor) = {
            let framework = self.frameworks.get(&framework_id).expect("checked above");
            let info = framework.executor_info_for(&task, &self.config.launcher_dir);
            (info, task.has_command())
        };
        let executor_id = executor_info.executor_id.clone();

        // Launch a fresh executor when none exists for this ID.
        let mut launch = None;
        {
            let framework = self.frameworks.get_mut(&framework_id).expect("checked above");
            if framework.executor(&executor_id).is_none() {
                let executor = framework.create_executor(executor_info, command_executor)?;
                launch = Some((
                    executor.run_id,
                    executor.directory.clone(),
                    executor.info.clone(),
                ));
            }
        }

        if let Some((run_id, directory, info)) = launch {
            self.files
                .attach(directory.to_string_lossy().into_owned(), &directory);
            self.monitor.watch(
                framework_id.clone(),
                executor_id.clone(),
                self.config.resource_monitoring_interval,
            );

            let executor_resources = info.resources.clone();
            if let Err(e) = self
                .isolator
                .launch_executor(
                    self.info.id.clone(),
                    framework_id.clone(),
                    framework_info.clone(),
                    info,
                    run_id,
                    directory,
                    executor_resources,
                )
                .await
            {
                error!(
                    executor_id = %executor_id,
                    error = %e,
                    "Failed to ask the isolator to launch the executor"
                );
            }

            // The executor must register within the timeout or be killed.
            self.delay(
                self.config.executor_registration_timeout,
                AgentEvent::RegisterExecutorTimeout {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    run_id,
                },
            );
        }

        enum Dispatch {
            Refuse,
            Queued,
            Send(Option<Endpoint>, Resources),
        }

        let dispatch = {
            let framework = self.frameworks.get_mut(&framework_id).expect("checked above");
            let executor = framework
                .executor_mut(&executor_id)
                .expect("executor just ensured");

            match executor.state {
                ExecutorState::Terminating | ExecutorState::Terminated => Dispatch::Refuse,
                ExecutorState::Registering => {
                    executor.checkpoint_task(&task)?;
                    info!(
                        task_id = %task.task_id,
                        executor_id = %executor_id,
                        "Queuing task until the executor registers"
                    );
                    executor.queued.insert(task.task_id.clone(), task.clone());
                    executor.resources.add(&task.resources);
                    Dispatch::Queued
                }
                ExecutorState::Running => {
                    executor.checkpoint_task(&task)?;
                    executor.add_task(task.clone());
                    Dispatch::Send(executor.endpoint.clone(), executor.resources.clone())
                }
            }
        };

        match dispatch {
            Dispatch::Refuse => {
                warn!(
                    task_id = %task.task_id,
                    executor_id = %executor_id,
                    "Asked to run a task on a terminating/terminated executor"
                );
                let update = synthesized_update(
                    &framework_id,
                    self.info.id.as_ref(),
                    &task.task_id,
                    TaskState::Lost,
                    "Executor terminating/terminated",
                    Some(&executor_id),
                );
                self.status_update(update).await
            }
            Dispatch::Queued => {
                self.stats.count_task(TaskState::Staging);
                Ok(())
            }
            Dispatch::Send(endpoint, resources) => {
                self.stats.count_task(TaskState::Staging);

                if let Err(e) = self
                    .isolator
                    .resources_changed(framework_id.clone(), executor_id.clone(), resources)
                    .await
                {
                    error!(error = %e, "Failed to inform the isolator of resource demand");
                }

                info!(
                    task_id = %task.task_id,
                    executor_id = %executor_id,
                    "Sending task to executor"
                );
                if let Some(endpoint) = endpoint {
                    self.outbox
                        .send(
                            &endpoint,
                            AgentOutbound::RunTask {
                                framework: framework_info,
                                framework_id,
                                framework_endpoint,
                                task,
                            },
                        )
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn kill_task(&mut self, framework_id: FrameworkId, task_id: TaskId) -> Result<()> {
        info!(task_id = %task_id, framework_id = %framework_id, "Asked to kill task");

        enum Kill {
            NoFramework,
            NoExecutor,
            Unregistered(ExecutorId),
            Forward(Option<Endpoint>),
        }

        let action = match self.frameworks.get_mut(&framework_id) {
            None => Kill::NoFramework,
            Some(framework) => match framework.executor_for_task_mut(&task_id) {
                None => Kill::NoExecutor,
                Some(executor) if executor.state == ExecutorState::Registering => {
                    // The task never started; kill the executor run too so a
                    // late registration is refused.
                    executor.state = ExecutorState::Terminating;
                    Kill::Unregistered(executor.id.clone())
                }
                Some(executor) => Kill::Forward(executor.endpoint.clone()),
            },
        };

        match action {
            Kill::NoFramework => {
                warn!(
                    task_id = %task_id,
                    framework_id = %framework_id,
                    "Cannot kill task, no such framework"
                );
                let update = synthesized_update(
                    &framework_id,
                    self.info.id.as_ref(),
                    &task_id,
                    TaskState::Lost,
                    "Cannot find framework",
                    None,
                );
                self.status_update(update).await
            }
            Kill::NoExecutor => {
                warn!(
                    task_id = %task_id,
                    framework_id = %framework_id,
                    "Cannot kill task, no executor owns it"
                );
                let update = synthesized_update(
                    &framework_id,
                    self.info.id.as_ref(),
                    &task_id,
                    TaskState::Lost,
                    "Cannot find executor",
                    None,
                );
                self.status_update(update).await
            }
            Kill::Unregistered(executor_id) => {
                let update = synthesized_update(
                    &framework_id,
                    self.info.id.as_ref(),
                    &task_id,
                    TaskState::Killed,
                    "Unregistered executor",
                    Some(&executor_id),
                );
                self.status_update(update).await
            }
            Kill::Forward(endpoint) => {
                if let Some(endpoint) = endpoint {
                    self.outbox
                        .send(
                            &endpoint,
                            AgentOutbound::KillTask {
                                framework_id,
                                task_id,
                            },
                        )
                        .await;
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Framework lifecycle
    // =========================================================================

    async fn shutdown_framework(&mut self, framework_id: FrameworkId) -> Result<()> {
        info!(framework_id = %framework_id, "Asked to shut down framework");

        if let Some(framework) = self.frameworks.get_mut(&framework_id) {
            framework.state = FrameworkState::Terminating;
            let executor_ids: Vec<ExecutorId> = framework.executors.keys().cloned().collect();
            for executor_id in executor_ids {
                self.shutdown_executor(&framework_id, &executor_id).await;
            }
        }

        // Streams for a terminating framework will never be acknowledged.
        self.updates.cleanup(framework_id).await;
        Ok(())
    }

    fn update_framework(
        &mut self,
        framework_id: FrameworkId,
        endpoint: Endpoint,
    ) -> Result<()> {
        if let Some(framework) = self.frameworks.get_mut(&framework_id) {
            info!(framework_id = %framework_id, endpoint = %endpoint, "Updating framework endpoint");
            framework.update_endpoint(endpoint)?;
        }
        Ok(())
    }

    async fn framework_message(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    ) {
        enum Relay {
            Drop(&'static str),
            Send(Endpoint),
        }

        let relay = match self.frameworks.get(&framework_id) {
            None => Relay::Drop("framework does not exist"),
            Some(framework) => match framework.executor(&executor_id) {
                None => Relay::Drop("executor does not exist"),
                Some(executor) if executor.state == ExecutorState::Registering => {
                    Relay::Drop("executor is not running")
                }
                Some(executor) => match &executor.endpoint {
                    Some(endpoint) => Relay::Send(endpoint.clone()),
                    None => Relay::Drop("executor endpoint unknown"),
                },
            },
        };

        match relay {
            Relay::Drop(reason) => {
                warn!(
                    framework_id = %framework_id,
                    executor_id = %executor_id,
                    reason,
                    "Dropping framework message"
                );
                self.stats.invalid_framework_messages += 1;
            }
            Relay::Send(endpoint) => {
                let Some(agent_id) = self.info.id.clone() else {
                    self.stats.invalid_framework_messages += 1;
                    return;
                };
                self.outbox
                    .send(
                        &endpoint,
                        AgentOutbound::FrameworkToExecutor {
                            agent_id,
                            framework_id,
                            executor_id,
                            data,
                        },
                    )
                    .await;
                self.stats.valid_framework_messages += 1;
            }
        }
    }

    async fn executor_message(
        &mut self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    ) {
        let Some(framework) = self.frameworks.get(&framework_id) else {
            warn!(
                framework_id = %framework_id,
                "Dropping executor message, framework does not exist"
            );
            self.stats.invalid_framework_messages += 1;
            return;
        };

        let endpoint = framework.endpoint.clone();
        info!(framework_id = %framework_id, endpoint = %endpoint, "Relaying executor message");
        self.outbox
            .send(
                &endpoint,
                AgentOutbound::ExecutorToFramework {
                    agent_id,
                    framework_id,
                    executor_id,
                    data,
                },
            )
            .await;
        self.stats.valid_framework_messages += 1;
    }

    // =========================================================================
    // Executor lifecycle
    // =========================================================================

    async fn register_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        from: Endpoint,
    ) -> Result<()> {
        info!(
            executor_id = %executor_id,
            framework_id = %framework_id,
            "Got registration for executor"
        );

        let accepted = match self.frameworks.get_mut(&framework_id) {
            None => {
                warn!(
                    framework_id = %framework_id,
                    "Framework does not exist, telling executor to exit"
                );
                false
            }
            Some(framework) => match framework.executor_mut(&executor_id) {
                None => {
                    warn!(executor_id = %executor_id, "Unexpected executor registering");
                    false
                }
                Some(executor) if executor.state != ExecutorState::Registering => {
                    warn!(
                        executor_id = %executor_id,
                        state = ?executor.state,
                        "Executor is not expected to be registering"
                    );
                    false
                }
                Some(executor) => {
                    executor.endpoint = Some(from.clone());
                    executor.state = ExecutorState::Running;
                    true
                }
            },
        };

        if !accepted {
            self.outbox.send(&from, AgentOutbound::ShutdownExecutor).await;
            return Ok(());
        }

        // Move queued tasks into the launched set and collect what needs to
        // flow to the executor.
        let (framework_info, framework_endpoint, executor_info, flushed, executor_resources) = {
            let framework = self.frameworks.get_mut(&framework_id).expect("checked above");
            let framework_info = framework.info.clone();
            let framework_endpoint = framework.endpoint.clone();
            let checkpoint_enabled = framework.info.checkpoint;

            let executor = framework.executor_mut(&executor_id).expect("checked above");
            if checkpoint_enabled {
                executor.checkpoint_endpoint(&from)?;
            }

            let flushed: Vec<TaskInfo> = executor.queued.values().cloned().collect();
            executor.queued.clear();
            for task in &flushed {
                // Accounted while queued; add_task re-adds.
                executor.resources.subtract(&task.resources);
                executor.add_task(task.clone());
            }

            (
                framework_info,
                framework_endpoint,
                executor.info.clone(),
                flushed,
                executor.resources.clone(),
            )
        };

        if let Err(e) = self
            .isolator
            .resources_changed(framework_id.clone(), executor_id.clone(), executor_resources)
            .await
        {
            error!(error = %e, "Failed to inform the isolator of resource demand");
        }

        let Some(agent_id) = self.info.id.clone() else {
            warn!("Executor registered before the agent itself; dropping handshake");
            return Ok(());
        };

        self.outbox
            .send(
                &from,
                AgentOutbound::ExecutorRegistered {
                    executor: executor_info,
                    framework_id: framework_id.clone(),
                    framework: framework_info.clone(),
                    agent_id,
                    agent: self.info.clone(),
                },
            )
            .await;

        info!(framework_id = %framework_id, count = flushed.len(), "Flushing queued tasks");
        for task in flushed {
            self.outbox
                .send(
                    &from,
                    AgentOutbound::RunTask {
                        framework: framework_info.clone(),
                        framework_id: framework_id.clone(),
                        framework_endpoint: framework_endpoint.clone(),
                        task,
                    },
                )
                .await;
        }

        Ok(())
    }

    async fn reregister_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<TaskInfo>,
        updates: Vec<StatusUpdate>,
        from: Endpoint,
    ) -> Result<()> {
        info!(
            executor_id = %executor_id,
            framework_id = %framework_id,
            tasks = tasks.len(),
            updates = updates.len(),
            "Re-registering executor"
        );

        let accepted = match self.frameworks.get_mut(&framework_id) {
            None => false,
            Some(framework) => match framework.executor_mut(&executor_id) {
                None => false,
                Some(executor) => {
                    executor.endpoint = Some(from.clone());
                    executor.state = ExecutorState::Running;
                    true
                }
            },
        };

        if !accepted {
            warn!(
                executor_id = %executor_id,
                framework_id = %framework_id,
                "Unknown executor re-registering, telling it to exit"
            );
            self.outbox.send(&from, AgentOutbound::ShutdownExecutor).await;
            return Ok(());
        }

        if let Some(agent_id) = self.info.id.clone() {
            self.outbox
                .send(
                    &from,
                    AgentOutbound::ExecutorReregistered {
                        agent_id,
                        agent: self.info.clone(),
                    },
                )
                .await;
        }

        // Replay pending updates the agent has not seen. Updates already in
        // the in-flight set were checkpointed before the restart (the agent
        // died before acknowledging the executor) and are dropped here.
        let replay: Vec<StatusUpdate> = {
            let framework = self.frameworks.get(&framework_id).expect("checked above");
            let executor = framework.executor(&executor_id).expect("checked above");
            updates
                .into_iter()
                .filter(|u| !executor.has_update(&u.task_id, &u.update_id))
                .collect()
        };
        for update in replay {
            self.status_update(update).await?;
        }

        // Any task still staging that the executor does not know about was
        // checkpointed but never delivered. Send it again.
        let (framework_info, framework_endpoint, relaunch) = {
            let known: std::collections::HashSet<&TaskId> =
                tasks.iter().map(|t| &t.task_id).collect();
            let framework = self.frameworks.get(&framework_id).expect("checked above");
            let executor = framework.executor(&executor_id).expect("checked above");
            let relaunch: Vec<TaskInfo> = executor
                .launched
                .values()
                .filter(|t| t.state == TaskState::Staging && !known.contains(&t.info.task_id))
                .map(|t| t.info.clone())
                .collect();
            (framework.info.clone(), framework.endpoint.clone(), relaunch)
        };

        for task in relaunch {
            info!(task_id = %task.task_id, executor_id = %executor_id, "Relaunching staged task");
            self.outbox
                .send(
                    &from,
                    AgentOutbound::RunTask {
                        framework: framework_info.clone(),
                        framework_id: framework_id.clone(),
                        framework_endpoint: framework_endpoint.clone(),
                        task,
                    },
                )
                .await;
        }

        Ok(())
    }

    async fn shutdown_executor(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        info!(
            executor_id = %executor_id,
            framework_id = %framework_id,
            "Shutting down executor"
        );

        let (endpoint, run_id) = {
            let Some(framework) = self.frameworks.get_mut(framework_id) else {
                return;
            };
            let Some(executor) = framework.executor_mut(executor_id) else {
                return;
            };
            executor.state = ExecutorState::Terminating;
            (executor.endpoint.clone(), executor.run_id)
        };

        // Unregistered executors never see this; the registration timeout
        // covers them.
        if let Some(endpoint) = endpoint {
            self.outbox
                .send(&endpoint, AgentOutbound::ShutdownExecutor)
                .await;
        }

        self.delay(
            self.config.executor_shutdown_grace_period,
            AgentEvent::ShutdownExecutorTimeout {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
                run_id,
            },
        );
    }

    async fn shutdown_executor_timeout(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_id: RunId,
    ) -> Result<()> {
        let Some(current) = self.executor_run_id(&framework_id, &executor_id) else {
            info!(
                executor_id = %executor_id,
                "Executor already gone, ignoring shutdown timeout"
            );
            return Ok(());
        };
        if current != run_id {
            info!(
                executor_id = %executor_id,
                "A new executor run is active, ignoring stale shutdown timeout"
            );
            return Ok(());
        }

        info!(executor_id = %executor_id, framework_id = %framework_id, "Killing executor");
        if let Err(e) = self
            .isolator
            .kill_executor(framework_id, executor_id)
            .await
        {
            error!(error = %e, "Failed to ask the isolator to kill the executor");
        }
        Ok(())
    }

    async fn register_executor_timeout(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        run_id: RunId,
    ) -> Result<()> {
        let never_registered = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                return Ok(());
            };
            let Some(executor) = framework.executor_mut(&executor_id) else {
                return Ok(());
            };
            if executor.run_id != run_id {
                info!(
                    executor_id = %executor_id,
                    "A new executor run is active, ignoring stale registration timeout"
                );
                return Ok(());
            }
            if executor.endpoint.is_none() {
                executor.state = ExecutorState::Terminating;
                true
            } else {
                false
            }
        };

        if never_registered {
            info!(
                executor_id = %executor_id,
                framework_id = %framework_id,
                "Terminating executor, it did not register within the timeout"
            );
            if let Err(e) = self
                .isolator
                .kill_executor(framework_id, executor_id)
                .await
            {
                error!(error = %e, "Failed to ask the isolator to kill the executor");
            }
        }
        Ok(())
    }

    fn executor_run_id(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Option<RunId> {
        self.frameworks
            .get(framework_id)?
            .executor(executor_id)
            .map(|e| e.run_id)
    }

    async fn executor_terminated(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        status: i32,
        destroyed: bool,
        message: String,
    ) -> Result<()> {
        info!(
            executor_id = %executor_id,
            framework_id = %framework_id,
            status,
            destroyed,
            "Executor terminated"
        );

        self.monitor.unwatch(&framework_id, &executor_id);

        let mut synthesized = Vec::new();
        let command_executor;
        {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                warn!(framework_id = %framework_id, "Framework no longer valid");
                return Ok(());
            };
            let framework_terminating = framework.state == FrameworkState::Terminating;
            let Some(executor) = framework.executor_mut(&executor_id) else {
                warn!(executor_id = %executor_id, "Unknown executor terminated");
                return Ok(());
            };

            executor.state = ExecutorState::Terminated;
            command_executor = executor.command_executor;

            // Live tasks die with their executor. A terminating framework
            // gets no updates: it will never acknowledge them.
            if !framework_terminating {
                let state = if destroyed || command_executor {
                    TaskState::Failed
                } else {
                    TaskState::Lost
                };

                for task in executor.launched.values() {
                    if !task.state.is_terminal() {
                        synthesized.push((task.info.task_id.clone(), state));
                    }
                }
                for task_id in executor.queued.keys() {
                    synthesized.push((task_id.clone(), state));
                }
            }
        }

        for (task_id, state) in synthesized {
            let update = synthesized_update(
                &framework_id,
                self.info.id.as_ref(),
                &task_id,
                state,
                &message,
                Some(&executor_id),
            );
            self.status_update(update).await?;
        }

        // The master tracks executors it knows by name; synthesized command
        // executors are invisible to it.
        if !command_executor {
            if let (Some(master), Some(agent_id)) = (self.master.clone(), self.info.id.clone()) {
                self.outbox
                    .send(
                        &master,
                        AgentOutbound::ExitedExecutor {
                            agent_id,
                            framework_id: framework_id.clone(),
                            executor_id: executor_id.clone(),
                            status,
                        },
                    )
                    .await;
            }
        }

        self.try_cleanup(&framework_id, &executor_id);
        Ok(())
    }

    /// Retires the executor if it is terminated with nothing left to
    /// acknowledge, then the framework if it has no executors left. In
    /// cleanup mode, the last framework takes the whole agent down.
    fn try_cleanup(&mut self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let mut retired_dir: Option<PathBuf> = None;
        let mut framework_empty = false;

        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            let terminating = framework.state == FrameworkState::Terminating;
            if let Some(executor) = framework.executor(executor_id) {
                if executor.state == ExecutorState::Terminated
                    && (executor.updates_empty() || terminating)
                {
                    retired_dir = Some(executor.directory.clone());
                    framework.destroy_executor(executor_id);
                }
            }
            framework_empty = framework.executors.is_empty();
        }

        if let Some(dir) = retired_dir {
            self.gc.schedule(self.config.gc_delay, &dir);
            self.files.detach(&dir.to_string_lossy());
        }

        if framework_empty {
            if let Some(framework) = self.frameworks.remove(framework_id) {
                info!(framework_id = %framework_id, "Framework completed");
                self.completed_frameworks
                    .push_back(framework_snapshot(&framework));
                while self.completed_frameworks.len() > MAX_COMPLETED_FRAMEWORKS {
                    self.completed_frameworks.pop_front();
                }
            }
        }

        if self.config.recover == RecoveryMode::Cleanup && self.frameworks.is_empty() {
            self.cleanup_shutdown();
        }
    }

    /// Cleanup-mode exit: archive the meta directory so an incompatible
    /// upgrade can start fresh, then halt.
    fn cleanup_shutdown(&mut self) {
        info!("All executors terminated, shutting down in cleanup mode");

        let meta = paths::meta_root(&self.config.work_dir);
        if meta.exists() {
            if let Err(e) = archive_meta(&self.config.work_dir, self.info.id.as_ref()) {
                error!(error = %e, "Failed to archive the meta directory");
            }
            if let Err(e) = std::fs::remove_dir_all(&meta) {
                error!(error = %e, "Failed to delete the meta directory");
            }
        }

        self.halting = true;
    }

    // =========================================================================
    // Status updates
    // =========================================================================

    /// Every update flows through here, whether reported by an executor or
    /// synthesized locally.
    async fn status_update(&mut self, update: StatusUpdate) -> Result<()> {
        info!(update = %update, "Handling status update");

        let mut resource_change = None;
        let mut ack_endpoint = None;
        let mut checkpoint_path = None;
        let mut framework_checkpoint = false;
        let mut executor_known = false;

        if let Some(framework) = self.frameworks.get_mut(&update.framework_id) {
            framework_checkpoint = framework.info.checkpoint;
            if let Some(executor) = framework.executor_for_task_mut(&update.task_id) {
                executor_known = true;
                executor.update_task_state(&update.task_id, update.state);
                executor.add_update(&update.task_id, update.update_id);
                checkpoint_path = executor.updates_log_path(&update.task_id);
                ack_endpoint = executor.endpoint.clone();

                if update.state.is_terminal() {
                    executor.remove_task(&update.task_id);
                    resource_change = Some((executor.id.clone(), executor.resources.clone()));
                }
            } else {
                warn!(
                    task_id = %update.task_id,
                    framework_id = %update.framework_id,
                    "Could not find executor for status update"
                );
                self.stats.invalid_status_updates += 1;
            }
        } else {
            warn!(
                framework_id = %update.framework_id,
                task_id = %update.task_id,
                "Could not find framework for status update"
            );
            self.stats.invalid_status_updates += 1;
        }

        self.stats.count_task(update.state);
        self.stats.valid_status_updates += 1;

        if let Some((executor_id, resources)) = resource_change {
            if let Err(e) = self
                .isolator
                .resources_changed(update.framework_id.clone(), executor_id, resources)
                .await
            {
                error!(error = %e, "Failed to inform the isolator of resource demand");
            }
        }

        // Forward even for unknown frameworks/executors: the framework may
        // use the update stream to reconcile out-of-band.
        let with_checkpoint = framework_checkpoint && executor_known;
        let path = if with_checkpoint { checkpoint_path } else { None };

        match self.updates.update(update.clone(), with_checkpoint, path).await {
            Ok(()) => {
                // Safe to acknowledge the source executor.
                if let (Some(endpoint), Some(agent_id)) = (ack_endpoint, self.info.id.clone()) {
                    debug!(update = %update, "Acknowledging executor");
                    self.outbox
                        .send(
                            &endpoint,
                            AgentOutbound::StatusUpdateAcknowledgement {
                                agent_id,
                                framework_id: update.framework_id,
                                task_id: update.task_id,
                                update_id: update.update_id,
                            },
                        )
                        .await;
                }
                Ok(())
            }
            Err(UpdateManagerError::Checkpoint(e)) => {
                Err(anyhow!(e).context("failed to checkpoint a status update"))
            }
            Err(e) => {
                error!(update = %update, error = %e, "Status-update pipeline refused the update");
                Ok(())
            }
        }
    }

    async fn status_update_acknowledgement(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    ) -> Result<()> {
        info!(
            task_id = %task_id,
            framework_id = %framework_id,
            "Got acknowledgement of status update"
        );

        match self
            .updates
            .acknowledgement(framework_id.clone(), task_id.clone(), update_id)
            .await
        {
            Ok(()) => {}
            Err(UpdateManagerError::Checkpoint(e)) => {
                return Err(anyhow!(e).context("failed to checkpoint an acknowledgement"));
            }
            Err(e) => {
                error!(
                    task_id = %task_id,
                    error = %e,
                    "Failed to handle status-update acknowledgement"
                );
                return Ok(());
            }
        }

        let (executor_id, executor_endpoint) = {
            let Some(framework) = self.frameworks.get_mut(&framework_id) else {
                error!(
                    framework_id = %framework_id,
                    "Acknowledgement for an unknown framework"
                );
                return Ok(());
            };
            let Some(executor) = framework.executor_for_task_mut(&task_id) else {
                error!(task_id = %task_id, "Acknowledgement for an unknown executor");
                return Ok(());
            };
            executor.remove_update(&task_id, &update_id);
            (executor.id.clone(), executor.endpoint.clone())
        };

        // Propagate the acknowledgement so the executor can drop the update
        // from its own retry set. Executors tolerate duplicate acks.
        if let (Some(endpoint), Some(agent_id)) = (executor_endpoint, self.info.id.clone()) {
            self.outbox
                .send(
                    &endpoint,
                    AgentOutbound::StatusUpdateAcknowledgement {
                        agent_id,
                        framework_id: framework_id.clone(),
                        task_id: task_id.clone(),
                        update_id,
                    },
                )
                .await;
        }

        self.try_cleanup(&framework_id, &executor_id);
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    async fn initialize(&mut self) -> Result<()> {
        info!(
            resources = %self.info.resources,
            work_dir = %self.config.work_dir.display(),
            recover = ?self.config.recover,
            "Agent starting"
        );

        self.delay(self.config.disk_watch_interval, AgentEvent::CheckDiskUsage);

        let meta_root = paths::meta_root(&self.config.work_dir);

        let recovered = state::recover(&meta_root, self.config.safe).map_err(|e| {
            anyhow!(
                "failed to recover agent state: {e}\n\
                 To discard the old state, restart the agent with SKIFF_RECOVER=cleanup, \
                 wait for it to kill all executors and exit, then start fresh."
            )
        })?;

        let Some(recovered) = recovered else {
            // First start with checkpointing, or post-upgrade: only the
            // isolator may have orphans to sweep.
            info!("No checkpointed state found");
            self.isolator
                .recover(None)
                .await
                .map_err(|e| anyhow!(e).context("isolator recovery failed"))?;
            self.recovered = true;
            return Ok(());
        };

        let Some(stored_info) = recovered.info.clone() else {
            info!("Agent died before checkpointing its description, starting fresh");
            self.isolator
                .recover(None)
                .await
                .map_err(|e| anyhow!(e).context("isolator recovery failed"))?;
            self.recovered = true;
            return Ok(());
        };

        if self.config.recover == RecoveryMode::Reconnect && !self.info.compatible(&stored_info) {
            bail!(
                "incompatible agent description detected.\n\
                 Old: {stored:?}\nNew: {new:?}\n\
                 To upgrade this agent:\n\
                 Step 1: restart it with the old configuration and SKIFF_RECOVER=cleanup.\n\
                 Step 2: wait until it has killed all executors and shut down.\n\
                 Step 3: start the upgraded agent.",
                stored = stored_info,
                new = self.info,
            );
        }

        // Adopt the stored identity.
        self.info = stored_info;
        self.info.id = recovered.agent_id.clone();
        let agent_id = self
            .info
            .id
            .clone()
            .ok_or_else(|| anyhow!("recovered state carries no agent ID"))?;
        info!(agent_id = %agent_id, "Recovered agent identity");

        // Pipeline first, then the isolator, then the entity graph.
        let streams = recovered_streams(&meta_root, &recovered);
        self.updates
            .recover(streams)
            .await
            .map_err(|e| anyhow!(e).context("update-manager recovery failed"))?;
        self.isolator
            .recover(Some(&recovered))
            .await
            .map_err(|e| anyhow!(e).context("isolator recovery failed"))?;

        let mut live_executors = Vec::new();
        for (framework_id, rec) in &recovered.frameworks {
            let (Some(info), Some(endpoint)) = (rec.info.clone(), rec.endpoint.clone()) else {
                warn!(
                    framework_id = %framework_id,
                    "Skipping framework recovery, description or endpoint missing"
                );
                continue;
            };

            let mut framework = Framework::recover(
                agent_id.clone(),
                framework_id.clone(),
                info,
                endpoint,
                &self.config.work_dir,
            );
            framework.recover_executors(&rec.executors);

            for executor in framework.executors.values() {
                live_executors.push((
                    framework_id.clone(),
                    executor.id.clone(),
                    executor.endpoint.clone(),
                    executor.directory.clone(),
                ));
            }

            self.frameworks.insert(framework_id.clone(), framework);
        }

        for (framework_id, executor_id, endpoint, directory) in live_executors {
            self.files
                .attach(directory.to_string_lossy().into_owned(), &directory);
            self.monitor.watch(
                framework_id.clone(),
                executor_id.clone(),
                self.config.resource_monitoring_interval,
            );

            match self.config.recover {
                RecoveryMode::Reconnect => match endpoint {
                    Some(endpoint) => {
                        info!(
                            executor_id = %executor_id,
                            endpoint = %endpoint,
                            "Sending reconnect request to executor"
                        );
                        self.outbox
                            .send(
                                &endpoint,
                                AgentOutbound::ReconnectExecutor {
                                    agent_id: agent_id.clone(),
                                },
                            )
                            .await;
                    }
                    None => {
                        info!(
                            executor_id = %executor_id,
                            "Unable to reconnect to executor, no endpoint on record"
                        );
                    }
                },
                RecoveryMode::Cleanup => match endpoint {
                    Some(_) => {
                        self.shutdown_executor(&framework_id, &executor_id).await;
                    }
                    None => {
                        info!(
                            executor_id = %executor_id,
                            "Killing executor, no endpoint on record"
                        );
                        if let Err(e) = self
                            .isolator
                            .kill_executor(framework_id.clone(), executor_id.clone())
                            .await
                        {
                            error!(error = %e, "Failed to ask the isolator to kill the executor");
                        }
                    }
                },
            }
        }

        match self.config.recover {
            RecoveryMode::Reconnect => {
                // Executors get a window to re-register; the agent only
                // registers with the master once that window closes.
                self.delay(
                    self.config.executor_reregister_timeout,
                    AgentEvent::ReregisterExecutorTimeout,
                );
            }
            RecoveryMode::Cleanup => {
                self.recovered = true;
            }
        }

        info!("Finished recovery");
        Ok(())
    }

    async fn reregister_executor_timeout(&mut self) -> Result<()> {
        info!("Cleaning up executors that did not re-register");

        let mut to_kill = Vec::new();
        for framework in self.frameworks.values() {
            for executor in framework.executors.values() {
                if executor.endpoint.is_none() {
                    to_kill.push((framework.id.clone(), executor.id.clone()));
                }
            }
        }

        for (framework_id, executor_id) in to_kill {
            info!(
                executor_id = %executor_id,
                framework_id = %framework_id,
                "Killing executor that never re-registered"
            );
            if let Err(e) = self
                .isolator
                .kill_executor(framework_id, executor_id)
                .await
            {
                error!(error = %e, "Failed to ask the isolator to kill the executor");
            }
        }

        // Recovery is complete; the agent may now present its view to the
        // master.
        self.recovered = true;
        self.reliable_registration().await;
        Ok(())
    }

    // =========================================================================
    // Disk housekeeping
    // =========================================================================

    /// The older a directory may get before collection, scaled by pressure:
    /// a full disk tolerates no age at all.
    fn max_gc_age(&self, usage: f64) -> Duration {
        self.config.gc_delay.mul_f64((1.0 - usage).clamp(0.0, 1.0))
    }

    async fn check_disk_usage(&mut self) {
        match resources::disk_usage(&self.config.work_dir) {
            Ok(usage) => {
                let max_age = self.max_gc_age(usage);
                info!(
                    usage_percent = format!("{:.2}", usage * 100.0),
                    max_age_secs = max_age.as_secs(),
                    "Checked disk usage"
                );

                // Entries scheduled `gc_delay` out are collected once they
                // are within `gc_delay - max_age` of their deadline.
                let window = self.config.gc_delay.saturating_sub(max_age);
                self.gc.prune(window).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to sample disk usage");
            }
        }

        self.delay(self.config.disk_watch_interval, AgentEvent::CheckDiskUsage);
    }

    // =========================================================================
    // Snapshots & teardown
    // =========================================================================

    fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            agent_id: self.info.id.clone(),
            hostname: self.info.public_hostname.clone(),
            resources: self.info.resources.clone(),
            attributes: self.info.attributes.clone(),
            master: self.master.clone(),
            connected: self.connected,
            start_time: self.start_time,
            registered_time: self.registered_time,
            reregistered_time: self.reregistered_time,
            frameworks: self.frameworks.values().map(framework_snapshot).collect(),
            completed_frameworks: self.completed_frameworks.iter().cloned().collect(),
            attached_files: self
                .files
                .list()
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
        }
    }

    fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0,
            connected: self.connected,
            tasks: self
                .stats
                .tasks
                .iter()
                .map(|(state, count)| (state.to_string(), *count))
                .collect(),
            valid_status_updates: self.stats.valid_status_updates,
            invalid_status_updates: self.stats.invalid_status_updates,
            valid_framework_messages: self.stats.valid_framework_messages,
            invalid_framework_messages: self.stats.invalid_framework_messages,
        }
    }

    async fn finalize(&mut self) {
        info!("Agent terminating");

        // Checkpointing frameworks survive a restart; the rest are shut
        // down. A halting agent takes everything down.
        let framework_ids: Vec<FrameworkId> = self.frameworks.keys().cloned().collect();
        for framework_id in framework_ids {
            let survives = self
                .frameworks
                .get(&framework_id)
                .map(|f| f.info.checkpoint)
                .unwrap_or(false);
            if self.halting || !survives {
                if let Err(e) = self.shutdown_framework(framework_id.clone()).await {
                    error!(framework_id = %framework_id, error = %e, "Failed to shut down framework");
                }
            }
        }
    }
}

/// Builds the update-manager recovery input from the recovered meta tree.
fn recovered_streams(meta_root: &std::path::Path, recovered: &RecoveredAgent) -> Vec<RecoveredStream> {
    let mut streams = Vec::new();
    let Some(agent_id) = &recovered.agent_id else {
        return streams;
    };

    for (framework_id, framework) in &recovered.frameworks {
        for (executor_id, executor) in &framework.executors {
            let Some(run) = executor.latest_run() else {
                continue;
            };
            let run_dir = paths::run_dir(meta_root, agent_id, framework_id, executor_id, &run.id);
            for (task_id, task) in &run.tasks {
                if task.updates.is_empty() {
                    continue;
                }
                streams.push(RecoveredStream {
                    framework_id: framework_id.clone(),
                    task_id: task_id.clone(),
                    path: Some(paths::task_updates_path(&run_dir, task_id)),
                    updates: task.updates.clone(),
                    acks: task.acks.clone(),
                });
            }
        }
    }

    streams
}

/// Archives the meta directory to `archive/<agent_id>.tar.gz`.
fn archive_meta(work_dir: &std::path::Path, agent_id: Option<&AgentId>) -> Result<()> {
    let meta = paths::meta_root(work_dir);
    let archive_dir = paths::archive_dir(work_dir);
    std::fs::create_dir_all(&archive_dir)?;

    let name = agent_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "meta".to_string());
    let file = std::fs::File::create(archive_dir.join(format!("{name}.tar.gz")))?;

    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all("meta", &meta)?;
    builder.into_inner()?.finish()?;

    info!(archive = %archive_dir.display(), "Archived the meta directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(gc_delay: Duration) -> Config {
        Config {
            recover: RecoveryMode::Reconnect,
            safe: true,
            checkpoint: false,
            work_dir: PathBuf::from("/tmp/skiff-test"),
            resources: Some("cpus:2;mem:512;disk:1024".to_string()),
            attributes: None,
            disk_watch_interval: Duration::from_secs(3600),
            gc_delay,
            executor_registration_timeout: Duration::from_secs(60),
            executor_shutdown_grace_period: Duration::from_secs(5),
            executor_reregister_timeout: Duration::from_secs(120),
            resource_monitoring_interval: Duration::from_secs(1),
            launcher_dir: PathBuf::from("/usr/libexec/skiff"),
            registration_backoff: Duration::from_secs(1),
            update_retry_interval: Duration::from_secs(10),
            http_listen_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    fn test_agent(config: Config) -> Agent {
        let (outbox, _rx) = crate::outbox::ChannelOutbox::new();
        let outbox: Arc<dyn Outbox> = Arc::new(outbox);
        let (tx, _rx) = mpsc::channel(8);
        Agent {
            info: AgentInfo {
                hostname: "host".to_string(),
                public_hostname: "host".to_string(),
                resources: Resources::parse("cpus:2;mem:512").unwrap(),
                attributes: Attributes::default(),
                checkpoint: config.checkpoint,
                id: None,
            },
            updates: StatusUpdateManager::spawn(outbox.clone(), config.update_retry_interval),
            config,
            frameworks: BTreeMap::new(),
            completed_frameworks: VecDeque::new(),
            master: None,
            connected: false,
            halting: false,
            recovered: false,
            registration_epoch: 0,
            start_time: Utc::now(),
            registered_time: None,
            reregistered_time: None,
            stats: Stats::new(),
            isolator: Arc::new(crate::isolator::MockIsolator::new()),
            outbox,
            gc: GarbageCollector::new(),
            monitor: ResourceMonitor::new(),
            files: Files::new(),
            tx,
        }
    }

    #[tokio::test]
    async fn test_max_gc_age_scales_with_pressure() {
        let agent = test_agent(test_config(Duration::from_secs(14 * 86400)));

        // Half-full disk halves the tolerated age.
        assert_eq!(
            agent.max_gc_age(0.5),
            Duration::from_secs(7 * 86400)
        );
        // A full disk tolerates nothing; an empty one everything.
        assert_eq!(agent.max_gc_age(1.0), Duration::ZERO);
        assert_eq!(agent.max_gc_age(0.0), Duration::from_secs(14 * 86400));
        // Out-of-range samples clamp.
        assert_eq!(agent.max_gc_age(1.5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_stats_initialize_core_states() {
        let agent = test_agent(test_config(Duration::from_secs(60)));
        let snapshot = agent.stats_snapshot();
        for state in TaskState::CORE {
            assert_eq!(snapshot.tasks.get(&state.to_string()), Some(&0));
        }
    }

    #[tokio::test]
    async fn test_from_registered_master() {
        let mut agent = test_agent(test_config(Duration::from_secs(60)));
        let master = Endpoint::new("http://m1:5050");

        // No sender identity: trusted (local delivery, tests).
        assert!(agent.from_registered_master(&None));

        // Sender known but no master yet: refused.
        assert!(!agent.from_registered_master(&Some(master.clone())));

        agent.master = Some(master.clone());
        assert!(agent.from_registered_master(&Some(master)));
        assert!(!agent.from_registered_master(&Some(Endpoint::new("http://rogue:1"))));
    }
}
