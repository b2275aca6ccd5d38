//! The agent-owned entity graph: frameworks, executors, tasks.
//!
//! Ownership is strictly nested: the agent owns frameworks, a framework owns
//! its executors, an executor owns its tasks. Cross-references are IDs only.
//! All mutation happens on the agent's event loop, so none of this is
//! synchronized.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use skiff_id::{AgentId, ExecutorId, FrameworkId, RunId, TaskId, UpdateId};
use skiff_messages::{
    CommandInfo, Endpoint, ExecutorInfo, FrameworkInfo, Resources, StatusUpdate, Task, TaskInfo,
    TaskState,
};
use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointError};
use crate::paths;
use crate::state::{RecoveredExecutor, RecoveredTask};

/// Recently-completed entities kept for the state snapshot.
pub const MAX_COMPLETED_FRAMEWORKS: usize = 50;
pub const MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK: usize = 150;
pub const MAX_COMPLETED_TASKS_PER_EXECUTOR: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameworkState {
    /// Reserved by the model; the default path goes straight to Running.
    Initializing,
    Running,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Launched, waiting for the executor to register.
    Registering,
    Running,
    Terminating,
    Terminated,
}

/// A task that has been handed to (or recovered for) an executor.
#[derive(Debug, Clone)]
pub struct LaunchedTask {
    pub info: TaskInfo,
    pub state: TaskState,
}

impl LaunchedTask {
    fn record(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) -> Task {
        Task::from_info(&self.info, self.state, executor_id.clone(), framework_id.clone())
    }
}

// =============================================================================
// Executor
// =============================================================================

pub struct Executor {
    pub id: ExecutorId,
    pub framework_id: FrameworkId,
    pub info: ExecutorInfo,
    /// Distinguishes this launch from earlier launches of the same ID.
    pub run_id: RunId,
    /// Sandbox directory for this run.
    pub directory: PathBuf,
    pub state: ExecutorState,
    /// Known once the executor registers.
    pub endpoint: Option<Endpoint>,
    /// True when the agent synthesized this executor for a command task.
    pub command_executor: bool,

    /// Accepted but not yet handed over (executor still registering).
    pub queued: BTreeMap<TaskId, TaskInfo>,
    /// Handed to the executor; value tracks the latest known state.
    pub launched: BTreeMap<TaskId, LaunchedTask>,
    pub completed_tasks: VecDeque<Task>,
    /// Status updates not yet acknowledged by the master, per task.
    pub updates: HashMap<TaskId, HashSet<UpdateId>>,
    /// Sum of resources of queued + launched tasks.
    pub resources: Resources,

    /// Checkpoint directory for this run; unset when not checkpointing.
    meta_run_dir: Option<PathBuf>,
}

impl Executor {
    /// Adds a task to `launched`, accounting its resources.
    pub fn add_task(&mut self, info: TaskInfo) {
        if self.launched.contains_key(&info.task_id) {
            warn!(task_id = %info.task_id, executor_id = %self.id, "task already launched");
            return;
        }

        self.resources.add(&info.resources);
        self.launched.insert(
            info.task_id.clone(),
            LaunchedTask {
                info,
                state: TaskState::Staging,
            },
        );
    }

    /// Drops a task from the live sets, releasing its resources.
    ///
    /// A launched task moves into the completed FIFO with its final state.
    pub fn remove_task(&mut self, task_id: &TaskId) {
        if let Some(info) = self.queued.remove(task_id) {
            self.resources.subtract(&info.resources);
        }

        if let Some(task) = self.launched.remove(task_id) {
            self.resources.subtract(&task.info.resources);
            self.completed_tasks
                .push_back(task.record(&self.framework_id, &self.id));
            while self.completed_tasks.len() > MAX_COMPLETED_TASKS_PER_EXECUTOR {
                self.completed_tasks.pop_front();
            }
        }
    }

    pub fn update_task_state(&mut self, task_id: &TaskId, state: TaskState) {
        if let Some(task) = self.launched.get_mut(task_id) {
            task.state = state;
        }
    }

    /// Whether this executor knows the task in any live set.
    pub fn has_task(&self, task_id: &TaskId) -> bool {
        self.queued.contains_key(task_id)
            || self.launched.contains_key(task_id)
            || self.updates.contains_key(task_id)
    }

    pub fn add_update(&mut self, task_id: &TaskId, update_id: UpdateId) {
        self.updates
            .entry(task_id.clone())
            .or_default()
            .insert(update_id);
    }

    pub fn remove_update(&mut self, task_id: &TaskId, update_id: &UpdateId) {
        if let Some(set) = self.updates.get_mut(task_id) {
            set.remove(update_id);
            if set.is_empty() {
                self.updates.remove(task_id);
            }
        }
    }

    pub fn has_update(&self, task_id: &TaskId, update_id: &UpdateId) -> bool {
        self.updates
            .get(task_id)
            .is_some_and(|set| set.contains(update_id))
    }

    pub fn updates_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Persists the task description; a no-op unless checkpointing.
    pub fn checkpoint_task(&self, info: &TaskInfo) -> Result<(), CheckpointError> {
        if let Some(meta) = &self.meta_run_dir {
            checkpoint::write_json(&paths::task_info_path(meta, &info.task_id), info)?;
        }
        Ok(())
    }

    /// Persists the executor's message endpoint; a no-op unless checkpointing.
    pub fn checkpoint_endpoint(&self, endpoint: &Endpoint) -> Result<(), CheckpointError> {
        if let Some(meta) = &self.meta_run_dir {
            checkpoint::write_json(&paths::executor_endpoint_path(meta), endpoint)?;
        }
        Ok(())
    }

    /// Where the update manager should checkpoint a task's update log.
    pub fn updates_log_path(&self, task_id: &TaskId) -> Option<PathBuf> {
        self.meta_run_dir
            .as_ref()
            .map(|meta| paths::task_updates_path(meta, task_id))
    }

    /// Wire records for every launched task.
    pub fn launched_records(&self) -> Vec<Task> {
        self.launched
            .values()
            .map(|t| t.record(&self.framework_id, &self.id))
            .collect()
    }

    /// Wire records for queued tasks, presented as staging.
    pub fn queued_records(&self) -> Vec<Task> {
        self.queued
            .values()
            .map(|info| {
                Task::from_info(
                    info,
                    TaskState::Staging,
                    self.id.clone(),
                    self.framework_id.clone(),
                )
            })
            .collect()
    }

    /// Rebuilds one task from its checkpointed description and update log.
    ///
    /// Walks updates until the first terminal one; anything the master
    /// already acknowledged is left out of the in-flight set.
    pub fn recover_task(&mut self, rec: &RecoveredTask) {
        let Some(info) = &rec.info else {
            warn!(task_id = %rec.id, "skipping task recovery, no checkpointed description");
            return;
        };

        self.add_task(info.clone());

        for update in &rec.updates {
            self.update_task_state(&rec.id, update.state);
            if !rec.acks.contains(&update.update_id) {
                self.add_update(&rec.id, update.update_id);
            }
            if update.state.is_terminal() {
                self.remove_task(&rec.id);
                break;
            }
        }
    }
}

// =============================================================================
// Framework
// =============================================================================

pub struct Framework {
    pub id: FrameworkId,
    pub info: FrameworkInfo,
    /// Where status updates and executor messages for this tenant go.
    pub endpoint: Endpoint,
    pub state: FrameworkState,
    pub executors: BTreeMap<ExecutorId, Executor>,
    pub completed_executors: VecDeque<Executor>,
    /// Tasks buffered while the framework is initializing.
    pub pending: Vec<TaskInfo>,

    agent_id: AgentId,
    work_dir: PathBuf,
    meta_root: PathBuf,
}

impl Framework {
    /// Creates a live framework, checkpointing its description and endpoint
    /// when it opted in.
    pub fn create(
        agent_id: AgentId,
        id: FrameworkId,
        info: FrameworkInfo,
        endpoint: Endpoint,
        work_dir: &Path,
    ) -> Result<Self, CheckpointError> {
        let meta_root = paths::meta_root(work_dir);

        if info.checkpoint {
            checkpoint::write_json(
                &paths::framework_info_path(&meta_root, &agent_id, &id),
                &info,
            )?;
            checkpoint::write_json(
                &paths::framework_endpoint_path(&meta_root, &agent_id, &id),
                &endpoint,
            )?;
        }

        Ok(Self {
            id,
            info,
            endpoint,
            state: FrameworkState::Running,
            executors: BTreeMap::new(),
            completed_executors: VecDeque::new(),
            pending: Vec::new(),
            agent_id,
            work_dir: work_dir.to_path_buf(),
            meta_root,
        })
    }

    /// Rehydrates a framework from disk; nothing is re-checkpointed.
    pub fn recover(
        agent_id: AgentId,
        id: FrameworkId,
        info: FrameworkInfo,
        endpoint: Endpoint,
        work_dir: &Path,
    ) -> Self {
        Self {
            id,
            info,
            endpoint,
            state: FrameworkState::Running,
            executors: BTreeMap::new(),
            completed_executors: VecDeque::new(),
            pending: Vec::new(),
            agent_id,
            work_dir: work_dir.to_path_buf(),
            meta_root: paths::meta_root(work_dir),
        }
    }

    /// Re-points the framework endpoint, re-checkpointing when enabled.
    pub fn update_endpoint(&mut self, endpoint: Endpoint) -> Result<(), CheckpointError> {
        self.endpoint = endpoint;
        if self.info.checkpoint {
            checkpoint::write_json(
                &paths::framework_endpoint_path(&self.meta_root, &self.agent_id, &self.id),
                &self.endpoint,
            )?;
        }
        Ok(())
    }

    /// The executor description a task should run under.
    ///
    /// Command-only tasks get a synthesized executor whose ID equals the
    /// task's and whose command invokes the bundled task runner.
    pub fn executor_info_for(&self, task: &TaskInfo, launcher_dir: &Path) -> ExecutorInfo {
        if let Some(command) = &task.command {
            let runner = launcher_dir.join("skiff-task-runner");

            let shown = if command.value.chars().count() > 15 {
                let prefix: String = command.value.chars().take(12).collect();
                format!("{prefix}...")
            } else {
                command.value.clone()
            };

            let mut runner_command = CommandInfo::new(runner.to_string_lossy().into_owned());
            runner_command.arguments = vec![command.value.clone()];
            runner_command.environment = command.environment.clone();

            ExecutorInfo {
                executor_id: ExecutorId::from_task(&task.task_id),
                framework_id: Some(self.id.clone()),
                name: format!("Command runner (task {}: '{shown}')", task.task_id),
                source: task.task_id.to_string(),
                command: runner_command,
                resources: Resources::new(),
            }
        } else {
            let mut info = task
                .executor
                .clone()
                .expect("tasks carry an executor or a command");
            info.framework_id = Some(self.id.clone());
            info
        }
    }

    pub fn executor(&self, executor_id: &ExecutorId) -> Option<&Executor> {
        self.executors.get(executor_id)
    }

    pub fn executor_mut(&mut self, executor_id: &ExecutorId) -> Option<&mut Executor> {
        self.executors.get_mut(executor_id)
    }

    /// The executor that knows this task, in any live set.
    pub fn executor_for_task(&self, task_id: &TaskId) -> Option<&Executor> {
        self.executors.values().find(|e| e.has_task(task_id))
    }

    pub fn executor_for_task_mut(&mut self, task_id: &TaskId) -> Option<&mut Executor> {
        self.executors.values_mut().find(|e| e.has_task(task_id))
    }

    /// Every live task ID across pending, queued and launched sets.
    pub fn live_task_ids(&self) -> HashSet<TaskId> {
        let mut ids: HashSet<TaskId> =
            self.pending.iter().map(|t| t.task_id.clone()).collect();
        for executor in self.executors.values() {
            ids.extend(executor.queued.keys().cloned());
            ids.extend(executor.launched.keys().cloned());
        }
        ids
    }

    /// Creates a fresh executor run: new run ID, sandbox directory, and
    /// checkpointed description when the framework opted in. The latest-run
    /// pointer is written only after the run's files exist.
    pub fn create_executor(
        &mut self,
        info: ExecutorInfo,
        command_executor: bool,
    ) -> Result<&mut Executor, CheckpointError> {
        let run_id = RunId::new();
        let executor_id = info.executor_id.clone();

        let directory = paths::run_dir(
            &self.work_dir,
            &self.agent_id,
            &self.id,
            &executor_id,
            &run_id,
        );
        std::fs::create_dir_all(&directory).map_err(|source| CheckpointError::Io {
            path: directory.clone(),
            source,
        })?;

        let meta_run_dir = if self.info.checkpoint {
            checkpoint::write_json(
                &paths::executor_info_path(&self.meta_root, &self.agent_id, &self.id, &executor_id),
                &info,
            )?;

            let meta_run = paths::run_dir(
                &self.meta_root,
                &self.agent_id,
                &self.id,
                &executor_id,
                &run_id,
            );
            std::fs::create_dir_all(&meta_run).map_err(|source| CheckpointError::Io {
                path: meta_run.clone(),
                source,
            })?;

            checkpoint::write_pointer(
                &paths::latest_run_path(&self.meta_root, &self.agent_id, &self.id, &executor_id),
                &run_id.to_string(),
            )?;

            Some(meta_run)
        } else {
            None
        };

        let executor = Executor {
            id: executor_id.clone(),
            framework_id: self.id.clone(),
            info,
            run_id,
            directory,
            state: ExecutorState::Registering,
            endpoint: None,
            command_executor,
            queued: BTreeMap::new(),
            launched: BTreeMap::new(),
            completed_tasks: VecDeque::new(),
            updates: HashMap::new(),
            resources: Resources::new(),
            meta_run_dir,
        };

        info!(
            executor_id = %executor_id,
            framework_id = %self.id,
            run_id = %executor.run_id,
            directory = %executor.directory.display(),
            "Created executor"
        );

        Ok(self.executors.entry(executor_id).or_insert(executor))
    }

    /// Rebuilds an executor from its latest checkpointed run.
    ///
    /// Returns `None` when the description or latest-run pointer did not
    /// survive; such executors cannot be adopted.
    pub fn recover_executor(&mut self, rec: &RecoveredExecutor) -> Option<&mut Executor> {
        info!(executor_id = %rec.id, framework_id = %self.id, "Recovering executor");

        let Some(info) = rec.info.clone() else {
            warn!(
                executor_id = %rec.id,
                "skipping executor recovery, no checkpointed description"
            );
            return None;
        };

        let Some(run_id) = rec.latest else {
            warn!(
                executor_id = %rec.id,
                "skipping executor recovery, latest run unknown"
            );
            return None;
        };

        let directory =
            paths::run_dir(&self.work_dir, &self.agent_id, &self.id, &rec.id, &run_id);
        let meta_run_dir =
            paths::run_dir(&self.meta_root, &self.agent_id, &self.id, &rec.id, &run_id);

        // Synthesized command executors share their task's ID.
        let command_executor = info.source == info.executor_id.as_str();

        let mut executor = Executor {
            id: rec.id.clone(),
            framework_id: self.id.clone(),
            info,
            run_id,
            directory,
            state: ExecutorState::Registering,
            endpoint: None,
            command_executor,
            queued: BTreeMap::new(),
            launched: BTreeMap::new(),
            completed_tasks: VecDeque::new(),
            updates: HashMap::new(),
            resources: Resources::new(),
            meta_run_dir: Some(meta_run_dir),
        };

        if let Some(run) = rec.latest_run() {
            executor.endpoint = run.endpoint.clone();
            for task in run.tasks.values() {
                executor.recover_task(task);
            }
        }

        Some(self.executors.entry(rec.id.clone()).or_insert(executor))
    }

    /// Moves a terminated executor into the completed FIFO.
    pub fn destroy_executor(&mut self, executor_id: &ExecutorId) {
        if let Some(executor) = self.executors.remove(executor_id) {
            self.completed_executors.push_back(executor);
            while self.completed_executors.len() > MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK {
                self.completed_executors.pop_front();
            }
        }
    }

    /// Replays the recovery contract for a whole framework record.
    pub fn recover_executors(&mut self, executors: &BTreeMap<ExecutorId, RecoveredExecutor>) {
        for rec in executors.values() {
            self.recover_executor(rec);
        }
    }
}

/// Builds the synthetic update for a task the agent refuses or loses.
pub fn synthesized_update(
    framework_id: &FrameworkId,
    agent_id: Option<&AgentId>,
    task_id: &TaskId,
    state: TaskState,
    message: &str,
    executor_id: Option<&ExecutorId>,
) -> StatusUpdate {
    let mut update = StatusUpdate::new(
        framework_id.clone(),
        agent_id.cloned(),
        task_id.clone(),
        state,
        message,
    );
    if let Some(executor_id) = executor_id {
        update = update.with_executor(executor_id.clone());
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framework(dir: &Path, checkpoint: bool) -> Framework {
        Framework::create(
            "a1".parse().unwrap(),
            "f1".parse().unwrap(),
            FrameworkInfo {
                user: "root".to_string(),
                name: "fw".to_string(),
                checkpoint,
            },
            Endpoint::new("http://fw:1"),
            dir,
        )
        .unwrap()
    }

    fn command_task(id: &str, resources: &str) -> TaskInfo {
        TaskInfo {
            task_id: id.parse().unwrap(),
            name: id.to_string(),
            resources: Resources::parse(resources).unwrap(),
            executor: None,
            command: Some(CommandInfo::new("/bin/true")),
        }
    }

    #[test]
    fn test_command_executor_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let fw = framework(dir.path(), false);

        let task = command_task("t1", "cpus:1");
        let info = fw.executor_info_for(&task, Path::new("/usr/libexec/skiff"));

        assert_eq!(info.executor_id.as_str(), "t1");
        assert_eq!(info.source, "t1");
        assert!(info.command.value.ends_with("skiff-task-runner"));
        assert_eq!(info.command.arguments, vec!["/bin/true".to_string()]);
        assert_eq!(info.framework_id, Some("f1".parse().unwrap()));
    }

    #[test]
    fn test_resource_accounting_through_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut fw = framework(dir.path(), false);
        let task = command_task("t1", "cpus:1;mem:128");
        let info = fw.executor_info_for(&task, Path::new("/l"));
        let executor = fw.create_executor(info, true).unwrap();

        assert!(executor.resources.is_empty());

        executor.add_task(task.clone());
        assert_eq!(executor.resources.cpus(), Some(1.0));
        assert_eq!(executor.resources.mem(), Some(128.0));

        executor.update_task_state(&task.task_id, TaskState::Finished);
        executor.remove_task(&task.task_id);
        assert!(executor.resources.is_empty());
        assert_eq!(executor.completed_tasks.len(), 1);
        assert_eq!(executor.completed_tasks[0].state, TaskState::Finished);
    }

    #[test]
    fn test_add_task_duplicate_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut fw = framework(dir.path(), false);
        let task = command_task("t1", "cpus:1");
        let info = fw.executor_info_for(&task, Path::new("/l"));
        let executor = fw.create_executor(info, true).unwrap();

        executor.add_task(task.clone());
        executor.add_task(task.clone());
        assert_eq!(executor.resources.cpus(), Some(1.0));
        assert_eq!(executor.launched.len(), 1);
    }

    #[test]
    fn test_executor_for_task_searches_all_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mut fw = framework(dir.path(), false);
        let task = command_task("t1", "cpus:1");
        let info = fw.executor_info_for(&task, Path::new("/l"));
        let executor = fw.create_executor(info, true).unwrap();
        let eid = executor.id.clone();

        executor.queued.insert(task.task_id.clone(), task.clone());
        assert_eq!(fw.executor_for_task(&task.task_id).unwrap().id, eid);

        let executor = fw.executor_mut(&eid).unwrap();
        executor.queued.clear();
        executor.add_task(task.clone());
        assert!(fw.executor_for_task(&task.task_id).is_some());

        // After a terminal state, the task is only known via its pending ack.
        let executor = fw.executor_mut(&eid).unwrap();
        let update_id = UpdateId::new();
        executor.add_update(&task.task_id, update_id);
        executor.remove_task(&task.task_id);
        assert!(fw.executor_for_task(&task.task_id).is_some());

        let executor = fw.executor_mut(&eid).unwrap();
        executor.remove_update(&task.task_id, &update_id);
        assert!(fw.executor_for_task(&task.task_id).is_none());
    }

    #[test]
    fn test_checkpoint_and_recover_executor() {
        let dir = tempfile::tempdir().unwrap();
        let mut fw = framework(dir.path(), true);
        let task = command_task("t1", "cpus:1");
        let info = fw.executor_info_for(&task, Path::new("/l"));
        let executor = fw.create_executor(info, true).unwrap();
        let eid = executor.id.clone();
        executor.checkpoint_task(&task).unwrap();
        executor
            .checkpoint_endpoint(&Endpoint::new("http://exec:9"))
            .unwrap();
        let run_id = executor.run_id;

        let meta = paths::meta_root(dir.path());
        let aid: AgentId = "a1".parse().unwrap();
        let fid: FrameworkId = "f1".parse().unwrap();

        let rec = crate::state::recover(&meta, true).ok();
        // The latest-agent pointer is written by the agent, not the
        // framework, so read the executor tree directly.
        assert!(rec.is_some());
        let latest = checkpoint::read_pointer(&paths::latest_run_path(&meta, &aid, &fid, &eid))
            .unwrap()
            .parse::<RunId>()
            .unwrap();
        assert_eq!(latest, run_id);

        let stored: TaskInfo = checkpoint::read_json(&paths::task_info_path(
            &paths::run_dir(&meta, &aid, &fid, &eid, &run_id),
            &task.task_id,
        ))
        .unwrap();
        assert_eq!(stored, task);
    }

    #[test]
    fn test_recover_task_stops_at_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut fw = framework(dir.path(), true);
        let task = command_task("t1", "cpus:1");
        let info = fw.executor_info_for(&task, Path::new("/l"));
        let executor = fw.create_executor(info, true).unwrap();

        let running = StatusUpdate::new(
            "f1".parse().unwrap(),
            None,
            task.task_id.clone(),
            TaskState::Running,
            "",
        );
        let finished = StatusUpdate::new(
            "f1".parse().unwrap(),
            None,
            task.task_id.clone(),
            TaskState::Finished,
            "",
        );

        let rec = RecoveredTask {
            id: task.task_id.clone(),
            info: Some(task.clone()),
            updates: vec![running.clone(), finished.clone()],
            acks: [running.update_id].into_iter().collect(),
        };

        executor.recover_task(&rec);

        // Terminal update seen: the task is complete, resources released.
        assert!(executor.launched.is_empty());
        assert!(executor.resources.is_empty());
        // The running update was acked, the finished one is still in flight.
        assert!(!executor.has_update(&task.task_id, &running.update_id));
        assert!(executor.has_update(&task.task_id, &finished.update_id));
    }

    #[test]
    fn test_completed_fifo_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut fw = framework(dir.path(), false);
        let task = command_task("t0", "cpus:1");
        let info = fw.executor_info_for(&task, Path::new("/l"));
        let executor = fw.create_executor(info, true).unwrap();

        for i in 0..(MAX_COMPLETED_TASKS_PER_EXECUTOR + 10) {
            let task = command_task(&format!("task-{i}"), "cpus:1");
            executor.add_task(task.clone());
            executor.remove_task(&task.task_id);
        }
        assert_eq!(
            executor.completed_tasks.len(),
            MAX_COMPLETED_TASKS_PER_EXECUTOR
        );
    }
}
