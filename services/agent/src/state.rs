//! Recovery: reading the checkpointed meta tree back into memory.
//!
//! The reader mirrors the layout in [`crate::paths`]. In `safe` (strict)
//! mode any unreadable entity aborts recovery; otherwise the entity is
//! skipped with a warning, which loses whatever had not been durably
//! recorded but lets the agent come back up.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use skiff_id::{AgentId, ExecutorId, FrameworkId, RunId, TaskId, UpdateId};
use skiff_messages::{AgentInfo, Endpoint, ExecutorInfo, FrameworkInfo, StatusUpdate, TaskInfo};
use thiserror::Error;
use tracing::warn;

use crate::checkpoint::{self, CheckpointError, UpdateRecord};
use crate::paths;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("failed to list {path}: {source}")]
    List {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {kind} directory name '{name}': {source}")]
    InvalidName {
        kind: &'static str,
        name: String,
        #[source]
        source: skiff_id::IdError,
    },
}

/// Everything recovered for the agent.
#[derive(Debug, Default)]
pub struct RecoveredAgent {
    pub agent_id: Option<AgentId>,
    pub info: Option<AgentInfo>,
    pub frameworks: BTreeMap<FrameworkId, RecoveredFramework>,
}

#[derive(Debug)]
pub struct RecoveredFramework {
    pub id: FrameworkId,
    pub info: Option<FrameworkInfo>,
    pub endpoint: Option<Endpoint>,
    pub executors: BTreeMap<ExecutorId, RecoveredExecutor>,
}

#[derive(Debug)]
pub struct RecoveredExecutor {
    pub id: ExecutorId,
    pub info: Option<ExecutorInfo>,
    /// The run to adopt; earlier runs are only garbage.
    pub latest: Option<RunId>,
    pub runs: BTreeMap<RunId, RecoveredRun>,
}

impl RecoveredExecutor {
    /// The latest run's record, when both pointer and directory survived.
    #[must_use]
    pub fn latest_run(&self) -> Option<&RecoveredRun> {
        self.latest.as_ref().and_then(|id| self.runs.get(id))
    }
}

#[derive(Debug)]
pub struct RecoveredRun {
    pub id: RunId,
    pub forked_pid: Option<i32>,
    pub endpoint: Option<Endpoint>,
    pub tasks: BTreeMap<TaskId, RecoveredTask>,
}

#[derive(Debug)]
pub struct RecoveredTask {
    pub id: TaskId,
    pub info: Option<TaskInfo>,
    /// Updates in the order they were checkpointed.
    pub updates: Vec<StatusUpdate>,
    /// Update IDs the master has acknowledged.
    pub acks: HashSet<UpdateId>,
}

/// Reads the meta tree. `Ok(None)` means no agent has ever checkpointed here.
pub fn recover(meta_root: &Path, strict: bool) -> Result<Option<RecoveredAgent>, StateError> {
    let latest_path = paths::latest_agent_path(meta_root);
    if !latest_path.exists() {
        return Ok(None);
    }

    let agent_id: AgentId = checkpoint::read_pointer(&latest_path)?
        .parse()
        .map_err(|source| StateError::InvalidName {
            kind: "agent",
            name: "latest".to_string(),
            source,
        })?;

    let mut recovered = RecoveredAgent {
        agent_id: Some(agent_id.clone()),
        info: None,
        frameworks: BTreeMap::new(),
    };

    let info_path = paths::agent_info_path(meta_root, &agent_id);
    if info_path.exists() {
        match checkpoint::read_json(&info_path) {
            Ok(info) => recovered.info = Some(info),
            Err(e) if !strict => warn!(error = %e, "skipping unreadable agent info"),
            Err(e) => return Err(e.into()),
        }
    }

    let frameworks_dir = paths::frameworks_dir(meta_root, &agent_id);
    for name in list_dirs(&frameworks_dir)? {
        let framework_id: FrameworkId = match name.parse() {
            Ok(id) => id,
            Err(source) => {
                let err = StateError::InvalidName {
                    kind: "framework",
                    name,
                    source,
                };
                if strict {
                    return Err(err);
                }
                warn!(error = %err, "skipping framework directory");
                continue;
            }
        };

        match recover_framework(meta_root, &agent_id, framework_id.clone(), strict) {
            Ok(framework) => {
                recovered.frameworks.insert(framework_id, framework);
            }
            Err(e) if !strict => {
                warn!(framework_id = %framework_id, error = %e, "skipping framework");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Some(recovered))
}

fn recover_framework(
    meta_root: &Path,
    agent_id: &AgentId,
    framework_id: FrameworkId,
    strict: bool,
) -> Result<RecoveredFramework, StateError> {
    let mut framework = RecoveredFramework {
        id: framework_id.clone(),
        info: None,
        endpoint: None,
        executors: BTreeMap::new(),
    };

    let info_path = paths::framework_info_path(meta_root, agent_id, &framework_id);
    if info_path.exists() {
        framework.info = Some(checkpoint::read_json(&info_path)?);
    }

    let endpoint_path = paths::framework_endpoint_path(meta_root, agent_id, &framework_id);
    if endpoint_path.exists() {
        framework.endpoint = Some(checkpoint::read_json(&endpoint_path)?);
    }

    let executors_dir = paths::executors_dir(meta_root, agent_id, &framework_id);
    for name in list_dirs(&executors_dir)? {
        let executor_id: ExecutorId = match name.parse() {
            Ok(id) => id,
            Err(source) => {
                let err = StateError::InvalidName {
                    kind: "executor",
                    name,
                    source,
                };
                if strict {
                    return Err(err);
                }
                warn!(error = %err, "skipping executor directory");
                continue;
            }
        };

        match recover_executor(meta_root, agent_id, &framework_id, executor_id.clone(), strict) {
            Ok(executor) => {
                framework.executors.insert(executor_id, executor);
            }
            Err(e) if !strict => {
                warn!(executor_id = %executor_id, error = %e, "skipping executor");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(framework)
}

fn recover_executor(
    meta_root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: ExecutorId,
    strict: bool,
) -> Result<RecoveredExecutor, StateError> {
    let mut executor = RecoveredExecutor {
        id: executor_id.clone(),
        info: None,
        latest: None,
        runs: BTreeMap::new(),
    };

    let info_path = paths::executor_info_path(meta_root, agent_id, framework_id, &executor_id);
    if info_path.exists() {
        executor.info = Some(checkpoint::read_json(&info_path)?);
    }

    let latest_path = paths::latest_run_path(meta_root, agent_id, framework_id, &executor_id);
    if latest_path.exists() {
        let raw = checkpoint::read_pointer(&latest_path)?;
        match raw.parse() {
            Ok(run_id) => executor.latest = Some(run_id),
            Err(source) => {
                let err = StateError::InvalidName {
                    kind: "run",
                    name: raw,
                    source,
                };
                if strict {
                    return Err(err);
                }
                warn!(error = %err, "ignoring latest-run pointer");
            }
        }
    }

    let runs_dir = paths::runs_dir(meta_root, agent_id, framework_id, &executor_id);
    for name in list_dirs(&runs_dir)? {
        if name == paths::LATEST {
            continue;
        }
        let run_id: RunId = match name.parse() {
            Ok(id) => id,
            Err(source) => {
                let err = StateError::InvalidName {
                    kind: "run",
                    name,
                    source,
                };
                if strict {
                    return Err(err);
                }
                warn!(error = %err, "skipping run directory");
                continue;
            }
        };

        let run_dir = paths::run_dir(meta_root, agent_id, framework_id, &executor_id, &run_id);
        let run = recover_run(&run_dir, run_id, strict)?;
        executor.runs.insert(run_id, run);
    }

    Ok(executor)
}

fn recover_run(run_dir: &Path, id: RunId, strict: bool) -> Result<RecoveredRun, StateError> {
    let mut run = RecoveredRun {
        id,
        forked_pid: None,
        endpoint: None,
        tasks: BTreeMap::new(),
    };

    let forked_path = paths::forked_pid_path(run_dir);
    if forked_path.exists() {
        run.forked_pid = Some(checkpoint::read_json(&forked_path)?);
    }

    let endpoint_path = paths::executor_endpoint_path(run_dir);
    if endpoint_path.exists() {
        run.endpoint = Some(checkpoint::read_json(&endpoint_path)?);
    }

    for name in list_dirs(&paths::tasks_dir(run_dir))? {
        let task_id: TaskId = match name.parse() {
            Ok(id) => id,
            Err(source) => {
                let err = StateError::InvalidName {
                    kind: "task",
                    name,
                    source,
                };
                if strict {
                    return Err(err);
                }
                warn!(error = %err, "skipping task directory");
                continue;
            }
        };

        match recover_task(run_dir, task_id.clone()) {
            Ok(task) => {
                run.tasks.insert(task_id, task);
            }
            Err(e) if !strict => warn!(task_id = %task_id, error = %e, "skipping task"),
            Err(e) => return Err(e),
        }
    }

    Ok(run)
}

fn recover_task(run_dir: &Path, id: TaskId) -> Result<RecoveredTask, StateError> {
    let mut task = RecoveredTask {
        id: id.clone(),
        info: None,
        updates: Vec::new(),
        acks: HashSet::new(),
    };

    let info_path = paths::task_info_path(run_dir, &id);
    if info_path.exists() {
        task.info = Some(checkpoint::read_json(&info_path)?);
    }

    let updates_path = paths::task_updates_path(run_dir, &id);
    if updates_path.exists() {
        for record in checkpoint::read_records(&updates_path)? {
            match record {
                UpdateRecord::Update { update } => task.updates.push(update),
                UpdateRecord::Ack { update_id } => {
                    task.acks.insert(update_id);
                }
            }
        }
    }

    Ok(task)
}

fn list_dirs(path: &Path) -> Result<Vec<String>, StateError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(path).map_err(|source| StateError::List {
        path: path.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StateError::List {
            path: path.to_path_buf(),
            source,
        })?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
