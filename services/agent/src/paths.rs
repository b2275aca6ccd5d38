//! On-disk layout of the work and meta directories.
//!
//! The same tree shape is used twice: once under the work directory for
//! executor sandboxes, once under `meta/` for checkpointed state.
//!
//! ```text
//! <root>/agents/<agent_id>/
//!   agent.info                                     (meta only)
//!   frameworks/<framework_id>/
//!     framework.info, framework.endpoint           (meta only)
//!     executors/<executor_id>/
//!       executor.info                              (meta only)
//!       runs/latest                                (pointer to run id)
//!       runs/<run_id>/
//!         pids/forked, pids/endpoint               (meta only)
//!         tasks/<task_id>/task.info, updates       (meta only)
//! ```

use std::path::{Path, PathBuf};

use skiff_id::{AgentId, ExecutorId, FrameworkId, RunId, TaskId};

pub const LATEST: &str = "latest";

pub fn meta_root(work_dir: &Path) -> PathBuf {
    work_dir.join("meta")
}

pub fn archive_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("archive")
}

pub fn agents_dir(root: &Path) -> PathBuf {
    root.join("agents")
}

pub fn agent_dir(root: &Path, agent_id: &AgentId) -> PathBuf {
    agents_dir(root).join(agent_id.as_str())
}

/// Pointer to the most recent agent directory, for recovery.
pub fn latest_agent_path(root: &Path) -> PathBuf {
    agents_dir(root).join(LATEST)
}

pub fn agent_info_path(root: &Path, agent_id: &AgentId) -> PathBuf {
    agent_dir(root, agent_id).join("agent.info")
}

pub fn frameworks_dir(root: &Path, agent_id: &AgentId) -> PathBuf {
    agent_dir(root, agent_id).join("frameworks")
}

pub fn framework_dir(root: &Path, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
    frameworks_dir(root, agent_id).join(framework_id.as_str())
}

pub fn framework_info_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(root, agent_id, framework_id).join("framework.info")
}

pub fn framework_endpoint_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(root, agent_id, framework_id).join("framework.endpoint")
}

pub fn executors_dir(root: &Path, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
    framework_dir(root, agent_id, framework_id).join("executors")
}

pub fn executor_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executors_dir(root, agent_id, framework_id).join(executor_id.as_str())
}

pub fn executor_info_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executor_dir(root, agent_id, framework_id, executor_id).join("executor.info")
}

pub fn runs_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executor_dir(root, agent_id, framework_id, executor_id).join("runs")
}

/// Pointer to the executor's most recent run.
pub fn latest_run_path(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    runs_dir(root, agent_id, framework_id, executor_id).join(LATEST)
}

pub fn run_dir(
    root: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    run_id: &RunId,
) -> PathBuf {
    runs_dir(root, agent_id, framework_id, executor_id).join(run_id.to_string())
}

pub fn forked_pid_path(run_dir: &Path) -> PathBuf {
    run_dir.join("pids").join("forked")
}

pub fn executor_endpoint_path(run_dir: &Path) -> PathBuf {
    run_dir.join("pids").join("endpoint")
}

pub fn tasks_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("tasks")
}

pub fn task_dir(run_dir: &Path, task_id: &TaskId) -> PathBuf {
    tasks_dir(run_dir).join(task_id.as_str())
}

pub fn task_info_path(run_dir: &Path, task_id: &TaskId) -> PathBuf {
    task_dir(run_dir, task_id).join("task.info")
}

pub fn task_updates_path(run_dir: &Path, task_id: &TaskId) -> PathBuf {
    task_dir(run_dir, task_id).join("updates")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (AgentId, FrameworkId, ExecutorId, TaskId, RunId) {
        (
            "a1".parse().unwrap(),
            "f1".parse().unwrap(),
            "e1".parse().unwrap(),
            "t1".parse().unwrap(),
            RunId::new(),
        )
    }

    #[test]
    fn test_layout_nesting() {
        let (aid, fid, eid, tid, run) = ids();
        let root = Path::new("/var/lib/skiff/meta");

        let run_dir = run_dir(root, &aid, &fid, &eid, &run);
        assert!(run_dir.starts_with("/var/lib/skiff/meta/agents/a1/frameworks/f1/executors/e1/runs"));

        let updates = task_updates_path(&run_dir, &tid);
        assert!(updates.ends_with("tasks/t1/updates"));

        let latest = latest_run_path(root, &aid, &fid, &eid);
        assert_eq!(latest, run_dir.parent().unwrap().join("latest"));
    }

    #[test]
    fn test_meta_root_under_work_dir() {
        assert_eq!(
            meta_root(Path::new("/w")),
            PathBuf::from("/w/meta")
        );
    }
}
