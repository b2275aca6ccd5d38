//! End-to-end task lifecycle scenarios against a mock isolator.

mod harness;

use harness::*;
use skiff_messages::{
    AgentOutbound, CommandInfo, ExecutorInfo, ExecutorToAgent, MasterToAgent, Resources,
    StatusUpdate, TaskState,
};

const EXEC: &str = "http://executor-t1:7070";

#[tokio::test]
async fn test_command_task_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = spawn_agent(test_config(dir.path(), false));
    agent.register("s1").await;

    // The framework asks for a command task; the agent synthesizes an
    // executor whose ID equals the task's and asks the isolator for it.
    agent
        .master_says(run_task_message(
            false,
            command_task("t1", "/bin/true", "cpus:1;mem:32"),
        ))
        .await;

    let isolator = agent.isolator.clone();
    eventually("executor t1 is launched", || {
        isolator
            .launched()
            .iter()
            .any(|(f, e, _)| f.as_str() == "f1" && e.as_str() == "t1")
    })
    .await;

    // Executor comes up and registers; the queued task flushes to it.
    agent
        .executor_says(
            EXEC,
            ExecutorToAgent::RegisterExecutor {
                framework_id: "f1".parse().unwrap(),
                executor_id: "t1".parse().unwrap(),
            },
        )
        .await;

    agent
        .outbox
        .wait_for("executor registered handshake", |to, m| {
            to.as_str() == EXEC && matches!(m, AgentOutbound::ExecutorRegistered { .. })
        })
        .await;
    let (_, run) = agent
        .outbox
        .wait_for("task delivery", |to, m| {
            to.as_str() == EXEC && matches!(m, AgentOutbound::RunTask { .. })
        })
        .await;
    match run {
        AgentOutbound::RunTask { task, .. } => assert_eq!(task.task_id.as_str(), "t1"),
        _ => unreachable!(),
    }

    let stats = agent.handle.stats().await.unwrap();
    assert_eq!(stats.tasks.get("staging"), Some(&1));

    // The task finishes; the update flows to the master.
    let finished = StatusUpdate::new(
        "f1".parse().unwrap(),
        Some("s1".parse().unwrap()),
        "t1".parse().unwrap(),
        TaskState::Finished,
        "exit 0",
    )
    .with_executor("t1".parse().unwrap());
    agent
        .executor_says(
            EXEC,
            ExecutorToAgent::StatusUpdate {
                update: finished.clone(),
            },
        )
        .await;

    let (_, forwarded) = agent
        .outbox
        .wait_for("status update forwarded to master", |to, m| {
            to.as_str() == MASTER && as_status_update(m).is_some()
        })
        .await;
    let forwarded = as_status_update(&forwarded).unwrap();
    assert_eq!(forwarded.update_id, finished.update_id);
    assert_eq!(forwarded.state, TaskState::Finished);

    // Master acknowledges; the executor hears about it.
    agent
        .master_says(MasterToAgent::StatusUpdateAcknowledgement {
            agent_id: "s1".parse().unwrap(),
            framework_id: "f1".parse().unwrap(),
            task_id: "t1".parse().unwrap(),
            update_id: finished.update_id,
        })
        .await;

    agent
        .outbox
        .wait_for("acknowledgement to executor", |to, m| {
            to.as_str() == EXEC
                && matches!(
                    m,
                    AgentOutbound::StatusUpdateAcknowledgement { update_id, .. }
                        if *update_id == finished.update_id
                )
        })
        .await;

    let stats = agent.handle.stats().await.unwrap();
    assert_eq!(stats.tasks.get("finished"), Some(&1));
    assert_eq!(stats.valid_status_updates, 1);
}

#[tokio::test]
async fn test_kill_before_register() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = spawn_agent(test_config(dir.path(), false));
    agent.register("s1").await;

    agent
        .master_says(run_task_message(
            false,
            command_task("t1", "/bin/true", "cpus:1"),
        ))
        .await;
    agent
        .master_says(MasterToAgent::KillTask {
            framework_id: "f1".parse().unwrap(),
            task_id: "t1".parse().unwrap(),
        })
        .await;

    // The task never started: a synthetic KILLED goes to the master.
    let (_, killed) = agent
        .outbox
        .wait_for("synthetic kill update", |to, m| {
            to.as_str() == MASTER && as_status_update(m).is_some()
        })
        .await;
    let killed = as_status_update(&killed).unwrap();
    assert_eq!(killed.state, TaskState::Killed);
    assert_eq!(killed.message, "Unregistered executor");

    // When the executor finally appears it is turned away, and the queued
    // task is never delivered.
    agent
        .executor_says(
            EXEC,
            ExecutorToAgent::RegisterExecutor {
                framework_id: "f1".parse().unwrap(),
                executor_id: "t1".parse().unwrap(),
            },
        )
        .await;

    agent
        .outbox
        .wait_for("executor turned away", |to, m| {
            to.as_str() == EXEC && matches!(m, AgentOutbound::ShutdownExecutor)
        })
        .await;

    agent.outbox.drain();
    assert!(
        !agent
            .outbox
            .saw(|to, m| to.as_str() == EXEC && matches!(m, AgentOutbound::RunTask { .. })),
        "a killed task must never reach the executor"
    );
}

#[tokio::test]
async fn test_executor_registration_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), false);
    config.executor_registration_timeout = std::time::Duration::from_millis(300);
    let mut agent = spawn_agent(config);
    agent.register("s1").await;

    agent
        .master_says(run_task_message(
            false,
            command_task("t1", "/bin/sleep 600", "cpus:1"),
        ))
        .await;

    // No RegisterExecutor ever arrives; the timeout asks the isolator to
    // kill the run.
    let isolator = agent.isolator.clone();
    eventually("registration timeout kills the executor", || {
        isolator
            .killed()
            .iter()
            .any(|(f, e)| f.as_str() == "f1" && e.as_str() == "t1")
    })
    .await;

    // The isolator reports the destruction; the queued task fails.
    agent
        .handle
        .deliver(skiff_agent::agent::AgentEvent::ExecutorTerminated {
            framework_id: "f1".parse().unwrap(),
            executor_id: "t1".parse().unwrap(),
            status: -9,
            destroyed: true,
            message: "killed by isolator".to_string(),
        })
        .await;

    let (_, failed) = agent
        .outbox
        .wait_for("synthetic failure update", |to, m| {
            to.as_str() == MASTER && as_status_update(m).is_some()
        })
        .await;
    let failed = as_status_update(&failed).unwrap();
    assert_eq!(failed.task_id.as_str(), "t1");
    assert_eq!(failed.state, TaskState::Failed);
}

#[tokio::test]
async fn test_stale_run_timeout_is_ignored() {
    // The registration timer captures the run it was armed for; once the
    // executor registers, the firing timer must leave the run alone.
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), false);
    config.executor_registration_timeout = std::time::Duration::from_millis(300);
    let mut agent = spawn_agent(config);
    agent.register("s1").await;

    agent
        .master_says(run_task_message(
            false,
            command_task("t1", "/bin/true", "cpus:1"),
        ))
        .await;

    // Register within the window: the timer must then do nothing.
    agent
        .executor_says(
            EXEC,
            ExecutorToAgent::RegisterExecutor {
                framework_id: "f1".parse().unwrap(),
                executor_id: "t1".parse().unwrap(),
            },
        )
        .await;
    agent
        .outbox
        .wait_for("executor registered handshake", |to, m| {
            to.as_str() == EXEC && matches!(m, AgentOutbound::ExecutorRegistered { .. })
        })
        .await;

    // Wait past the registration timeout.
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    assert!(
        agent.isolator.killed().is_empty(),
        "a registered executor must not be killed by its registration timer"
    );
}

#[tokio::test]
async fn test_framework_message_relay() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = spawn_agent(test_config(dir.path(), false));
    agent.register("s1").await;

    // Messages for unknown frameworks are dropped and counted.
    agent
        .master_says(MasterToAgent::FrameworkToExecutor {
            agent_id: "s1".parse().unwrap(),
            framework_id: "f1".parse().unwrap(),
            executor_id: "t1".parse().unwrap(),
            data: "hello".to_string(),
        })
        .await;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let stats = agent.handle.stats().await.unwrap();
        if stats.invalid_framework_messages == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "invalid framework message was never counted"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // Once the executor is up, messages relay in both directions.
    agent
        .master_says(run_task_message(
            false,
            command_task("t1", "/bin/true", "cpus:1"),
        ))
        .await;
    agent
        .executor_says(
            EXEC,
            ExecutorToAgent::RegisterExecutor {
                framework_id: "f1".parse().unwrap(),
                executor_id: "t1".parse().unwrap(),
            },
        )
        .await;
    agent
        .outbox
        .wait_for("executor registered handshake", |to, m| {
            to.as_str() == EXEC && matches!(m, AgentOutbound::ExecutorRegistered { .. })
        })
        .await;

    agent
        .master_says(MasterToAgent::FrameworkToExecutor {
            agent_id: "s1".parse().unwrap(),
            framework_id: "f1".parse().unwrap(),
            executor_id: "t1".parse().unwrap(),
            data: "to-executor".to_string(),
        })
        .await;
    agent
        .outbox
        .wait_for("message relayed to executor", |to, m| {
            to.as_str() == EXEC
                && matches!(m, AgentOutbound::FrameworkToExecutor { data, .. } if data == "to-executor")
        })
        .await;

    agent
        .executor_says(
            EXEC,
            ExecutorToAgent::ExecutorToFramework {
                agent_id: "s1".parse().unwrap(),
                framework_id: "f1".parse().unwrap(),
                executor_id: "t1".parse().unwrap(),
                data: "to-framework".to_string(),
            },
        )
        .await;
    agent
        .outbox
        .wait_for("message relayed to framework", |to, m| {
            to.as_str() == "http://framework-f1:8080"
                && matches!(m, AgentOutbound::ExecutorToFramework { data, .. } if data == "to-framework")
        })
        .await;
}

#[tokio::test]
async fn test_checkpointing_framework_rejected_when_disabled() {
    // Agent has checkpointing off; a checkpointing framework's task is
    // refused with a synthetic TASK_LOST.
    let dir = tempfile::tempdir().unwrap();
    let mut agent = spawn_agent(test_config(dir.path(), false));
    agent.register("s1").await;

    agent
        .master_says(run_task_message(
            true,
            command_task("t1", "/bin/true", "cpus:1"),
        ))
        .await;

    let (_, lost) = agent
        .outbox
        .wait_for("synthetic lost update", |to, m| {
            to.as_str() == MASTER && as_status_update(m).is_some()
        })
        .await;
    let lost = as_status_update(&lost).unwrap();
    assert_eq!(lost.state, TaskState::Lost);
    assert!(lost.message.contains("checkpointing is disabled"));

    // No framework, no executor, no isolator launch.
    assert!(agent.isolator.launched().is_empty());
    let state = agent.handle.state().await.unwrap();
    assert!(state.frameworks.is_empty());
}

#[tokio::test]
async fn test_malformed_task_rejected() {
    // A task must carry exactly one of command and executor; anything else
    // is refused with a synthetic TASK_LOST and creates nothing.
    let dir = tempfile::tempdir().unwrap();
    let mut agent = spawn_agent(test_config(dir.path(), false));
    agent.register("s1").await;

    // Both set.
    let mut task = command_task("t1", "/bin/true", "cpus:1");
    task.executor = Some(ExecutorInfo {
        executor_id: "e1".parse().unwrap(),
        framework_id: None,
        name: "svc".to_string(),
        source: String::new(),
        command: CommandInfo::new("./executor"),
        resources: Resources::new(),
    });
    agent.master_says(run_task_message(false, task)).await;

    let (_, lost) = agent
        .outbox
        .wait_for("lost update for over-specified task", |to, m| {
            to.as_str() == MASTER
                && as_status_update(m).is_some_and(|u| u.task_id.as_str() == "t1")
        })
        .await;
    let lost = as_status_update(&lost).unwrap();
    assert_eq!(lost.state, TaskState::Lost);
    assert!(lost.message.contains("exactly one of command and executor"));

    // Neither set.
    let mut task = command_task("t2", "/bin/true", "cpus:1");
    task.command = None;
    agent.master_says(run_task_message(false, task)).await;

    let (_, lost) = agent
        .outbox
        .wait_for("lost update for empty task", |to, m| {
            to.as_str() == MASTER
                && as_status_update(m).is_some_and(|u| u.task_id.as_str() == "t2")
        })
        .await;
    assert_eq!(as_status_update(&lost).unwrap().state, TaskState::Lost);

    // No framework, no executor, no isolator launch for either task.
    assert!(agent.isolator.launched().is_empty());
    let state = agent.handle.state().await.unwrap();
    assert!(state.frameworks.is_empty());
}

#[tokio::test]
async fn test_duplicate_run_task_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut agent = spawn_agent(test_config(dir.path(), false));
    agent.register("s1").await;

    let message = run_task_message(false, command_task("t1", "/bin/true", "cpus:1"));
    agent.master_says(message.clone()).await;
    agent.master_says(message).await;

    let isolator = agent.isolator.clone();
    eventually("executor t1 is launched", || !isolator.launched().is_empty()).await;
    // Give the duplicate a chance to (incorrectly) launch a second run.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(agent.isolator.launched().len(), 1);

    let stats = agent.handle.stats().await.unwrap();
    assert_eq!(stats.tasks.get("staging"), Some(&1));
}
