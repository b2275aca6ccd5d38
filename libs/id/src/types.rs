//! Typed ID definitions for the cluster manager.
//!
//! Two families:
//!
//! - Named IDs assigned by the master or by frameworks. These arrive over the
//!   wire and are validated, not generated.
//! - Generated IDs minted locally by the agent, ULID-based for sortability
//!   and uniqueness.

use crate::{define_name_id, define_ulid_id};

// =============================================================================
// Named IDs (caller-assigned)
// =============================================================================

define_name_id!(AgentId);
define_name_id!(FrameworkId);
define_name_id!(ExecutorId);
define_name_id!(TaskId);

impl ExecutorId {
    /// The executor synthesized for a command-only task shares the task's ID.
    #[must_use]
    pub fn from_task(task_id: &TaskId) -> Self {
        Self::parse(task_id.as_str()).expect("task IDs are valid executor IDs")
    }
}

// =============================================================================
// Generated IDs (agent-minted)
// =============================================================================

// One per launch of an executor. Distinguishes the current run from earlier
// runs of the same ExecutorId, so timers scheduled against an old run can be
// recognized as stale.
define_ulid_id!(RunId, "run");

// One per status update, used for acknowledgement matching.
define_ulid_id!(UpdateId, "upd");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_id_roundtrip() {
        let id = FrameworkId::parse("analytics-01").unwrap();
        assert_eq!(id.to_string(), "analytics-01");
        let parsed: FrameworkId = "analytics-01".parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_named_id_empty() {
        let result = TaskId::parse("");
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_named_id_rejects_path_separator() {
        let result = ExecutorId::parse("exec/../../etc");
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidCharacter('/')
        ));
    }

    #[test]
    fn test_named_id_rejects_whitespace() {
        let result = AgentId::parse("agent 1");
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidCharacter(' ')
        ));
    }

    #[test]
    fn test_named_id_too_long() {
        let long = "a".repeat(256);
        let result = TaskId::parse(&long);
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::TooLong { len: 256, max: 255 }
        ));
    }

    #[test]
    fn test_executor_id_from_task() {
        let task_id = TaskId::parse("t1").unwrap();
        let executor_id = ExecutorId::from_task(&task_id);
        assert_eq!(executor_id.as_str(), "t1");
    }

    #[test]
    fn test_run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        assert!(s.starts_with("run_"));
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_run_id_invalid_prefix() {
        let id = UpdateId::new();
        let result: Result<RunId, _> = id.to_string().parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_update_id_missing_separator() {
        let result = UpdateId::parse("upd01HV4Z2WQXKJNM8GPQY6VBKC3D");
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_update_id_invalid_ulid() {
        let result = UpdateId::parse("upd_invalid");
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_ulid_id_sortable() {
        let id1 = RunId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = RunId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_json_roundtrip() {
        let id = UpdateId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: UpdateId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);

        let fid = FrameworkId::parse("f1").unwrap();
        let json = serde_json::to_string(&fid).unwrap();
        assert_eq!(json, "\"f1\"");
        let parsed: FrameworkId = serde_json::from_str(&json).unwrap();
        assert_eq!(fid, parsed);
    }
}
