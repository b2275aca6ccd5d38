//! # skiff-messages
//!
//! The protocol vocabulary shared by the master, agents and executors:
//! entity descriptions (frameworks, executors, tasks), resource vectors,
//! task states, status updates and the direction-scoped message sets.
//!
//! Everything here is plain serde data. Transport is someone else's job;
//! these types only promise a stable JSON shape.

mod info;
mod protocol;
mod resources;
mod update;

pub use info::{AgentInfo, Attributes, CommandInfo, ExecutorInfo, FrameworkInfo, Task, TaskInfo};
pub use protocol::{AgentOutbound, Endpoint, ExecutorToAgent, MasterToAgent};
pub use resources::{ResourceError, Resources};
pub use update::{StatusUpdate, TaskState};
