//! skiff Agent Library
//!
//! The agent runs on each worker node and owns the local lifecycle of
//! frameworks, executors and tasks: it accepts work from the central
//! master, launches executors through the isolator, relays messages in
//! both directions, reliably reports task state changes, and checkpoints
//! enough to survive its own restart.
//!
//! ## Architecture
//!
//! One actor, one mailbox:
//!
//! ```text
//! Agent (event loop, owns the entity graph)
//! ├── StatusUpdateManager   (durable ordered per-task update streams)
//! ├── Isolator              (capability: launch / kill / re-limit executors)
//! ├── Outbox                (delivery seam to master, executors, frameworks)
//! ├── GarbageCollector      (deferred directory removal)
//! └── HTTP                  (/vars, /stats.json, /state.json, /inbox/*)
//! ```
//!
//! ## Modules
//!
//! - `agent`: the event-dispatch actor and its handlers
//! - `framework`: the framework/executor/task entity model
//! - `update_manager`: the reliable status-update pipeline
//! - `checkpoint`, `paths`, `state`: durable state and crash recovery
//! - `isolator`, `outbox`: collaborator seams with mock/channel test doubles

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod files;
pub mod framework;
pub mod gc;
pub mod http;
pub mod isolator;
pub mod monitor;
pub mod outbox;
pub mod paths;
pub mod resources;
pub mod state;
pub mod update_manager;

// Re-export commonly used types
pub use agent::{Agent, AgentEvent, AgentHandle, StateSnapshot, StatsSnapshot};
pub use config::{Config, RecoveryMode};
pub use isolator::{Isolator, IsolatorCall, MockIsolator};
pub use outbox::{ChannelOutbox, HttpOutbox, Outbox};
