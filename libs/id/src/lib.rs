//! # skiff-id
//!
//! Typed identifiers for the skiff cluster manager.
//!
//! ## Design Principles
//!
//! - IDs are typed to prevent mixing different resource kinds
//! - Named IDs (framework, executor, task, agent) are caller-assigned and
//!   validated; they double as on-disk path components
//! - Generated IDs (executor run, status update) are ULID-based and minted
//!   by the agent itself
//! - All IDs support roundtrip serialization (parse → format → parse)
//!
//! ## Formats
//!
//! Named IDs are plain restricted strings, e.g. `analytics-01`.
//! Generated IDs use a prefixed format, e.g. `run_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
