//! Durable, replayable task orchestration.
//!
//! A process is a deterministic Rust function that talks to the outside world
//! only through a [`context::RunContext`]: tasks, breakpoints, clock reads and
//! logging. Every effect is journaled under an id derived from its ordinal
//! position, so a run survives restarts by replaying its journal and only
//! executing what has not settled yet. The crate is split as follows:
//!
//! - **[`core`]**: Pure, deterministic logic (ids, records, schemas, retry, write-once rules).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem stores, child processes, config).
//!   Isolated behind traits so tests can use in-memory backends.
//!
//! Orchestration modules ([`registry`], [`breakpoint`], [`context`], [`runner`])
//! coordinate core logic with I/O to run processes.

pub mod breakpoint;
pub mod context;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod registry;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use breakpoint::{BreakpointController, ResolveOutcome};
pub use context::{Flow, Interrupt, RunContext};
pub use crate::core::task::{AgentPrompt, TaskDefinition, TaskKind, TaskPayload};
pub use crate::core::types::{BreakpointSpec, EffectId, RunId, RunStatus};
pub use error::{OrchestratorError, Result, ValidationError};
pub use registry::TaskRegistry;
pub use runner::{ProcessDefinition, ProcessRunner, RunOutcome, RunReport};
