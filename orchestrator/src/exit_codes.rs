//! Stable exit codes for the operator CLI.

use crate::error::OrchestratorError;

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, state or configuration, and any other error.
pub const INVALID: i32 = 1;
/// The named run or breakpoint does not exist.
pub const NOT_FOUND: i32 = 2;
/// A breakpoint was already resolved with a different resolution.
pub const CONFLICT: i32 = 3;

pub fn for_error(err: &OrchestratorError) -> i32 {
    match err {
        OrchestratorError::RunNotFound(_)
        | OrchestratorError::ProcessNotFound(_)
        | OrchestratorError::BreakpointNotFound { .. } => NOT_FOUND,
        OrchestratorError::Conflict { .. } => CONFLICT,
        _ => INVALID,
    }
}
