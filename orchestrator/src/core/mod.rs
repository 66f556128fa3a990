//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod fingerprint;
pub mod json_extract;
pub mod retry;
pub mod schema;
pub mod task;
pub mod transition;
pub mod types;
