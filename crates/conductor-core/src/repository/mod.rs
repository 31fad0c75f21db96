//! Repository traits (ports) for workflow persistence, plus an in-process
//! implementation.
//!
//! conductor-infra provides the SQLite implementation.

pub mod memory;
pub mod workflow;
