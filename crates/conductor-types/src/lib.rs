//! Shared domain types for Conductor.
//!
//! This crate contains the data model used across the workflow engine:
//! workflow definitions, workflow instances, node instances, engine
//! registration records, the error taxonomy, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod event;
pub mod instance;
pub mod node;
