//! Infrastructure layer for Conductor.
//!
//! Contains the SQLite implementations of the collaborator traits defined in
//! `conductor-core` (workflow repository, distributed lock manager,
//! distributed scheduler) and the `conductor.toml` configuration loader.

pub mod config;
pub mod sqlite;
