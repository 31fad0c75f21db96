//! Workflow engine and collaborator traits for Conductor.
//!
//! This crate defines the ports (repository, lock manager, scheduler) that
//! the infrastructure layer implements, plus in-process implementations of
//! each. It depends only on `conductor-types` -- never on
//! `conductor-infra` or any database crate.

pub mod concurrency;
pub mod event;
pub mod lock;
pub mod repository;
pub mod scheduler;
pub mod workflow;
