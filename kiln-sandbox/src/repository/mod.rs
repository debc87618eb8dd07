//! Repository Module
//!
//! Data access layer for the durable task record.

pub mod task;

pub use task as task_repository;
