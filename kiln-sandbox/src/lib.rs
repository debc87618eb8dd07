//! Kiln Sandbox
//!
//! Runs inside each GPU sandbox. Owns the task queue of its slot, serves the
//! queue listener the daemon talks to, supervises the miner of mining
//! sandboxes and provides the render executor (`run` sub-command).

pub mod api;
pub mod config;
pub mod db;
pub mod render;
pub mod repository;
pub mod service;
