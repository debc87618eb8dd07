//! Kiln Core
//!
//! Core types shared by the kiln host daemon, the per-GPU sandbox and the
//! control-plane client.
//!
//! This crate contains:
//! - Domain types: GPUs, workloads, tasks, registration, commands, telemetry
//! - DTOs: Messages exchanged with sandboxes and the control plane

pub mod domain;
pub mod dto;
