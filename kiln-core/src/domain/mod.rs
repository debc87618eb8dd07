//! Core domain types
//!
//! These types represent the host's hardware, the work scheduled onto it and
//! the identity the control plane issued to it. They are shared between the
//! daemon (which decides what runs where) and the sandbox (which runs it).

pub mod command;
pub mod gpu;
pub mod registration;
pub mod task;
pub mod telemetry;

pub(crate) mod lenient;
