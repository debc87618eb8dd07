//! Data Transfer Objects
//!
//! Messages exchanged between the daemon and its sandboxes, and between
//! either of them and the control plane.

pub mod control;
pub mod sandbox;
