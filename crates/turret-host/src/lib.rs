//! Library surface of the turret host.
//!
//! The binary in `main.rs` wires these modules together; integration tests
//! drive them directly.

pub mod arbiter;
pub mod command;
pub mod config;
pub mod control_socket;
pub mod remote;
pub mod telemetry;
