//! Orbit gateway - bridges one chat-network session to the Orbit orchestrator.
//!
//! The gateway runs as a child process. It speaks JSON Lines on stdin/stdout
//! (see [`orbit_gateway_protocol`]) and drives the network session through a
//! [`SessionAdapter`](adapter::SessionAdapter).
//!
//! A process opens its session exactly once. Any close ends with a
//! `restart_requested` event and a clean exit; the orchestrator respawns.

pub mod adapter;
pub mod address;
pub mod auth;
pub mod config;
pub mod contacts;
pub mod history;
pub mod ipc;
pub mod lifecycle;
pub mod media;
pub mod queue;
pub mod supervisor;

pub use config::GatewayConfig;
pub use supervisor::{ExitReason, Supervisor};
