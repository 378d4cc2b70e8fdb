//! # hub-session
//!
//! Small, dependency-light primitives shared between the collaboration hub's
//! components: opaque identifiers for agents/sessions/tasks/locks, and a
//! generic broadcast bus used both by the message hub (fan-out to connected
//! sessions) and by the filesystem notifier (fan-out of batched events).
//!
//! Everything here is transport- and policy-agnostic: no websocket code, no
//! identity storage, no task semantics. Those live in the `agent-hub` crate
//! that depends on this one, keeping the low-level primitives reusable on
//! their own.

#![allow(clippy::new_without_default)]

pub mod bus;
pub mod ids;
pub mod observability;

pub use bus::BroadcastBus;
pub use ids::{generate_secret, AgentId, LockToken, SessionId, TaskId};

/// Library version, exposed the way a shared internal crate typically is.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
