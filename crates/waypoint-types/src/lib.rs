//! Shared domain types for Waypoint.
//!
//! This crate contains the persisted records the engine operates on
//! (automation instances and their step records), the actor model used by
//! interaction gates, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, sha2, thiserror.

pub mod actor;
pub mod automation;
pub mod config;
pub mod error;
pub mod step;
