//! Automation engine and store trait definitions for Waypoint.
//!
//! This crate defines the `AutomationStore` port that the infrastructure
//! layer implements, plus the engine that advances automation instances
//! through their node graphs. It depends only on `waypoint-types` -- never on
//! `waypoint-infra` or any database crate.

pub mod automation;
pub mod repository;
