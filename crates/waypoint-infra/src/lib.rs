//! Infrastructure layer for Waypoint.
//!
//! Contains the SQLite implementation of the `AutomationStore` port defined in
//! `waypoint-core`, the `config.toml` loader, and data-directory resolution.

pub mod config;
pub mod sqlite;
