//! Automation store trait definition.
//!
//! Defines the storage interface for automation instances and their step
//! records. The infrastructure layer (waypoint-infra) implements this trait
//! with SQLite persistence; [`memory::InMemoryAutomationStore`] is the
//! reference implementation used by tests and embedders.

pub mod memory;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;
use waypoint_types::automation::{AutomationData, AutomationRecord};
use waypoint_types::error::RepositoryError;
use waypoint_types::step::StepRecord;

/// Repository trait for automation persistence.
///
/// Covers two entity families:
/// - **Instances:** create/query automation records, persist their data,
///   and maintain the `paused_until` wake-up hint.
/// - **Steps:** the per-occurrence records whose lock and seal transitions
///   drive the advancement algorithm.
///
/// Every method is a single atomic section against the backing store.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait AutomationStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new automation record.
    fn create_automation(
        &self,
        record: &AutomationRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an automation by its UUID.
    fn get_automation(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<AutomationRecord>, RepositoryError>> + Send;

    /// Get an automation by its derived unique key.
    fn find_automation_by_key(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<AutomationRecord>, RepositoryError>> + Send;

    /// List automations, optionally restricted to one class and/or to
    /// unfinished instances, ordered by creation time.
    fn list_automations(
        &self,
        automation_class: Option<&str>,
        unfinished_only: bool,
    ) -> impl std::future::Future<Output = Result<Vec<AutomationRecord>, RepositoryError>> + Send;

    /// Unfinished automations whose `paused_until` is unset or not after `now`.
    fn list_runnable(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<AutomationRecord>, RepositoryError>> + Send;

    /// Replace an automation's data payload.
    fn save_data(
        &self,
        id: &Uuid,
        data: &AutomationData,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark an automation finished. Idempotent.
    fn set_finished(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Set `paused_until` to `until` unless an earlier wake-up is already recorded.
    fn lower_paused_until(
        &self,
        id: &Uuid,
        until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Clear `paused_until` if it is not after `now`.
    fn clear_elapsed_pause(
        &self,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete an automation and all of its steps. Returns `true` if it existed.
    fn delete_automation(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete finished automations last updated before `older_than`.
    /// Returns `(automations, steps)` removed.
    fn delete_history(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(u64, u64), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Get or create the step keyed by `(automation_id, previous_id, node_name)`
    /// and take its lock.
    ///
    /// Returns `None` when the step is already held by another advancer.
    fn enter_step(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// Get or create the step keyed by `(automation_id, previous_id, node_name)`
    /// without locking it.
    fn create_step(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> impl std::future::Future<Output = Result<StepRecord, RepositoryError>> + Send;

    /// Drop one level of lock on a step, leaving it unfinished.
    fn release_step(
        &self,
        step_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Seal a step: set `finished_at` (once) and release its lock.
    fn finish_step(
        &self,
        step_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<StepRecord, RepositoryError>> + Send;

    /// Persist a step's outcome (`message`, `result`).
    fn record_outcome(
        &self,
        step_id: &Uuid,
        message: &str,
        result: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist a step's interaction stamp (`requires_interaction` and requirement).
    fn mark_interaction(
        &self,
        step: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a step by its UUID.
    fn get_step(
        &self,
        step_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// All steps of an automation, ordered by creation.
    fn list_steps(
        &self,
        automation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    /// Unfinished steps of an automation (its frontier), ordered by creation.
    fn list_open_steps(
        &self,
        automation_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    /// Unfinished interaction steps of unfinished automations, across all classes.
    fn list_open_interactions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;
}
