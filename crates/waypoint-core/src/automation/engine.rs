//! Engine and instance handles.
//!
//! [`Engine`] bundles the store, the class registry and the runtime config.
//! It is a cheap clone handle so it can be moved into spawned tasks
//! (detached actions, background runs, the ticker).
//!
//! [`Automation`] is one instance bound to its definition. The advancement
//! loop lives in `advance.rs`; message and interaction entry points live in
//! `dispatch.rs` and `interaction.rs`.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use waypoint_types::automation::{AutomationData, AutomationRecord};
use waypoint_types::config::EngineConfig;
use waypoint_types::step::StepRecord;

use crate::repository::AutomationStore;

use super::context::DataHandle;
use super::definition::{Uniqueness, WorkflowDefinition};
use super::error::EngineError;
use super::registry::Registry;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<S> {
    inner: Arc<EngineInner<S>>,
}

struct EngineInner<S> {
    store: S,
    registry: Registry,
    config: EngineConfig,
    /// One advisory mutex per (instance, Fork anchor step), held while a
    /// Join decides whether it is the last open branch.
    join_locks: DashMap<(Uuid, Uuid), Arc<Mutex<()>>>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: AutomationStore + 'static> Engine<S> {
    pub fn new(store: S, registry: Registry, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                config,
                join_locks: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a definition with this engine's registry.
    pub fn register(&self, definition: Arc<WorkflowDefinition>) {
        self.inner.registry.register(definition);
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    /// Create an instance of `class` without running it.
    ///
    /// When the class declares a [`Uniqueness`] policy and a matching
    /// unfinished instance exists, that instance is returned instead.
    pub async fn create(
        &self,
        class: &str,
        data: AutomationData,
    ) -> Result<Automation<S>, EngineError> {
        let definition = self.inner.registry.get(class)?;

        if let Some(existing) = self.find_duplicate(&definition, &data).await? {
            debug!(
                automation_id = %existing.id,
                class,
                "returning existing instance for unique workflow"
            );
            return Ok(self.bind(definition, existing));
        }

        let record = AutomationRecord::new(class, data);
        self.inner.store.create_automation(&record).await?;
        info!(automation_id = %record.id, class, "created automation");
        Ok(self.bind(definition, record))
    }

    /// Create an instance and, if the class autoruns, advance it.
    pub async fn start(
        &self,
        class: &str,
        data: AutomationData,
    ) -> Result<Automation<S>, EngineError> {
        let automation = self.create(class, data).await?;
        if automation.definition.autorun() {
            automation.run().await?;
        }
        Ok(automation)
    }

    /// Bind a persisted instance to its registered definition.
    pub async fn load(&self, id: &Uuid) -> Result<Automation<S>, EngineError> {
        let record = self
            .inner
            .store
            .get_automation(id)
            .await?
            .ok_or(EngineError::AutomationNotFound(*id))?;
        self.bind_record(record)
    }

    /// Look an instance up by unique key, falling back to its id.
    pub async fn find(&self, key: &str) -> Result<Option<Automation<S>>, EngineError> {
        self.find_record(key)
            .await?
            .map(|record| self.bind_record(record))
            .transpose()
    }

    pub(crate) async fn find_record(&self, key: &str) -> Result<Option<AutomationRecord>, EngineError> {
        if let Some(record) = self.inner.store.find_automation_by_key(key).await? {
            return Ok(Some(record));
        }
        match Uuid::parse_str(key) {
            Ok(id) => Ok(self.inner.store.get_automation(&id).await?),
            Err(_) => Ok(None),
        }
    }

    /// Delete an instance and all of its steps.
    pub async fn kill(&self, id: &Uuid) -> Result<bool, EngineError> {
        let existed = self.inner.store.delete_automation(id).await?;
        self.forget_join_locks_of(id);
        if existed {
            info!(automation_id = %id, "killed automation");
        }
        Ok(existed)
    }

    /// Remove finished instances last updated more than `days` days ago.
    /// Defaults to the configured history window.
    pub async fn delete_history(&self, days: Option<u32>) -> Result<(u64, u64), EngineError> {
        let days = days.unwrap_or(self.inner.config.history_days);
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let (automations, steps) = self.inner.store.delete_history(cutoff).await?;
        if automations > 0 {
            self.prune_join_locks().await?;
        }
        info!(days, automations, steps, "deleted automation history");
        Ok((automations, steps))
    }

    /// Steps of an instance in creation order.
    pub async fn steps(&self, id: &Uuid) -> Result<Vec<StepRecord>, EngineError> {
        Ok(self.inner.store.list_steps(id).await?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    pub(crate) fn bind_record(&self, record: AutomationRecord) -> Result<Automation<S>, EngineError> {
        let definition = self.inner.registry.get(&record.automation_class)?;
        Ok(self.bind(definition, record))
    }

    pub(crate) fn bind(&self, definition: Arc<WorkflowDefinition>, record: AutomationRecord) -> Automation<S> {
        Automation {
            engine: self.clone(),
            definition,
            id: record.id,
            unique_key: record.unique_key,
            data: DataHandle::new(record.data),
            halted: Arc::new(AtomicBool::new(record.finished)),
        }
    }

    async fn find_duplicate(
        &self,
        definition: &WorkflowDefinition,
        data: &AutomationData,
    ) -> Result<Option<AutomationRecord>, EngineError> {
        let fields = match definition.uniqueness() {
            Uniqueness::None => return Ok(None),
            Uniqueness::Singleton => &[] as &[String],
            Uniqueness::ByFields(fields) => fields.as_slice(),
        };
        let existing = self
            .inner
            .store
            .list_automations(Some(definition.class()), true)
            .await?;
        Ok(existing
            .into_iter()
            .find(|record| fields.iter().all(|f| record.data.get(f) == data.get(f))))
    }

    pub(crate) fn join_lock(&self, automation_id: Uuid, anchor: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inner
                .join_locks
                .entry((automation_id, anchor))
                .or_default()
                .value(),
        )
    }

    /// Drop the barrier mutex of a Fork whose Join has been passed.
    pub(crate) fn forget_join_lock(&self, automation_id: Uuid, anchor: Uuid) {
        self.inner.join_locks.remove(&(automation_id, anchor));
    }

    /// Drop every barrier mutex of a deleted instance.
    fn forget_join_locks_of(&self, automation_id: &Uuid) {
        self.inner
            .join_locks
            .retain(|(owner, _), _| owner != automation_id);
    }

    /// Drop barrier mutexes whose instance no longer exists in the store.
    async fn prune_join_locks(&self) -> Result<(), EngineError> {
        let mut owners: Vec<Uuid> = self.inner.join_locks.iter().map(|e| e.key().0).collect();
        owners.sort_unstable();
        owners.dedup();
        for owner in owners {
            if self.inner.store.get_automation(&owner).await?.is_none() {
                self.forget_join_locks_of(&owner);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn join_lock_count(&self) -> usize {
        self.inner.join_locks.len()
    }
}

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

/// One workflow instance bound to its definition.
pub struct Automation<S> {
    pub(crate) engine: Engine<S>,
    pub(crate) definition: Arc<WorkflowDefinition>,
    id: Uuid,
    unique_key: String,
    pub(crate) data: DataHandle,
    /// Set when the instance finishes during the current pass; checked by
    /// the advancement loop before each step.
    pub(crate) halted: Arc<AtomicBool>,
}

impl<S> Clone for Automation<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            definition: Arc::clone(&self.definition),
            id: self.id,
            unique_key: self.unique_key.clone(),
            data: self.data.clone(),
            halted: Arc::clone(&self.halted),
        }
    }
}

impl<S> std::fmt::Debug for Automation<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automation")
            .field("id", &self.id)
            .field("class", &self.definition.class())
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl<S: AutomationStore + 'static> Automation<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    pub fn class(&self) -> &str {
        self.definition.class()
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    /// Live handle on the instance data. Changes are persisted by the engine
    /// after each step, or explicitly with [`Automation::save`].
    pub fn data(&self) -> &DataHandle {
        &self.data
    }

    /// Persist the current data payload.
    pub async fn save(&self) -> Result<(), EngineError> {
        self.engine
            .store()
            .save_data(&self.id, &self.data.snapshot())
            .await?;
        Ok(())
    }

    /// Fresh copy of the persisted record.
    pub async fn record(&self) -> Result<AutomationRecord, EngineError> {
        self.engine
            .store()
            .get_automation(&self.id)
            .await?
            .ok_or(EngineError::AutomationNotFound(self.id))
    }

    pub async fn is_finished(&self) -> Result<bool, EngineError> {
        Ok(self.record().await?.finished)
    }

    pub async fn steps(&self) -> Result<Vec<StepRecord>, EngineError> {
        self.engine.steps(&self.id).await
    }

    /// Delete this instance and its steps.
    pub async fn kill(&self) -> Result<bool, EngineError> {
        self.engine.kill(&self.id).await
    }
}
