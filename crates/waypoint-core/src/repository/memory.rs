//! In-memory `AutomationStore`.
//!
//! All state sits behind a single `tokio::sync::Mutex`, so every trait method
//! is one atomic section. Used by the engine's tests and by embedders that do
//! not need durability.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;
use waypoint_types::automation::{AutomationData, AutomationRecord};
use waypoint_types::error::RepositoryError;
use waypoint_types::step::StepRecord;

use super::AutomationStore;

/// Volatile store backed by hash maps.
#[derive(Default)]
pub struct InMemoryAutomationStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    automations: HashMap<Uuid, AutomationRecord>,
    /// Insertion-ordered so listings come back in creation order.
    steps: Vec<StepRecord>,
}

impl InMemoryAutomationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn automation_mut(&mut self, id: &Uuid) -> Result<&mut AutomationRecord, RepositoryError> {
        self.automations.get_mut(id).ok_or(RepositoryError::NotFound)
    }

    fn step_mut(&mut self, step_id: &Uuid) -> Result<&mut StepRecord, RepositoryError> {
        self.steps
            .iter_mut()
            .find(|s| s.id == *step_id)
            .ok_or(RepositoryError::NotFound)
    }

    fn find_step_index(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> Option<usize> {
        self.steps.iter().position(|s| {
            s.automation_id == *automation_id
                && s.previous_id.as_ref() == previous_id
                && s.node_name == node_name
        })
    }

    fn get_or_create_step(
        &mut self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> Result<usize, RepositoryError> {
        if !self.automations.contains_key(automation_id) {
            return Err(RepositoryError::NotFound);
        }
        if let Some(idx) = self.find_step_index(automation_id, previous_id, node_name) {
            return Ok(idx);
        }
        self.steps.push(StepRecord::new(
            *automation_id,
            previous_id.copied(),
            node_name,
        ));
        Ok(self.steps.len() - 1)
    }
}

impl AutomationStore for InMemoryAutomationStore {
    async fn create_automation(&self, record: &AutomationRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        if state.automations.contains_key(&record.id) {
            return Err(RepositoryError::Conflict(format!(
                "automation {} already exists",
                record.id
            )));
        }
        state.automations.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_automation(&self, id: &Uuid) -> Result<Option<AutomationRecord>, RepositoryError> {
        Ok(self.state.lock().await.automations.get(id).cloned())
    }

    async fn find_automation_by_key(
        &self,
        key: &str,
    ) -> Result<Option<AutomationRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .automations
            .values()
            .find(|a| a.unique_key == key)
            .cloned())
    }

    async fn list_automations(
        &self,
        automation_class: Option<&str>,
        unfinished_only: bool,
    ) -> Result<Vec<AutomationRecord>, RepositoryError> {
        let state = self.state.lock().await;
        let mut list: Vec<AutomationRecord> = state
            .automations
            .values()
            .filter(|a| automation_class.is_none_or(|c| a.automation_class == c))
            .filter(|a| !unfinished_only || !a.finished)
            .cloned()
            .collect();
        list.sort_by_key(|a| (a.created_at, a.id));
        Ok(list)
    }

    async fn list_runnable(&self, now: DateTime<Utc>) -> Result<Vec<AutomationRecord>, RepositoryError> {
        let state = self.state.lock().await;
        let mut list: Vec<AutomationRecord> = state
            .automations
            .values()
            .filter(|a| a.is_runnable(now))
            .cloned()
            .collect();
        list.sort_by_key(|a| (a.created_at, a.id));
        Ok(list)
    }

    async fn save_data(&self, id: &Uuid, data: &AutomationData) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let record = state.automation_mut(id)?;
        record.data = data.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_finished(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let record = state.automation_mut(id)?;
        record.finished = true;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn lower_paused_until(
        &self,
        id: &Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let record = state.automation_mut(id)?;
        record.paused_until = Some(match record.paused_until {
            Some(existing) => existing.min(until),
            None => until,
        });
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn clear_elapsed_pause(&self, id: &Uuid, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let record = state.automation_mut(id)?;
        if record.paused_until.is_some_and(|t| t <= now) {
            record.paused_until = None;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_automation(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let existed = state.automations.remove(id).is_some();
        state.steps.retain(|s| s.automation_id != *id);
        Ok(existed)
    }

    async fn delete_history(&self, older_than: DateTime<Utc>) -> Result<(u64, u64), RepositoryError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .automations
            .values()
            .filter(|a| a.finished && a.updated_at < older_than)
            .map(|a| a.id)
            .collect();

        for id in &doomed {
            state.automations.remove(id);
        }
        let before = state.steps.len();
        state.steps.retain(|s| !doomed.contains(&s.automation_id));
        let steps_removed = before - state.steps.len();

        Ok((doomed.len() as u64, steps_removed as u64))
    }

    async fn enter_step(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let mut state = self.state.lock().await;
        let idx = state.get_or_create_step(automation_id, previous_id, node_name)?;
        let step = &mut state.steps[idx];
        if step.is_locked() {
            return Ok(None);
        }
        step.lock_count += 1;
        Ok(Some(step.clone()))
    }

    async fn create_step(
        &self,
        automation_id: &Uuid,
        previous_id: Option<&Uuid>,
        node_name: &str,
    ) -> Result<StepRecord, RepositoryError> {
        let mut state = self.state.lock().await;
        let idx = state.get_or_create_step(automation_id, previous_id, node_name)?;
        Ok(state.steps[idx].clone())
    }

    async fn release_step(&self, step_id: &Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let step = state.step_mut(step_id)?;
        step.lock_count = (step.lock_count - 1).max(0);
        Ok(())
    }

    async fn finish_step(&self, step_id: &Uuid) -> Result<StepRecord, RepositoryError> {
        let mut state = self.state.lock().await;
        let step = state.step_mut(step_id)?;
        if step.finished_at.is_none() {
            step.finished_at = Some(Utc::now());
        }
        step.lock_count = 0;
        Ok(step.clone())
    }

    async fn record_outcome(
        &self,
        step_id: &Uuid,
        message: &str,
        result: &Value,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let step = state.step_mut(step_id)?;
        step.message = message.to_string();
        step.result = result.clone();
        Ok(())
    }

    async fn mark_interaction(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state.step_mut(&step.id)?;
        stored.requires_interaction = step.requires_interaction;
        stored.interaction = step.interaction.clone();
        Ok(())
    }

    async fn get_step(&self, step_id: &Uuid) -> Result<Option<StepRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.steps.iter().find(|s| s.id == *step_id).cloned())
    }

    async fn list_steps(&self, automation_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .iter()
            .filter(|s| s.automation_id == *automation_id)
            .cloned()
            .collect())
    }

    async fn list_open_steps(&self, automation_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .iter()
            .filter(|s| s.automation_id == *automation_id && !s.is_finished())
            .cloned()
            .collect())
    }

    async fn list_open_interactions(&self) -> Result<Vec<StepRecord>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .iter()
            .filter(|s| s.requires_interaction && !s.is_finished())
            .filter(|s| {
                state
                    .automations
                    .get(&s.automation_id)
                    .is_some_and(|a| !a.finished)
            })
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    async fn store_with_automation() -> (InMemoryAutomationStore, AutomationRecord) {
        let store = InMemoryAutomationStore::new();
        let record = AutomationRecord::new("billing", AutomationData::new());
        store.create_automation(&record).await.unwrap();
        (store, record)
    }

    #[tokio::test]
    async fn test_enter_step_locks_once() {
        let (store, record) = store_with_automation().await;

        let first = store.enter_step(&record.id, None, "start").await.unwrap();
        assert!(first.is_some());
        let second = store.enter_step(&record.id, None, "start").await.unwrap();
        assert!(second.is_none(), "locked step must not be entered twice");

        let steps = store.list_steps(&record.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].lock_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_enter_yields_single_winner() {
        let (store, record) = store_with_automation().await;
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let id = record.id;
            handles.push(tokio::spawn(async move {
                store.enter_step(&id, None, "start").await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.list_steps(&record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_allows_reentry() {
        let (store, record) = store_with_automation().await;
        let step = store.enter_step(&record.id, None, "wait").await.unwrap().unwrap();
        store.release_step(&step.id).await.unwrap();

        let again = store.enter_step(&record.id, None, "wait").await.unwrap().unwrap();
        assert_eq!(again.id, step.id);
    }

    #[tokio::test]
    async fn test_finish_step_seals_once() {
        let (store, record) = store_with_automation().await;
        let step = store.enter_step(&record.id, None, "start").await.unwrap().unwrap();

        let sealed = store.finish_step(&step.id).await.unwrap();
        assert!(sealed.is_finished());
        assert_eq!(sealed.lock_count, 0);

        let resealed = store.finish_step(&step.id).await.unwrap();
        assert_eq!(resealed.finished_at, sealed.finished_at);
        assert!(store.list_open_steps(&record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lower_paused_until_keeps_earliest() {
        let (store, record) = store_with_automation().await;
        let now = Utc::now();

        store.lower_paused_until(&record.id, now + Duration::hours(2)).await.unwrap();
        store.lower_paused_until(&record.id, now + Duration::hours(1)).await.unwrap();
        store.lower_paused_until(&record.id, now + Duration::hours(3)).await.unwrap();

        let loaded = store.get_automation(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.paused_until, Some(now + Duration::hours(1)));

        assert!(store.list_runnable(now).await.unwrap().is_empty());
        store.clear_elapsed_pause(&record.id, now).await.unwrap();
        let loaded = store.get_automation(&record.id).await.unwrap().unwrap();
        assert!(loaded.paused_until.is_some(), "future pause must survive");

        let later = now + Duration::hours(1);
        assert_eq!(store.list_runnable(later).await.unwrap().len(), 1);
        store.clear_elapsed_pause(&record.id, later).await.unwrap();
        let loaded = store.get_automation(&record.id).await.unwrap().unwrap();
        assert!(loaded.paused_until.is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_steps() {
        let (store, record) = store_with_automation().await;
        let step = store.enter_step(&record.id, None, "start").await.unwrap().unwrap();
        store.create_step(&record.id, Some(&step.id), "next").await.unwrap();

        assert!(store.delete_automation(&record.id).await.unwrap());
        assert!(store.list_steps(&record.id).await.unwrap().is_empty());
        assert!(!store.delete_automation(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_history_only_removes_finished() {
        let store = InMemoryAutomationStore::new();
        let done = AutomationRecord::new("billing", AutomationData::new());
        let open = AutomationRecord::new("billing", AutomationData::new());
        store.create_automation(&done).await.unwrap();
        store.create_automation(&open).await.unwrap();
        store.enter_step(&done.id, None, "start").await.unwrap();
        store.set_finished(&done.id).await.unwrap();

        let cutoff = Utc::now() + Duration::seconds(1);
        let (automations, steps) = store.delete_history(cutoff).await.unwrap();
        assert_eq!((automations, steps), (1, 1));
        assert!(store.get_automation(&open.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_interactions_skip_finished_automations() {
        let (store, record) = store_with_automation().await;
        let mut step = store.enter_step(&record.id, None, "approve").await.unwrap().unwrap();
        step.requires_interaction = true;
        step.interaction.user = Some("alice".into());
        store.mark_interaction(&step).await.unwrap();

        assert_eq!(store.list_open_interactions().await.unwrap().len(), 1);
        store.set_finished(&record.id).await.unwrap();
        assert!(store.list_open_interactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_key_and_list_by_class() {
        let (store, record) = store_with_automation().await;
        let other = AutomationRecord::new("support", AutomationData::new());
        store.create_automation(&other).await.unwrap();

        let found = store.find_automation_by_key(&record.unique_key).await.unwrap().unwrap();
        assert_eq!(found.id, record.id);

        let billing = store.list_automations(Some("billing"), true).await.unwrap();
        assert_eq!(billing.len(), 1);
        assert_eq!(store.list_automations(None, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enter_unknown_automation_is_not_found() {
        let store = InMemoryAutomationStore::new();
        let err = store.enter_step(&Uuid::now_v7(), None, "start").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }
}
