//! Event-triggered starts.
//!
//! A [`Trigger`] is a typed factory for one workflow class: firing it creates
//! an instance, hands the event payload to the class's `started_by` hook and
//! advances the new instance. [`TriggerHub`] owns a set of named triggers and
//! an `mpsc` channel; external event sources hold a cloned sender and fire
//! triggers by name.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use waypoint_types::automation::AutomationData;

use crate::repository::AutomationStore;

use super::advance::RunOutcome;
use super::engine::{Automation, Engine};
use super::error::{ConfigError, EngineError};

const CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("no trigger named '{0}'")]
    UnknownTrigger(String),

    #[error("trigger '{0}' registered twice")]
    DuplicateTrigger(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<ConfigError> for TriggerError {
    fn from(err: ConfigError) -> Self {
        Self::Engine(err.into())
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Starts instances of one workflow class.
pub struct Trigger<S> {
    engine: Engine<S>,
    class: String,
    start: Option<String>,
}

impl<S: AutomationStore + 'static> Trigger<S> {
    /// Fails when `class` is not registered.
    pub fn new(engine: Engine<S>, class: impl Into<String>) -> Result<Self, ConfigError> {
        let class = class.into();
        engine.registry().get(&class)?;
        Ok(Self {
            engine,
            class,
            start: None,
        })
    }

    /// Advance new instances from `node` instead of the first node.
    pub fn starting_at(mut self, node: impl Into<String>) -> Result<Self, ConfigError> {
        let node = node.into();
        self.engine.registry().get(&self.class)?.require_node(&node)?;
        self.start = Some(node);
        Ok(self)
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Create an instance for `payload` and advance it.
    ///
    /// Without a `started_by` hook the payload is merged into the new
    /// instance's data.
    pub async fn fire(&self, payload: AutomationData) -> Result<(Automation<S>, RunOutcome), EngineError> {
        let automation = self.engine.create(&self.class, AutomationData::new()).await?;

        match automation.definition().started_by() {
            Some(hook) => hook(automation.data(), &payload),
            None => automation.data().update(|data| data.extend(payload)),
        }
        automation.save().await?;

        tracing::info!(
            automation_id = %automation.id(),
            class = %self.class,
            start = self.start.as_deref().unwrap_or("<first>"),
            "trigger fired"
        );

        let outcome = match &self.start {
            Some(node) => automation.resume(None, node).await?,
            None => automation.run().await?,
        };
        Ok((automation, outcome))
    }
}

impl<S> std::fmt::Debug for Trigger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("class", &self.class)
            .field("start", &self.start)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TriggerHub
// ---------------------------------------------------------------------------

/// A request to fire the trigger registered under `trigger`.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub trigger: String,
    pub payload: AutomationData,
}

impl TriggerEvent {
    pub fn new(trigger: impl Into<String>, payload: AutomationData) -> Self {
        Self {
            trigger: trigger.into(),
            payload,
        }
    }
}

/// Named triggers plus the channel event sources fire them through.
pub struct TriggerHub<S> {
    triggers: HashMap<String, Trigger<S>>,
    sender: mpsc::Sender<TriggerEvent>,
    receiver: mpsc::Receiver<TriggerEvent>,
}

impl<S: AutomationStore + 'static> TriggerHub<S> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            triggers: HashMap::new(),
            sender,
            receiver,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, trigger: Trigger<S>) -> Result<(), TriggerError> {
        let name = name.into();
        if self.triggers.contains_key(&name) {
            return Err(TriggerError::DuplicateTrigger(name));
        }
        tracing::info!(trigger = %name, class = %trigger.class, "registered trigger");
        self.triggers.insert(name, trigger);
        Ok(())
    }

    /// A handle event sources use to fire triggers.
    pub fn sender(&self) -> mpsc::Sender<TriggerEvent> {
        self.sender.clone()
    }

    pub fn trigger_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.triggers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fire a trigger directly, bypassing the channel.
    pub async fn fire(
        &self,
        name: &str,
        payload: AutomationData,
    ) -> Result<(Automation<S>, RunOutcome), TriggerError> {
        let trigger = self
            .triggers
            .get(name)
            .ok_or_else(|| TriggerError::UnknownTrigger(name.to_string()))?;
        Ok(trigger.fire(payload).await?)
    }

    /// Consume events until `cancel` fires or every external sender is
    /// dropped. Returns the number of instances started.
    pub async fn listen(self, cancel: CancellationToken) -> usize {
        let Self {
            triggers,
            sender,
            mut receiver,
        } = self;
        drop(sender);

        let mut fired = 0usize;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(trigger) = triggers.get(&event.trigger) else {
                tracing::warn!(trigger = %event.trigger, "event for unknown trigger dropped");
                continue;
            };
            match trigger.fire(event.payload).await {
                Ok((automation, outcome)) => {
                    fired += 1;
                    tracing::debug!(
                        trigger = %event.trigger,
                        automation_id = %automation.id(),
                        ?outcome,
                        "trigger event handled"
                    );
                }
                Err(err) => {
                    tracing::error!(trigger = %event.trigger, error = %err, "trigger failed");
                }
            }
        }

        tracing::info!(fired, "trigger listener stopped");
        fired
    }
}

impl<S: AutomationStore + 'static> Default for TriggerHub<S> {
    fn default() -> Self {
        Self::new()
    }
}
