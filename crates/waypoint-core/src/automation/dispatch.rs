//! Message dispatch between automation instances.
//!
//! Delivery is an in-process call: the target is loaded from the store, its
//! receiver for the message runs against the target's own data, and the data
//! is saved afterwards. A refused delivery (no receiver, unmet parameter
//! requirements, receiver error) yields `None`, never an error.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;
use waypoint_types::automation::AutomationData;

use crate::repository::AutomationStore;

use super::context::MessageContext;
use super::engine::{Automation, Engine};
use super::error::EngineError;
use super::message::RECEIVED;

impl<S: AutomationStore + 'static> Engine<S> {
    /// Deliver to one unfinished instance, addressed by unique key or id.
    pub async fn dispatch(
        &self,
        key: &str,
        message: &str,
        token: &str,
        payload: &AutomationData,
    ) -> Result<Option<Value>, EngineError> {
        let Some(record) = self.find_record(key).await?.filter(|r| !r.finished) else {
            debug!(key, message, "no unfinished automation for key");
            return Ok(None);
        };
        let target = self.bind_record(record)?;
        target.receive(message, token, payload).await
    }

    /// Deliver to every unfinished instance of `class` in creation order,
    /// stopping after the first receiver that answers [`RECEIVED`].
    pub async fn broadcast(
        &self,
        class: &str,
        message: &str,
        token: &str,
        payload: &AutomationData,
    ) -> Result<Vec<Value>, EngineError> {
        self.broadcast_excluding(None, class, message, token, payload)
            .await
    }

    pub(crate) async fn broadcast_excluding(
        &self,
        exclude: Option<Uuid>,
        class: &str,
        message: &str,
        token: &str,
        payload: &AutomationData,
    ) -> Result<Vec<Value>, EngineError> {
        let definition = self.registry().get(class)?;
        let records = self.store().list_automations(Some(class), true).await?;

        let mut replies = Vec::new();
        for record in records {
            if Some(record.id) == exclude {
                continue;
            }
            let target = self.bind(definition.clone(), record);
            if let Some(reply) = target.receive(message, token, payload).await? {
                let stop = reply.as_str() == Some(RECEIVED);
                replies.push(reply);
                if stop {
                    debug!(class, message, automation_id = %target.id(), "broadcast received");
                    break;
                }
            }
        }
        Ok(replies)
    }

    /// Whether `payload` meets the requirements of `class`'s receiver for `message`.
    pub fn satisfies_data_requirements(
        &self,
        class: &str,
        message: &str,
        payload: Option<&AutomationData>,
    ) -> Result<bool, EngineError> {
        Ok(self
            .registry()
            .get(class)?
            .satisfies_data_requirements(message, payload))
    }

    /// Start a new instance of `class` for a message it can accept, deliver
    /// the message to it, and run it when the class autoruns.
    ///
    /// Returns `None` without creating anything when the payload does not
    /// meet the receiver's requirements.
    pub async fn create_on_message(
        &self,
        class: &str,
        message: &str,
        token: &str,
        payload: &AutomationData,
    ) -> Result<Option<(Automation<S>, Option<Value>)>, EngineError> {
        let definition = self.registry().get(class)?;
        if !definition.satisfies_data_requirements(message, Some(payload)) {
            debug!(class, message, "payload does not satisfy receiver, not creating");
            return Ok(None);
        }

        let automation = self.create(class, AutomationData::new()).await?;
        let reply = automation.receive(message, token, payload).await?;
        if definition.autorun() && !automation.is_finished().await? {
            automation.run().await?;
        }
        Ok(Some((automation, reply)))
    }
}

impl<S: AutomationStore + 'static> Automation<S> {
    /// Invoke this instance's receiver for `message`.
    pub async fn receive(
        &self,
        message: &str,
        token: &str,
        payload: &AutomationData,
    ) -> Result<Option<Value>, EngineError> {
        let Some(receiver) = self.definition.receiver(message) else {
            debug!(automation_id = %self.id(), message, "no receiver for message");
            return Ok(None);
        };
        if !receiver.accepts(Some(payload)) {
            debug!(automation_id = %self.id(), message, "payload refused by receiver");
            return Ok(None);
        }

        let ctx = MessageContext {
            automation_id: self.id(),
            message: message.to_string(),
            token: token.to_string(),
            payload: payload.clone(),
            data: self.data.clone(),
        };
        match receiver.call(ctx).await {
            Ok(reply) => {
                self.save().await?;
                debug!(automation_id = %self.id(), message, "message received");
                Ok(Some(reply))
            }
            Err(err) => {
                warn!(automation_id = %self.id(), message, error = %err, "receiver failed");
                Ok(None)
            }
        }
    }
}
