//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use evb_core::{Budget, BudgetSink, ChargeMode, ChargeModeSetter, DispatchError};
use parking_lot::Mutex;
use tracing::debug;

use crate::session::MessagePublisher;

/// Publishes each budget to the charger's budget topic.
pub struct MqttBudgetSink {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    charge_mode: Option<Arc<dyn ChargeModeSetter>>,
    last_mode: Mutex<Option<ChargeMode>>,
}

impl MqttBudgetSink {
    pub fn new(publisher: Arc<dyn MessagePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            charge_mode: None,
            last_mode: Mutex::new(None),
        }
    }

    /// Switch the charger mode before publishing whenever it changes.
    pub fn with_charge_mode(mut self, setter: Arc<dyn ChargeModeSetter>) -> Self {
        self.charge_mode = Some(setter);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl BudgetSink for MqttBudgetSink {
    async fn apply(&self, budget: &Budget) -> Result<(), DispatchError> {
        if let Some(setter) = &self.charge_mode {
            let last = *self.last_mode.lock();
            if last != Some(budget.mode) {
                setter.set_charge_mode(budget.mode).await?;
                *self.last_mode.lock() = Some(budget.mode);
            }
        }
        self.publisher
            .publish(&self.topic, budget.watts.to_string(), false)
            .await
            .map_err(|err| DispatchError::Publish(err.to_string()))?;
        debug!(topic = %self.topic, watts = budget.watts, "budget published");
        Ok(())
    }
}
