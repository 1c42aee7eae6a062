//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use evb_core::{Budget, Reporter, Temperature};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::MessagePublisher;

const QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterTopics {
    pub budget: String,
    pub ev_connected: String,
    pub evse_current: String,
    pub evse_temperature: String,
}

impl ReporterTopics {
    pub fn new(base_topic: &str) -> Self {
        let stat = |name: &str| format!("stat/{}/{}", base_topic, name);
        Self {
            budget: stat("budget"),
            ev_connected: stat("ev_connected"),
            evse_current: stat("evse_current"),
            evse_temperature: stat("evse_temperature"),
        }
    }
}

/// Retained Home Assistant discovery config for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

pub fn discovery_messages(base_topic: &str) -> Vec<DiscoveryMessage> {
    let device = json!({ "name": base_topic, "identifiers": [base_topic] });
    let sensor = |name: &str, unit: &str, class: &str| DiscoveryMessage {
        topic: format!("homeassistant/sensor/{}/{}/config", base_topic, name),
        payload: json!({
            "device": device,
            "name": name,
            "unique_id": format!("{}_{}", base_topic, name),
            "state_topic": format!("stat/{}/{}", base_topic, name),
            "unit_of_measurement": unit,
            "device_class": class,
            "state_class": "measurement",
        })
        .to_string(),
    };
    let connected = DiscoveryMessage {
        topic: format!("homeassistant/binary_sensor/{}/ev_connected/config", base_topic),
        payload: json!({
            "device": device,
            "name": "ev_connected",
            "unique_id": format!("{}_ev_connected", base_topic),
            "state_topic": format!("stat/{}/ev_connected", base_topic),
            "device_class": "connectivity",
            "payload_on": "true",
            "payload_off": "false",
        })
        .to_string(),
    };
    vec![
        sensor("budget", "W", "power"),
        connected,
        sensor("evse_current", "mA", "current"),
        sensor("evse_temperature", "°C", "temperature"),
    ]
}

#[derive(Debug)]
struct Notification {
    topic: String,
    payload: String,
}

/// Telemetry over MQTT. Reports never block the caller: a full queue drops
/// the report, and a value equal to the last one published is skipped.
pub struct MqttReporter {
    topics: ReporterTopics,
    queue: mpsc::Sender<Notification>,
}

impl MqttReporter {
    /// Start the publish task. It ends once the reporter is dropped.
    pub fn spawn(
        publisher: Arc<dyn MessagePublisher>,
        base_topic: &str,
        discovery: bool,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        let announcements = if discovery {
            discovery_messages(base_topic)
        } else {
            Vec::new()
        };
        let task = tokio::spawn(publish_loop(publisher, announcements, rx));
        let reporter = Self {
            topics: ReporterTopics::new(base_topic),
            queue,
        };
        (reporter, task)
    }

    pub fn topics(&self) -> &ReporterTopics {
        &self.topics
    }

    fn enqueue(&self, topic: &str, payload: String) {
        match self.queue.try_send(Notification {
            topic: topic.to_owned(),
            payload,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                debug!(topic = %dropped.topic, "telemetry queue full; report dropped");
            }
            Err(TrySendError::Closed(dropped)) => {
                debug!(topic = %dropped.topic, "telemetry publisher stopped");
            }
        }
    }
}

async fn publish_loop(
    publisher: Arc<dyn MessagePublisher>,
    mut announcements: Vec<DiscoveryMessage>,
    mut rx: mpsc::Receiver<Notification>,
) {
    announce(publisher.as_ref(), &mut announcements).await;

    let mut last_seen: HashMap<String, String> = HashMap::new();
    while let Some(item) = rx.recv().await {
        if !announcements.is_empty() {
            announce(publisher.as_ref(), &mut announcements).await;
        }
        if last_seen.get(&item.topic) == Some(&item.payload) {
            continue;
        }
        match publisher.publish(&item.topic, item.payload.clone(), false).await {
            Ok(()) => {
                last_seen.insert(item.topic, item.payload);
            }
            Err(err) => warn!(topic = %item.topic, error = %err, "telemetry publish failed"),
        }
    }
}

/// Publish pending discovery configs, keeping the ones that failed for the
/// next report.
async fn announce(publisher: &dyn MessagePublisher, pending: &mut Vec<DiscoveryMessage>) {
    let mut failed = Vec::new();
    for message in pending.drain(..) {
        if let Err(err) = publisher.publish(&message.topic, message.payload.clone(), true).await {
            debug!(topic = %message.topic, error = %err, "discovery publish deferred");
            failed.push(message);
        }
    }
    *pending = failed;
}

impl Reporter for MqttReporter {
    fn report_budget(&self, budget: &Budget) {
        self.enqueue(&self.topics.budget, budget.watts.to_string());
    }

    fn report_ev_connected(&self, connected: bool) {
        self.enqueue(&self.topics.ev_connected, connected.to_string());
    }

    fn report_evse_current(&self, milliamps: i64) {
        self.enqueue(&self.topics.evse_current, milliamps.to_string());
    }

    fn report_evse_temperature(&self, temperature: Temperature) {
        self.enqueue(
            &self.topics.evse_temperature,
            format!("{:.1}", temperature.as_celsius()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_topics_follow_base() {
        let topics = ReporterTopics::new("powerwall2mqtt");
        assert_eq!(topics.budget, "stat/powerwall2mqtt/budget");
        assert_eq!(topics.evse_temperature, "stat/powerwall2mqtt/evse_temperature");
    }

    #[test]
    fn discovery_covers_every_entity() {
        let messages = discovery_messages("garage");
        let topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/garage/budget/config",
                "homeassistant/binary_sensor/garage/ev_connected/config",
                "homeassistant/sensor/garage/evse_current/config",
                "homeassistant/sensor/garage/evse_temperature/config",
            ]
        );
        let budget: serde_json::Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(budget["state_topic"], "stat/garage/budget");
        assert_eq!(budget["unit_of_measurement"], "W");
    }
}
