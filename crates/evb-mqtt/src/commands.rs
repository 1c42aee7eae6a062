//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::str::FromStr;
use std::sync::Arc;

use evb_common::time::MinuteWindow;
use evb_core::{Controller, Strategy};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::MqttError;
use crate::session::InboundMessage;

/// Operator command received on `cmnd/<base>/<name>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Strategy(Strategy),
    EvBatteryLevel(f64),
    PeakWindow(Option<MinuteWindow>),
}

impl Command {
    pub fn apply(self, controller: &Controller) {
        match self {
            Command::Strategy(strategy) => controller.set_controller_strategy(strategy),
            Command::EvBatteryLevel(percent) => controller.set_ev_battery_level_percent(percent),
            Command::PeakWindow(window) => controller.set_peak_window(window),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopics {
    strategy: String,
    ev_battery_level: String,
    peak_window: String,
}

impl CommandTopics {
    pub fn new(base_topic: &str) -> Self {
        let cmnd = |name: &str| format!("cmnd/{}/{}", base_topic, name);
        Self {
            strategy: cmnd("strategy"),
            ev_battery_level: cmnd("ev_battery_level"),
            peak_window: cmnd("peak_window"),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.strategy.clone(),
            self.ev_battery_level.clone(),
            self.peak_window.clone(),
        ]
    }

    pub fn parse(&self, topic: &str, payload: &str) -> Result<Command, MqttError> {
        let payload = payload.trim();
        let invalid = |reason: String| MqttError::InvalidPayload {
            topic: topic.to_owned(),
            reason,
        };
        if topic == self.strategy {
            Ok(Command::Strategy(Strategy::parse(payload)))
        } else if topic == self.ev_battery_level {
            let percent: f64 = payload
                .parse()
                .map_err(|_| invalid(format!("'{}' is not a number", payload)))?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(invalid(format!("{} is outside 0-100", percent)));
            }
            Ok(Command::EvBatteryLevel(percent))
        } else if topic == self.peak_window {
            if payload.is_empty() || payload.eq_ignore_ascii_case("off") {
                return Ok(Command::PeakWindow(None));
            }
            let window = MinuteWindow::from_str(payload).map_err(|err| invalid(err.to_string()))?;
            Ok(Command::PeakWindow(Some(window)))
        } else {
            Err(MqttError::UnknownTopic(topic.to_owned()))
        }
    }
}

/// Apply inbound commands to the controller until shutdown or the session ends.
pub async fn run_command_listener(
    mut inbound: mpsc::Receiver<InboundMessage>,
    topics: CommandTopics,
    controller: Arc<Controller>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            message = inbound.recv() => {
                let Some(message) = message else {
                    debug!("mqtt inbound channel closed");
                    break;
                };
                match topics.parse(&message.topic, &message.payload) {
                    Ok(command) => {
                        if command == Command::Strategy(Strategy::Unknown) {
                            warn!(payload = %message.payload, "unrecognised strategy; treated as auto");
                        }
                        info!(topic = %message.topic, payload = %message.payload, "command received");
                        command.apply(&controller);
                    }
                    Err(err) => warn!(error = %err, "command rejected"),
                }
            }
        }
    }
}
