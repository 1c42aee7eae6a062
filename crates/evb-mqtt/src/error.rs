//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt configuration error: {0}")]
    Config(String),

    #[error("mqtt broker is not connected")]
    NotConnected,

    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("unrecognised command topic '{0}'")]
    UnknownTopic(String),

    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
}
