//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! MQTT plumbing for the governor: the broker session, the telemetry
//! reporter, the budget sink and the operator command topics.

pub mod commands;
pub mod error;
pub mod reporter;
pub mod session;
pub mod sink;

pub use commands::{run_command_listener, Command, CommandTopics};
pub use error::MqttError;
pub use reporter::{discovery_messages, DiscoveryMessage, MqttReporter, ReporterTopics};
pub use session::{InboundMessage, MessagePublisher, MqttSession};
pub use sink::MqttBudgetSink;
