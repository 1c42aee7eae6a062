//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the EV budget governor workspace.
//! This crate exposes configuration loading, logging setup, and the
//! time-of-day window type consumed by the decision engine.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ChargingConfig, DerateConfig, DerateStep, GatewayConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, MqttConfig, OpenEvseConfig, PollingConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{minute_of_day, MinuteWindow, WindowParseError};
