//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io::Write;
use std::time::Duration;

use evb_common::config::{AppConfig, DerateConfig, DerateStep};
use evb_common::logging::LogFormat;
use evb_common::time::MinuteWindow;

#[test]
fn empty_document_uses_defaults() {
    let config: AppConfig = "".parse().unwrap();
    assert_eq!(config.charging.volts, 240);
    assert_eq!(config.charging.max_amps, 40);
    assert_eq!(config.charging.min_amps, 8);
    assert_eq!(config.charging.battery_export_threshold_w, 200.0);
    assert_eq!(config.charging.overnight_window.to_string(), "00:00-06:00");
    assert!(config.charging.peak_window.is_none());
    assert_eq!(config.polling.interval, Duration::from_secs(10));
    assert_eq!(config.metrics.listen.port(), 9900);
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert_eq!(config.mqtt.budget_topic, "powerwall/excess_power");
    match &config.charging.derate {
        DerateConfig::Table { steps } => {
            assert_eq!(steps.len(), 5);
            assert_eq!(
                steps[0],
                DerateStep {
                    above_celsius: 50.0,
                    max_amps: 8
                }
            );
        }
        other => panic!("unexpected default derate {:?}", other),
    }
}

#[test]
fn parses_full_document() {
    let toml = r#"
        [gateway]
        address = "192.168.1.20"
        timeout = 5

        [openevse]
        address = "openevse.local"
        manage_charge_mode = true

        [mqtt]
        broker = "tcp://10.0.0.2:1884"
        base_topic = "garage"

        [charging]
        max_amps = 32
        ev_urgent_below_percent = 50.0
        ev_urgent_release_percent = 60.0
        peak_window = "16:00-21:00"
        initial_strategy = "auto"

        [charging.derate]
        kind = "cutoff"
        above_celsius = 55.0

        [logging]
        format = "pretty"

        [polling]
        interval = 30
    "#;
    let config: AppConfig = toml.parse().unwrap();
    assert_eq!(config.gateway.address.as_deref(), Some("192.168.1.20"));
    assert_eq!(config.gateway.timeout, Duration::from_secs(5));
    assert!(config.openevse.manage_charge_mode);
    assert_eq!(
        config.mqtt.broker_endpoint().unwrap(),
        ("10.0.0.2".to_owned(), 1884)
    );
    assert_eq!(config.charging.max_amps, 32);
    assert_eq!(
        config.charging.peak_window,
        Some("16:00-21:00".parse::<MinuteWindow>().unwrap())
    );
    assert_eq!(
        config.charging.derate,
        DerateConfig::Cutoff {
            above_celsius: 55.0
        }
    );
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.polling.interval, Duration::from_secs(30));
}

#[test]
fn rejects_inverted_urgency_band() {
    let toml = r#"
        [charging]
        ev_urgent_below_percent = 70.0
        ev_urgent_release_percent = 60.0
    "#;
    let err = toml.parse::<AppConfig>().unwrap_err();
    assert!(err.to_string().contains("ev_urgent_release_percent"));
}

#[test]
fn rejects_min_amps_above_max() {
    let toml = r#"
        [charging]
        max_amps = 6
        min_amps = 8
    "#;
    assert!(toml.parse::<AppConfig>().is_err());
}

#[test]
fn rejects_bad_peak_window() {
    let toml = r#"
        [charging]
        peak_window = "late afternoon"
    "#;
    assert!(toml.parse::<AppConfig>().is_err());
}

#[test]
fn rejects_unsupported_broker_scheme() {
    let toml = r#"
        [mqtt]
        broker = "ws://127.0.0.1:9001"
    "#;
    assert!(toml.parse::<AppConfig>().is_err());
}

#[test]
fn load_uses_first_existing_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evbd.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[charging]\nmax_amps = 24").unwrap();

    let missing = dir.path().join("missing.toml");
    let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
    assert_eq!(loaded.source, path);
    assert_eq!(loaded.config.charging.max_amps, 24);
}

#[test]
fn load_reports_inspected_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = AppConfig::load(&[missing]).unwrap_err();
    assert!(err.to_string().contains("nope.toml"));
}

#[test]
fn shipped_reference_config_is_valid() {
    let config: AppConfig = include_str!("../../../configs/evbd.toml").parse().unwrap();
    assert_eq!(config.openevse.address.as_deref(), Some("192.168.1.30"));
    assert!(config.openevse.manage_charge_mode);
    assert_eq!(config.charging.ev_urgent_release_percent, 65.0);
    assert_eq!(config.charging.initial_strategy.as_deref(), Some("auto"));
}
