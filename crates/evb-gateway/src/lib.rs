//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Upstream HTTP clients and the poll loops that feed their readings into the
//! [`evb_core::Controller`].

pub mod error;
pub mod openevse;
pub mod poller;
pub mod powerwall;

pub use error::GatewayError;
pub use openevse::{apply_evse_status, EvseConfig, EvseStatus, OpenEvseClient, OpenEvsePoller};
pub use poller::{run_poller, Poller};
pub use powerwall::{
    apply_site_readings, GridStatus, MeterAggregates, MeterReading, Operation, PowerwallClient,
    PowerwallPoller, SiteReadings, StateOfEnergy, SystemStatus,
};

use url::Url;

/// Accept a bare host (`192.168.1.20`) or a full base URL.
pub(crate) fn base_url(address: &str, default_scheme: &str) -> Result<Url, GatewayError> {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(GatewayError::Config("address must not be empty".into()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_owned()
    } else {
        format!("{}://{}", default_scheme, trimmed)
    };
    let mut url = Url::parse(&candidate)
        .map_err(|err| GatewayError::Config(format!("invalid address '{}': {}", address, err)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Resolve an API path against a base URL, keeping any base path prefix.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url, GatewayError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|err| GatewayError::Config(format!("invalid endpoint '{}': {}", path, err)))
}
