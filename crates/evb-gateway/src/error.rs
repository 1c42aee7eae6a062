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
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned status {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to decode {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("client configuration error: {0}")]
    Config(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
