//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

use crate::rules::ChargeMode;

/// Failure reported by a [`crate::BudgetSink`] or [`crate::ChargeModeSetter`].
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("budget publish failed: {0}")]
    Publish(String),
    #[error("switching charge mode to {mode} failed: {reason}")]
    ChargeMode { mode: ChargeMode, reason: String },
    #[error("budget sink is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid charge policy: {0}")]
    InvalidPolicy(String),
    /// Fatal to the decision loop.
    #[error("budget dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}
