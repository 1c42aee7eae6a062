//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Decision engine for the EV charge budget governor.
//!
//! Pollers push readings into a [`Controller`] through its setters. Every real
//! change wakes the decision loop, which evaluates the rule ladder over a
//! consistent copy of the readings, clamps the result to the hardware limit and
//! hands it to the injected [`BudgetSink`].

pub mod controller;
pub mod error;
pub mod policy;
pub mod ports;
pub mod rules;
pub mod sensors;

pub use controller::Controller;
pub use error::{ControllerError, DispatchError};
pub use policy::{ChargePolicy, Derate, UrgencyBand};
pub use ports::{
    BudgetSink, ChargeModeSetter, Clock, CycleOutcome, FanoutReporter, FixedClock, NoopReporter,
    Reporter, SystemClock,
};
pub use rules::{compute_budget, Budget, ChargeMode, Decision, DecisionInput, Rule, Verdict};
pub use sensors::{OperationMode, SensorSnapshot, Strategy, Temperature};
