//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use evb_common::time::MinuteWindow;
use parking_lot::Mutex;
use tokio::sync::{Mutex as CycleGuard, Notify};
use tracing::{debug, error, info, trace};

use crate::error::ControllerError;
use crate::policy::ChargePolicy;
use crate::ports::{BudgetSink, Clock, CycleOutcome, NoopReporter, Reporter, SystemClock};
use crate::rules::{compute_budget, Budget, DecisionInput, Verdict};
use crate::sensors::{OperationMode, SensorSnapshot, Strategy, Temperature};

struct ControllerState {
    sensors: SensorSnapshot,
    policy: ChargePolicy,
    ev_urgent: bool,
}

impl ControllerState {
    fn next_ev_urgency(&self) -> bool {
        self.sensors
            .ev_battery_percent
            .map(|level| self.policy.ev_urgency().next(self.ev_urgent, level))
            .unwrap_or(false)
    }
}

/// Owns the sensor snapshot and drives the wake-recompute-dispatch cycle.
///
/// Setters may be called from any task. Each one takes the state lock briefly,
/// stores the reading and wakes the decision loop only when the value changed.
/// Wakes coalesce, so a burst of changes during a cycle yields one follow-up
/// cycle that sees all of them.
pub struct Controller {
    state: Mutex<ControllerState>,
    wake: Notify,
    cycle: CycleGuard<()>,
    sink: Arc<dyn BudgetSink>,
    reporter: Arc<dyn Reporter>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("sensors", &self.state.lock().sensors)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(policy: ChargePolicy, sink: Arc<dyn BudgetSink>) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                sensors: SensorSnapshot::default(),
                policy,
                ev_urgent: false,
            }),
            wake: Notify::new(),
            cycle: CycleGuard::new(()),
            sink,
            reporter: Arc::new(NoopReporter),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Store `value` and wake the loop if it differs from the current reading.
    /// The first reading of a field always counts as a change.
    fn update<T>(
        &self,
        field: &'static str,
        value: T,
        slot: impl FnOnce(&mut SensorSnapshot) -> &mut Option<T>,
    ) -> bool
    where
        T: PartialEq + fmt::Debug,
    {
        let changed = {
            let mut state = self.state.lock();
            let current = slot(&mut state.sensors);
            let changed = current.as_ref() != Some(&value);
            if changed {
                trace!(field, previous = ?current, value = ?value, "sensor reading changed");
                *current = Some(value);
            }
            changed
        };
        if changed {
            self.wake.notify_one();
        }
        changed
    }

    fn read<T>(&self, f: impl FnOnce(&SensorSnapshot) -> T) -> T {
        f(&self.state.lock().sensors)
    }

    pub fn set_exported_solar_w(&self, watts: f64) {
        self.update("exported_solar_w", watts, |s| &mut s.exported_solar_w);
    }

    pub fn set_exported_battery_w(&self, watts: f64) {
        self.update("exported_battery_w", watts, |s| &mut s.exported_battery_w);
    }

    pub fn set_solar_w(&self, watts: f64) {
        self.update("solar_w", watts, |s| &mut s.solar_w);
    }

    pub fn set_load_w(&self, watts: f64) {
        self.update("load_w", watts, |s| &mut s.load_w);
    }

    pub fn set_powerwall_battery_level_percent(&self, percent: f64) {
        self.update("powerwall_battery_percent", percent, |s| {
            &mut s.powerwall_battery_percent
        });
    }

    pub fn set_ev_battery_level_percent(&self, percent: f64) {
        self.update("ev_battery_percent", percent, |s| &mut s.ev_battery_percent);
    }

    pub fn set_operation_mode(&self, mode: OperationMode) {
        self.update("operation_mode", mode, |s| &mut s.operation_mode);
    }

    pub fn set_load_reduction(&self, active: bool) {
        self.update("load_reduction", active, |s| &mut s.load_reduction);
    }

    pub fn set_controller_strategy(&self, strategy: Strategy) {
        if self.update("strategy", strategy, |s| &mut s.strategy) {
            info!(strategy = %strategy, "controller strategy changed");
        }
    }

    pub fn set_evse_temperature(&self, temperature: Temperature) {
        self.update("evse_temperature", temperature, |s| &mut s.evse_temperature);
        self.reporter.report_evse_temperature(temperature);
    }

    pub fn set_evse_current_ma(&self, milliamps: i64) {
        self.update("evse_current_ma", milliamps, |s| &mut s.evse_current_ma);
        self.reporter.report_evse_current(milliamps);
    }

    pub fn set_ev_connected(&self, connected: bool) {
        self.update("ev_connected", connected, |s| &mut s.ev_connected);
        self.reporter.report_ev_connected(connected);
    }

    /// Replace the utility peak window. `None` disables peak avoidance.
    pub fn set_peak_window(&self, window: Option<MinuteWindow>) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.policy.peak_window() != window;
            state.policy.set_peak_window(window);
            changed
        };
        if changed {
            info!(peak_window = ?window.map(|w| w.to_string()), "peak window updated");
            self.wake.notify_one();
        }
    }

    pub fn exported_solar_w(&self) -> Option<f64> {
        self.read(|s| s.exported_solar_w)
    }

    pub fn exported_battery_w(&self) -> Option<f64> {
        self.read(|s| s.exported_battery_w)
    }

    pub fn solar_w(&self) -> Option<f64> {
        self.read(|s| s.solar_w)
    }

    pub fn load_w(&self) -> Option<f64> {
        self.read(|s| s.load_w)
    }

    pub fn powerwall_battery_percent(&self) -> Option<f64> {
        self.read(|s| s.powerwall_battery_percent)
    }

    pub fn ev_battery_percent(&self) -> Option<f64> {
        self.read(|s| s.ev_battery_percent)
    }

    pub fn operation_mode(&self) -> Option<OperationMode> {
        self.read(|s| s.operation_mode)
    }

    pub fn evse_temperature(&self) -> Option<Temperature> {
        self.read(|s| s.evse_temperature)
    }

    pub fn evse_current_ma(&self) -> Option<i64> {
        self.read(|s| s.evse_current_ma)
    }

    pub fn ev_connected(&self) -> Option<bool> {
        self.read(|s| s.ev_connected)
    }

    pub fn load_reduction(&self) -> Option<bool> {
        self.read(|s| s.load_reduction)
    }

    pub fn strategy(&self) -> Option<Strategy> {
        self.read(|s| s.strategy)
    }

    /// Consistent copy of every reading.
    pub fn snapshot(&self) -> SensorSnapshot {
        self.read(|s| s.clone())
    }

    pub fn policy(&self) -> ChargePolicy {
        self.state.lock().policy.clone()
    }

    /// Evaluate the rules against the current readings without dispatching.
    pub fn evaluate(&self) -> Verdict {
        let now = self.clock.local_time();
        let state = self.state.lock();
        let input = DecisionInput {
            snapshot: &state.sensors,
            policy: &state.policy,
            ev_urgent: state.next_ev_urgency(),
            local_time: now,
        };
        compute_budget(&input)
    }

    /// Wait for a wake, then run one decision cycle.
    ///
    /// Returns the dispatched budget, or `None` when the cycle was skipped for
    /// lack of data. Concurrent callers are serialised so at most one cycle is
    /// in flight.
    pub async fn run_once(&self) -> Result<Option<Budget>, ControllerError> {
        let _cycle = self.cycle.lock().await;
        self.wake.notified().await;
        self.dispatch_cycle().await
    }

    /// Run decision cycles until the sink fails.
    pub async fn run(&self) -> Result<(), ControllerError> {
        info!("decision loop started");
        loop {
            self.run_once().await?;
        }
    }

    async fn dispatch_cycle(&self) -> Result<Option<Budget>, ControllerError> {
        let now = self.clock.local_time();
        let decided = {
            let mut state = self.state.lock();
            state.ev_urgent = state.next_ev_urgency();
            let input = DecisionInput {
                snapshot: &state.sensors,
                policy: &state.policy,
                ev_urgent: state.ev_urgent,
                local_time: now,
            };
            match compute_budget(&input) {
                Verdict::InsufficientData => None,
                Verdict::Budget(decision) => {
                    Some((decision, Budget::clamped(decision, &state.policy)))
                }
            }
        };

        let Some((decision, budget)) = decided else {
            debug!("strategy not yet observed; skipping decision cycle");
            self.reporter.report_cycle(CycleOutcome::InsufficientData);
            return Ok(None);
        };

        if let Err(err) = self.sink.apply(&budget).await {
            error!(
                error = %err,
                watts = budget.watts,
                mode = %budget.mode,
                rule = %budget.rule,
                "budget dispatch failed"
            );
            self.reporter.report_cycle(CycleOutcome::DispatchFailed);
            return Err(ControllerError::Dispatch(err));
        }

        info!(
            watts = budget.watts,
            raw_watts = decision.watts,
            mode = %budget.mode,
            rule = %budget.rule,
            "budget applied"
        );
        self.reporter.report_budget(&budget);
        self.reporter.report_cycle(CycleOutcome::Dispatched);
        Ok(Some(budget))
    }
}
