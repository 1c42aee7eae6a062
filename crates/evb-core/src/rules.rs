//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Priority-ordered rule ladder.
//!
//! Each rule is a guard plus an action evaluated against the derated ceiling.
//! The first guard that holds decides the budget; when none holds the budget
//! is the ceiling itself.

use std::fmt;

use chrono::NaiveTime;
use serde::Serialize;

use crate::policy::ChargePolicy;
use crate::sensors::{SensorSnapshot, Strategy};

/// Charger mode requested alongside the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    /// Charge at the published budget.
    Fast,
    /// Let the charger follow the published excess-power budget.
    Eco,
}

impl ChargeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChargeMode::Fast => "fast",
            ChargeMode::Eco => "eco",
        }
    }
}

impl fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    FullSpeed,
    OvernightWindow,
    PeakAvoidance,
    OffPeakWindow,
    LoadReduction,
    BatteryExport,
    EvBatteryUrgent,
    SolarExport,
    Ceiling,
}

impl Rule {
    pub fn as_str(self) -> &'static str {
        match self {
            Rule::FullSpeed => "full_speed",
            Rule::OvernightWindow => "overnight_window",
            Rule::PeakAvoidance => "peak_avoidance",
            Rule::OffPeakWindow => "off_peak_window",
            Rule::LoadReduction => "load_reduction",
            Rule::BatteryExport => "battery_export",
            Rule::EvBatteryUrgent => "ev_battery_urgent",
            Rule::SolarExport => "solar_export",
            Rule::Ceiling => "ceiling",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unclamped output of the rule ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub watts: i64,
    pub mode: ChargeMode,
    pub rule: Rule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// The strategy has not been observed yet; skip the cycle.
    InsufficientData,
    Budget(Decision),
}

/// Clamped budget handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Budget {
    pub watts: i64,
    pub mode: ChargeMode,
    pub rule: Rule,
}

impl Budget {
    pub fn clamped(decision: Decision, policy: &ChargePolicy) -> Self {
        Self {
            watts: policy.clamp(decision.watts),
            mode: decision.mode,
            rule: decision.rule,
        }
    }
}

/// Everything the ladder reads. Deterministic for fixed inputs.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub snapshot: &'a SensorSnapshot,
    pub policy: &'a ChargePolicy,
    /// Current state of the EV urgency latch.
    pub ev_urgent: bool,
    pub local_time: NaiveTime,
}

impl<'a> DecisionInput<'a> {
    /// Input with the urgency latch derived from the snapshot alone.
    pub fn new(snapshot: &'a SensorSnapshot, policy: &'a ChargePolicy, local_time: NaiveTime) -> Self {
        let ev_urgent = snapshot
            .ev_battery_percent
            .map(|level| policy.ev_urgency().next(false, level))
            .unwrap_or(false);
        Self {
            snapshot,
            policy,
            ev_urgent,
            local_time,
        }
    }

    pub fn with_ev_urgent(mut self, ev_urgent: bool) -> Self {
        self.ev_urgent = ev_urgent;
        self
    }
}

struct RuleContext<'a> {
    input: &'a DecisionInput<'a>,
    strategy: Strategy,
    ceiling: i64,
}

impl RuleContext<'_> {
    fn snapshot(&self) -> &SensorSnapshot {
        self.input.snapshot
    }

    fn policy(&self) -> &ChargePolicy {
        self.input.policy
    }

    fn in_peak_window(&self) -> Option<bool> {
        self.policy()
            .peak_window()
            .map(|window| window.contains(self.input.local_time))
    }
}

struct RuleEntry {
    rule: Rule,
    guard: fn(&RuleContext<'_>) -> bool,
    action: fn(&RuleContext<'_>) -> (i64, ChargeMode),
}

const LADDER: &[RuleEntry] = &[
    RuleEntry {
        rule: Rule::FullSpeed,
        guard: full_speed_selected,
        action: charge_at_ceiling,
    },
    RuleEntry {
        rule: Rule::OvernightWindow,
        guard: inside_overnight_window,
        action: charge_at_ceiling,
    },
    RuleEntry {
        rule: Rule::PeakAvoidance,
        guard: inside_peak_window,
        action: stop_charging,
    },
    RuleEntry {
        rule: Rule::OffPeakWindow,
        guard: outside_peak_window,
        action: charge_at_ceiling,
    },
    RuleEntry {
        rule: Rule::LoadReduction,
        guard: load_reduction_active,
        action: stop_charging,
    },
    RuleEntry {
        rule: Rule::BatteryExport,
        guard: battery_exporting,
        action: stop_charging,
    },
    RuleEntry {
        rule: Rule::EvBatteryUrgent,
        guard: ev_battery_urgent,
        action: charge_at_ceiling,
    },
    RuleEntry {
        rule: Rule::SolarExport,
        guard: solar_export_observed,
        action: follow_solar_export,
    },
];

fn full_speed_selected(ctx: &RuleContext<'_>) -> bool {
    ctx.strategy == Strategy::FullSpeed
}

fn inside_overnight_window(ctx: &RuleContext<'_>) -> bool {
    ctx.strategy == Strategy::Overnight
        && ctx.policy().overnight_window().contains(ctx.input.local_time)
}

fn inside_peak_window(ctx: &RuleContext<'_>) -> bool {
    ctx.strategy == Strategy::OffPeak && ctx.in_peak_window() == Some(true)
}

fn outside_peak_window(ctx: &RuleContext<'_>) -> bool {
    ctx.strategy == Strategy::OffPeak && ctx.in_peak_window() == Some(false)
}

fn load_reduction_active(ctx: &RuleContext<'_>) -> bool {
    ctx.snapshot().load_reduction == Some(true)
}

fn battery_exporting(ctx: &RuleContext<'_>) -> bool {
    ctx.snapshot()
        .exported_battery_w
        .is_some_and(|watts| watts > ctx.policy().battery_export_threshold_w())
}

fn ev_battery_urgent(ctx: &RuleContext<'_>) -> bool {
    ctx.snapshot().ev_battery_percent.is_some() && ctx.input.ev_urgent
}

fn solar_export_observed(ctx: &RuleContext<'_>) -> bool {
    ctx.snapshot().exported_solar_w.is_some()
}

fn charge_at_ceiling(ctx: &RuleContext<'_>) -> (i64, ChargeMode) {
    (ctx.ceiling, ChargeMode::Fast)
}

fn stop_charging(_: &RuleContext<'_>) -> (i64, ChargeMode) {
    (0, ChargeMode::Eco)
}

fn follow_solar_export(ctx: &RuleContext<'_>) -> (i64, ChargeMode) {
    let exported = ctx.snapshot().exported_solar_w.unwrap_or_default() as i64;
    (ctx.ceiling.min(exported), ChargeMode::Eco)
}

/// Evaluate the ladder. Returns [`Verdict::InsufficientData`] until a strategy
/// has been observed; an unrecognised strategy is treated like `auto`.
pub fn compute_budget(input: &DecisionInput<'_>) -> Verdict {
    let Some(strategy) = input.snapshot.strategy else {
        return Verdict::InsufficientData;
    };
    let ctx = RuleContext {
        input,
        strategy,
        ceiling: input.policy.ceiling(input.snapshot.evse_temperature),
    };
    let decision = LADDER
        .iter()
        .find(|entry| (entry.guard)(&ctx))
        .map(|entry| {
            let (watts, mode) = (entry.action)(&ctx);
            Decision {
                watts,
                mode,
                rule: entry.rule,
            }
        })
        .unwrap_or(Decision {
            watts: ctx.ceiling,
            mode: ChargeMode::Eco,
            rule: Rule::Ceiling,
        });
    Verdict::Budget(decision)
}
