//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Charge budget decision engine and its collaborator ports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use evb_common::time::MinuteWindow;
use evb_core::{
    Budget, BudgetSink, ChargeMode, ChargePolicy, Controller, ControllerError, CycleOutcome,
    Decision, DispatchError, FixedClock, Reporter, Rule, Strategy, Temperature, UrgencyBand,
    Verdict,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

const IDLE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<Budget>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    entered: Notify,
    delay: Option<Duration>,
    fail: AtomicBool,
}

impl RecordingSink {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn watts(&self) -> Vec<i64> {
        self.applied.lock().iter().map(|b| b.watts).collect()
    }
}

#[async_trait]
impl BudgetSink for RecordingSink {
    async fn apply(&self, budget: &Budget) -> Result<(), DispatchError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Publish("broker unreachable".into()));
        }
        self.applied.lock().push(*budget);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReporter {
    budgets: Mutex<Vec<i64>>,
    connected: Mutex<Vec<bool>>,
    currents: Mutex<Vec<i64>>,
    temperatures: Mutex<Vec<Temperature>>,
    cycles: Mutex<Vec<CycleOutcome>>,
}

impl Reporter for RecordingReporter {
    fn report_budget(&self, budget: &Budget) {
        self.budgets.lock().push(budget.watts);
    }

    fn report_ev_connected(&self, connected: bool) {
        self.connected.lock().push(connected);
    }

    fn report_evse_current(&self, milliamps: i64) {
        self.currents.lock().push(milliamps);
    }

    fn report_evse_temperature(&self, temperature: Temperature) {
        self.temperatures.lock().push(temperature);
    }

    fn report_cycle(&self, outcome: CycleOutcome) {
        self.cycles.lock().push(outcome);
    }
}

fn at(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
}

fn controller_with(sink: Arc<RecordingSink>) -> Controller {
    Controller::new(ChargePolicy::default(), sink).with_clock(Arc::new(FixedClock::new(at(12, 0))))
}

#[tokio::test]
async fn cold_start_skips_until_strategy_observed() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink.clone());

    controller.set_exported_solar_w(2_500.0);
    controller.set_load_reduction(false);
    assert_eq!(controller.run_once().await.unwrap(), None);
    assert!(sink.watts().is_empty());

    controller.set_controller_strategy(Strategy::Auto);
    let budget = controller.run_once().await.unwrap().unwrap();
    assert_eq!(budget.watts, 2_500);
    assert_eq!(budget.rule, Rule::SolarExport);
    assert_eq!(sink.watts(), vec![2_500]);
}

#[tokio::test]
async fn evaluate_previews_without_dispatching() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink.clone());

    assert_eq!(controller.evaluate(), Verdict::InsufficientData);

    controller.set_controller_strategy(Strategy::Auto);
    controller.set_exported_solar_w(2_500.0);
    let expected = Decision {
        watts: 2_500,
        mode: ChargeMode::Eco,
        rule: Rule::SolarExport,
    };
    assert_eq!(controller.evaluate(), Verdict::Budget(expected));
    assert_eq!(controller.evaluate(), Verdict::Budget(expected));
    assert!(sink.watts().is_empty());

    // The pending wake is left for the decision loop.
    let budget = timeout(IDLE, controller.run_once())
        .await
        .expect("wake consumed by evaluate")
        .unwrap()
        .unwrap();
    assert_eq!(budget.watts, 2_500);
    assert_eq!(sink.watts(), vec![2_500]);
}

#[tokio::test]
async fn identical_reading_is_observed_but_does_not_wake() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink.clone());

    assert_eq!(controller.strategy(), None);
    controller.set_controller_strategy(Strategy::Auto);
    assert_eq!(controller.strategy(), Some(Strategy::Auto));
    controller.run_once().await.unwrap();

    controller.set_controller_strategy(Strategy::Auto);
    assert!(timeout(IDLE, controller.run_once()).await.is_err());
    assert_eq!(sink.watts().len(), 1);

    controller.set_exported_solar_w(1_000.0);
    let budget = timeout(IDLE, controller.run_once())
        .await
        .expect("real change wakes the loop")
        .unwrap()
        .unwrap();
    assert_eq!(budget.watts, 1_000);
}

#[tokio::test]
async fn wakes_coalesce_into_one_cycle() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink.clone());

    controller.set_controller_strategy(Strategy::Auto);
    controller.set_exported_solar_w(500.0);
    controller.set_exported_solar_w(1_500.0);
    controller.set_exported_battery_w(0.0);

    let budget = controller.run_once().await.unwrap().unwrap();
    assert_eq!(budget.watts, 1_500);
    assert!(timeout(IDLE, controller.run_once()).await.is_err());
    assert_eq!(sink.watts(), vec![1_500]);
}

#[tokio::test]
async fn budget_is_clamped_to_hardware_limit() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink.clone());

    controller.set_controller_strategy(Strategy::Auto);
    controller.set_exported_solar_w(15_000.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().watts, 9_600);

    controller.set_exported_solar_w(-800.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().watts, 0);

    controller.set_controller_strategy(Strategy::FullSpeed);
    let budget = controller.run_once().await.unwrap().unwrap();
    assert_eq!(budget.watts, 9_600);
    assert_eq!(budget.mode, ChargeMode::Fast);
}

#[tokio::test]
async fn derate_limits_full_speed() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink.clone());

    controller.set_controller_strategy(Strategy::FullSpeed);
    controller.set_evse_temperature(Temperature::from_deci_celsius(472));
    assert_eq!(controller.run_once().await.unwrap().unwrap().watts, 240 * 24);

    controller.set_evse_temperature(Temperature::from_deci_celsius(512));
    assert_eq!(controller.run_once().await.unwrap().unwrap().watts, 240 * 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_failure_stops_the_loop() {
    let sink = Arc::new(RecordingSink::default());
    sink.fail.store(true, Ordering::SeqCst);
    let controller = Arc::new(controller_with(sink.clone()));

    let looping = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run().await }
    });
    controller.set_controller_strategy(Strategy::FullSpeed);

    let result = timeout(Duration::from_secs(2), looping)
        .await
        .expect("loop exits on dispatch failure")
        .unwrap();
    assert!(matches!(
        result,
        Err(ControllerError::Dispatch(DispatchError::Publish(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cycles_never_overlap() {
    let sink = Arc::new(RecordingSink::slow(Duration::from_millis(50)));
    let controller = Arc::new(controller_with(sink.clone()));
    controller.set_controller_strategy(Strategy::Auto);
    controller.set_exported_solar_w(1_000.0);

    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run_once().await }
    });
    let second = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run_once().await }
    });

    sink.entered.notified().await;
    controller.set_exported_solar_w(2_000.0);
    controller.set_exported_battery_w(50.0);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(first.is_some() && second.is_some());
    assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(sink.watts(), vec![1_000, 2_000]);
}

#[tokio::test]
async fn overnight_window_follows_clock() {
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(FixedClock::new(at(3, 0)));
    let controller = Controller::new(ChargePolicy::default(), sink.clone()).with_clock(clock.clone());

    controller.set_controller_strategy(Strategy::Overnight);
    controller.set_exported_solar_w(0.0);
    let night = controller.run_once().await.unwrap().unwrap();
    assert_eq!(night.watts, 9_600);
    assert_eq!(night.rule, Rule::OvernightWindow);

    clock.set(at(7, 0));
    controller.set_exported_solar_w(300.0);
    let day = controller.run_once().await.unwrap().unwrap();
    assert_eq!(day.watts, 300);
    assert_eq!(day.mode, ChargeMode::Eco);
}

#[tokio::test]
async fn peak_window_update_wakes_loop() {
    let sink = Arc::new(RecordingSink::default());
    let controller = Controller::new(ChargePolicy::default(), sink.clone())
        .with_clock(Arc::new(FixedClock::new(at(17, 30))));

    controller.set_controller_strategy(Strategy::OffPeak);
    controller.set_exported_solar_w(700.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().watts, 700);

    let peak: MinuteWindow = "16:00-21:00".parse().unwrap();
    controller.set_peak_window(Some(peak));
    let budget = controller.run_once().await.unwrap().unwrap();
    assert_eq!(budget.watts, 0);
    assert_eq!(budget.rule, Rule::PeakAvoidance);
    assert_eq!(controller.policy().peak_window(), Some(peak));

    controller.set_peak_window(Some(peak));
    assert!(timeout(IDLE, controller.run_once()).await.is_err());
}

#[tokio::test]
async fn ev_urgency_holds_through_band() {
    let sink = Arc::new(RecordingSink::default());
    let policy = ChargePolicy::default().with_ev_urgency(UrgencyBand::new(50.0, 60.0).unwrap());
    let controller =
        Controller::new(policy, sink.clone()).with_clock(Arc::new(FixedClock::new(at(12, 0))));

    controller.set_controller_strategy(Strategy::Auto);
    controller.set_exported_solar_w(400.0);
    controller.set_ev_battery_level_percent(55.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().rule, Rule::SolarExport);

    controller.set_ev_battery_level_percent(45.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().rule, Rule::EvBatteryUrgent);

    controller.set_ev_battery_level_percent(55.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().rule, Rule::EvBatteryUrgent);

    controller.set_ev_battery_level_percent(60.0);
    assert_eq!(controller.run_once().await.unwrap().unwrap().rule, Rule::SolarExport);
}

#[tokio::test]
async fn reporter_sees_evse_readings_and_dispatched_budget() {
    let sink = Arc::new(RecordingSink::default());
    let reporter = Arc::new(RecordingReporter::default());
    let controller = controller_with(sink.clone()).with_reporter(reporter.clone());

    controller.set_ev_connected(true);
    controller.set_ev_connected(true);
    controller.set_evse_current_ma(16_000);
    controller.set_evse_temperature(Temperature::from_deci_celsius(301));
    assert_eq!(controller.run_once().await.unwrap(), None);

    controller.set_controller_strategy(Strategy::FullSpeed);
    controller.run_once().await.unwrap();

    assert_eq!(*reporter.connected.lock(), vec![true, true]);
    assert_eq!(*reporter.currents.lock(), vec![16_000]);
    assert_eq!(
        *reporter.temperatures.lock(),
        vec![Temperature::from_deci_celsius(301)]
    );
    assert_eq!(*reporter.budgets.lock(), vec![9_600]);
    assert_eq!(
        *reporter.cycles.lock(),
        vec![CycleOutcome::InsufficientData, CycleOutcome::Dispatched]
    );
    assert_eq!(controller.ev_connected(), Some(true));
    assert_eq!(controller.evse_current_ma(), Some(16_000));
}

#[tokio::test]
async fn snapshot_reflects_every_setter() {
    let sink = Arc::new(RecordingSink::default());
    let controller = controller_with(sink);

    controller.set_solar_w(4_200.0);
    controller.set_load_w(1_100.0);
    controller.set_powerwall_battery_level_percent(87.5);
    controller.set_operation_mode(evb_core::OperationMode::SelfConsumption);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.solar_w, Some(4_200.0));
    assert_eq!(snapshot.load_w, Some(1_100.0));
    assert_eq!(snapshot.powerwall_battery_percent, Some(87.5));
    assert_eq!(
        snapshot.operation_mode,
        Some(evb_core::OperationMode::SelfConsumption)
    );
    assert_eq!(snapshot.strategy, None);
    assert_eq!(controller.load_w(), Some(1_100.0));
}
