//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use evb_common::config::{GatewayConfig, OpenEvseConfig};
use evb_core::{
    Budget, BudgetSink, ChargeMode, ChargeModeSetter, ChargePolicy, Controller, DispatchError,
    OperationMode, Temperature,
};
use evb_gateway::{GatewayError, OpenEvseClient, OpenEvsePoller, Poller, PowerwallClient, PowerwallPoller};
use serde_json::{json, Value};

struct DiscardSink;

#[async_trait]
impl BudgetSink for DiscardSink {
    async fn apply(&self, _budget: &Budget) -> Result<(), DispatchError> {
        Ok(())
    }
}

fn controller() -> Arc<Controller> {
    Arc::new(Controller::new(ChargePolicy::default(), Arc::new(DiscardSink)))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn gateway_config(addr: SocketAddr) -> GatewayConfig {
    GatewayConfig {
        address: Some(format!("http://{}", addr)),
        timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

fn openevse_config(addr: SocketAddr) -> OpenEvseConfig {
    OpenEvseConfig {
        address: Some(format!("http://{}", addr)),
        timeout: Duration::from_secs(2),
        ..OpenEvseConfig::default()
    }
}

fn powerwall_router(soe_status: StatusCode) -> Router {
    Router::new()
        .route(
            "/api/meters/aggregates",
            get(|| async {
                Json(json!({
                    "site": {"instant_power": -3200.0, "energy_exported": 10.0, "energy_imported": 5.0},
                    "battery": {"instant_power": 150.0},
                    "load": {"instant_power": 900.0},
                    "solar": {"instant_power": 4250.0}
                }))
            }),
        )
        .route(
            "/api/system_status/soe",
            get(move || async move {
                if soe_status.is_success() {
                    (soe_status, Json(json!({"percentage": 87.5})))
                } else {
                    (soe_status, Json(json!({"error": "unavailable"})))
                }
            }),
        )
        .route(
            "/api/system_status",
            get(|| async {
                Json(json!({"nominal_full_pack_energy": 13500.0, "nominal_energy_remaining": 11800.0}))
            }),
        )
        .route(
            "/api/system_status/grid_status",
            get(|| async { Json(json!({"grid_services_active": false, "grid_status": "SystemGridConnected"})) }),
        )
        .route(
            "/api/operation",
            get(|| async { Json(json!({"real_mode": "self_consumption", "backup_reserve_percent": 24.0})) }),
        )
}

#[tokio::test]
async fn powerwall_poll_feeds_controller() {
    let addr = serve(powerwall_router(StatusCode::OK)).await;
    let controller = controller();
    let client = PowerwallClient::from_config(&gateway_config(addr)).unwrap();
    let poller = PowerwallPoller::new(client, controller.clone(), None);

    poller.poll_once().await.unwrap();

    assert_eq!(controller.exported_solar_w(), Some(3200.0));
    assert_eq!(controller.exported_battery_w(), Some(150.0));
    assert_eq!(controller.load_w(), Some(900.0));
    assert_eq!(controller.solar_w(), Some(4250.0));
    assert_eq!(controller.powerwall_battery_percent(), Some(87.5));
    assert_eq!(controller.load_reduction(), Some(false));
    assert_eq!(controller.operation_mode(), Some(OperationMode::SelfConsumption));
}

#[tokio::test]
async fn failed_endpoint_withholds_only_its_readings() {
    let addr = serve(powerwall_router(StatusCode::SERVICE_UNAVAILABLE)).await;
    let controller = controller();
    let client = PowerwallClient::from_config(&gateway_config(addr)).unwrap();
    let poller = PowerwallPoller::new(client, controller.clone(), None);

    let err = poller.poll_once().await.unwrap_err();
    assert!(matches!(err, GatewayError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(controller.powerwall_battery_percent(), None);
    assert_eq!(controller.solar_w(), Some(4250.0));
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let app = Router::new().route("/api/system_status/soe", get(|| async { "not json" }));
    let addr = serve(app).await;
    let client = PowerwallClient::from_config(&gateway_config(addr)).unwrap();
    assert!(matches!(
        client.state_of_energy().await,
        Err(GatewayError::Decode { .. })
    ));
}

#[tokio::test]
async fn openevse_status_feeds_controller() {
    let app = Router::new().route(
        "/status",
        get(|| async {
            Json(json!({"amp": 24000, "temp": 381, "pilot": 32, "voltage": 240,
                        "watthour": 0.0, "wattsec": 7200.0, "vehicle": 1}))
        }),
    );
    let addr = serve(app).await;
    let controller = controller();
    let client = OpenEvseClient::from_config(&openevse_config(addr)).unwrap();
    let poller = OpenEvsePoller::new(client, controller.clone(), None);

    poller.poll_once().await.unwrap();

    assert_eq!(controller.evse_current_ma(), Some(24_000));
    assert_eq!(controller.evse_temperature(), Some(Temperature::from_deci_celsius(381)));
    assert_eq!(controller.ev_connected(), Some(true));
}

#[tokio::test]
async fn omitted_status_field_keeps_previous_reading() {
    let app = Router::new().route(
        "/status",
        get(|| async { Json(json!({"amp": 16000, "vehicle": 1})) }),
    );
    let addr = serve(app).await;
    let controller = controller();
    controller.set_evse_temperature(Temperature::from_deci_celsius(512));
    let client = OpenEvseClient::from_config(&openevse_config(addr)).unwrap();
    let poller = OpenEvsePoller::new(client, controller.clone(), None);

    poller.poll_once().await.unwrap();

    assert_eq!(controller.evse_temperature(), Some(Temperature::from_deci_celsius(512)));
    assert_eq!(controller.evse_current_ma(), Some(16_000));
    assert_eq!(controller.ev_connected(), Some(true));
}

#[tokio::test]
async fn openevse_error_withholds_readings() {
    let app = Router::new().route(
        "/status",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let addr = serve(app).await;
    let controller = controller();
    let client = OpenEvseClient::from_config(&openevse_config(addr)).unwrap();
    let poller = OpenEvsePoller::new(client, controller.clone(), None);

    assert!(poller.poll_once().await.is_err());
    assert_eq!(controller.evse_current_ma(), None);
    assert_eq!(controller.ev_connected(), None);
}

type Posted = Arc<Mutex<Vec<Value>>>;

async fn record_config(State(posted): State<Posted>, Json(body): Json<Value>) -> StatusCode {
    posted.lock().unwrap().push(body);
    StatusCode::OK
}

#[tokio::test]
async fn charge_mode_is_posted_as_config() {
    let posted: Posted = Arc::default();
    let app = Router::new()
        .route(
            "/config",
            get(|| async { Json(json!({"charge_mode": "fast", "firmware": "7.1.3"})) })
                .post(record_config),
        )
        .with_state(posted.clone());
    let addr = serve(app).await;
    let client = OpenEvseClient::from_config(&openevse_config(addr)).unwrap();

    assert_eq!(client.config().await.unwrap().charge_mode, "fast");
    client.set_charge_mode(ChargeMode::Eco).await.unwrap();

    let bodies = posted.lock().unwrap().clone();
    assert_eq!(bodies, vec![json!({"charge_mode": "eco"})]);
}

#[tokio::test]
async fn rejected_charge_mode_is_a_dispatch_error() {
    let app = Router::new().route(
        "/config",
        axum::routing::post(|| async { StatusCode::FORBIDDEN }),
    );
    let addr = serve(app).await;
    let client = OpenEvseClient::from_config(&openevse_config(addr)).unwrap();

    let err = client.set_charge_mode(ChargeMode::Fast).await.unwrap_err();
    assert!(matches!(err, DispatchError::ChargeMode { mode: ChargeMode::Fast, .. }));
}
