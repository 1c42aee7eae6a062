//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the EV budget governor daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use evb_common::config::AppConfig;
use evb_common::logging::{init_tracing, LogFormat};
use evb_core::{
    Budget, BudgetSink, ChargePolicy, Controller, DispatchError, FanoutReporter, Strategy,
};
use evb_gateway::{run_poller, OpenEvseClient, OpenEvsePoller, PowerwallClient, PowerwallPoller};
use evb_metrics::{
    new_registry, spawn_exporter, DaemonMetrics, EnergyMetrics, MetricsReporter, SharedRegistry,
};
use evb_mqtt::{run_command_listener, CommandTopics, MqttBudgetSink, MqttReporter, MqttSession};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/evbd.toml";
const EVSE_LABEL: &str = "openevse";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "EV charge budget governor daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Log budgets instead of publishing them to the charger")]
    dry_run: bool,

    #[arg(long, value_enum, help = "Override the configured log format")]
    log_format: Option<CliLogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::StructuredJson,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the decision loop")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

/// Budget sink used with `--dry-run`.
struct LogSink;

#[async_trait]
impl BudgetSink for LogSink {
    async fn apply(&self, budget: &Budget) -> Result<(), DispatchError> {
        info!(
            watts = budget.watts,
            mode = %budget.mode,
            rule = %budget.rule,
            "dry run; budget not published"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    let loaded_config = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded_config.config;
    let config_path = loaded_config.source;

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.inc_start();

    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing("evbd", &config.logging)?;
    info!(config_path = %config_path.display(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, metrics_registry, cli.dry_run).await,
        Commands::CheckConfig => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    let policy = ChargePolicy::from_config(&config.charging)?;
    let (host, port) = config.mqtt.broker_endpoint()?;
    println!(
        "Configuration OK\nCeiling: {} W\nOvernight window: {}\nPeak window: {}\nBroker: {}:{}\nBudget topic: {}",
        policy.max_power_w(),
        policy.overnight_window(),
        policy
            .peak_window()
            .map(|window| window.to_string())
            .unwrap_or_else(|| "off".into()),
        host,
        port,
        config.mqtt.budget_topic,
    );
    Ok(())
}

async fn run_daemon(config: AppConfig, registry: SharedRegistry, dry_run: bool) -> Result<()> {
    let policy = ChargePolicy::from_config(&config.charging).context("invalid charging policy")?;
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let (metrics_exporter, energy) = if config.metrics.enabled {
        let exporter =
            spawn_exporter(registry.clone(), config.metrics.listen, shutdown_tx.subscribe())
                .await?;
        (Some(exporter), Some(EnergyMetrics::new(registry)?))
    } else {
        info!("metrics exporter disabled by configuration");
        (None, None)
    };

    let openevse = match config.openevse.address {
        Some(_) => Some(
            OpenEvseClient::from_config(&config.openevse).context("invalid openevse settings")?,
        ),
        None => None,
    };

    let command_topics = CommandTopics::new(&config.mqtt.base_topic);
    let (session, inbound) = MqttSession::connect(&config.mqtt, command_topics.subscriptions())
        .context("failed to start mqtt session")?;
    if !dry_run {
        session
            .wait_connected(CONNECT_TIMEOUT)
            .await
            .with_context(|| format!("mqtt broker {} unreachable", config.mqtt.broker))?;
    }
    let publisher = session.publisher();

    let (mqtt_reporter, reporter_task) = MqttReporter::spawn(
        publisher.clone(),
        &config.mqtt.base_topic,
        config.mqtt.home_assistant_discovery,
    );
    let mut reporter = FanoutReporter::new().with(Arc::new(mqtt_reporter));
    if let Some(metrics) = &energy {
        reporter = reporter.with(Arc::new(MetricsReporter::new(metrics.clone(), EVSE_LABEL)));
    }

    let sink: Arc<dyn BudgetSink> = if dry_run {
        warn!("dry run enabled; budgets are logged, not published");
        Arc::new(LogSink)
    } else {
        let mut sink = MqttBudgetSink::new(publisher, config.mqtt.budget_topic.clone());
        if config.openevse.manage_charge_mode {
            match &openevse {
                Some(client) => sink = sink.with_charge_mode(Arc::new(client.clone())),
                None => warn!("openevse.manage_charge_mode is set without openevse.address"),
            }
        }
        Arc::new(sink)
    };

    let controller = Arc::new(Controller::new(policy, sink).with_reporter(Arc::new(reporter)));
    if let Some(raw) = &config.charging.initial_strategy {
        controller.set_controller_strategy(Strategy::parse(raw));
    }

    let mut tasks = Vec::new();
    if config.gateway.address.is_some() {
        let client =
            PowerwallClient::from_config(&config.gateway).context("invalid gateway settings")?;
        info!(base_url = %client.base_url(), "powerwall poller enabled");
        let poller = PowerwallPoller::new(client, controller.clone(), energy.clone());
        tasks.push(tokio::spawn(run_poller(
            poller,
            config.polling.interval,
            shutdown_tx.subscribe(),
        )));
    } else {
        warn!("gateway.address not set; powerwall readings unavailable");
    }
    if let Some(client) = openevse {
        let poller = OpenEvsePoller::new(client, controller.clone(), energy.clone());
        tasks.push(tokio::spawn(run_poller(
            poller,
            config.polling.interval,
            shutdown_tx.subscribe(),
        )));
    }
    tasks.push(tokio::spawn(run_command_listener(
        inbound,
        command_topics,
        controller.clone(),
        shutdown_tx.subscribe(),
    )));

    info!(
        interval_secs = config.polling.interval.as_secs(),
        dry_run, "daemon running; waiting for termination signal"
    );
    let outcome = tokio::select! {
        result = controller.run() => match result {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "decision loop stopped");
                Err(anyhow::Error::new(err).context("decision loop stopped"))
            }
        },
        signal = signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("ctrl-c received; shutting down");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    // Queued telemetry needs the session's event loop, so it stops last.
    drop(controller);
    if tokio::time::timeout(DRAIN_TIMEOUT, reporter_task).await.is_err() {
        warn!("telemetry queue did not drain before shutdown");
    }
    session.disconnect().await;

    if let Some(exporter) = metrics_exporter {
        exporter.stopped().await?;
    }

    outcome
}
