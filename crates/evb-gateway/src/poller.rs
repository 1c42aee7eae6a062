//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// One upstream source polled on a fixed interval.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Fetch and forward readings. A failed fetch must withhold the setter
    /// calls it would have made.
    async fn poll_once(&self) -> Result<(), GatewayError>;
}

/// Poll until shutdown. Failures are logged and the next tick proceeds.
pub async fn run_poller<P: Poller>(
    poller: P,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(poller = poller.name(), "poller shutdown");
                break;
            }
            _ = ticker.tick() => {
                match poller.poll_once().await {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            debug!(poller = poller.name(), consecutive_failures, "poller recovered");
                        }
                        consecutive_failures = 0;
                    }
                    Err(err) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        warn!(
                            poller = poller.name(),
                            error = %err,
                            consecutive_failures,
                            "poll failed; readings withheld"
                        );
                    }
                }
            }
        }
    }
}
