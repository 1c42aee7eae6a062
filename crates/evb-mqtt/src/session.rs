//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and edge adapters."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evb_common::config::MqttConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MqttError;

const REQUEST_CAPACITY: usize = 10;
const INBOUND_CAPACITY: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of a broker connection.
#[async_trait]
pub trait MessagePublisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), MqttError>;
}

/// Publisher bound to a session. Refuses to queue while the broker is
/// unreachable and never waits on a full request queue.
#[derive(Clone)]
struct SessionPublisher {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
}

#[async_trait]
impl MessagePublisher for SessionPublisher {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), MqttError> {
        if !*self.connected.borrow() {
            return Err(MqttError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.into_bytes())?;
        Ok(())
    }
}

/// A publish received on one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

/// Broker connection with its event loop running on a background task.
///
/// rumqttc reconnects on the next poll after an error; subscriptions are
/// re-issued on every `ConnAck` so a broker restart does not drop them.
/// The event loop runs until [`MqttSession::disconnect`].
pub struct MqttSession {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MqttSession {
    pub fn connect(
        config: &MqttConfig,
        subscriptions: Vec<String>,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), MqttError> {
        let (host, port) = config
            .broker_endpoint()
            .map_err(|err| MqttError::Config(format!("{:#}", err)))?;
        let mut options = MqttOptions::new(config.client_id.clone(), host.clone(), port);
        options.set_keep_alive(config.keep_alive);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (connected_tx, connected) = watch::channel(false);
        let (stop, stop_rx) = oneshot::channel();
        info!(host = %host, port, client_id = %config.client_id, "mqtt session starting");
        let task = tokio::spawn(drive_eventloop(
            eventloop,
            client.clone(),
            subscriptions,
            inbound_tx,
            connected_tx,
            stop_rx,
        ));
        let session = Self {
            client,
            connected,
            stop,
            task,
        };
        Ok((session, inbound_rx))
    }

    pub fn publisher(&self) -> Arc<dyn MessagePublisher> {
        Arc::new(SessionPublisher {
            client: self.client.clone(),
            connected: self.connected.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the broker has acknowledged the connection.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut connected = self.connected.clone();
        let result = match tokio::time::timeout(timeout, connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(MqttError::NotConnected),
        };
        result
    }

    /// Send a disconnect if the broker is reachable, then stop the event loop.
    pub async fn disconnect(self) {
        if self.is_connected() {
            if let Err(err) = self.client.try_disconnect() {
                debug!(error = %err, "mqtt disconnect request failed");
            }
        }
        let _ = self.stop.send(());
        if tokio::time::timeout(STOP_TIMEOUT, self.task).await.is_err() {
            warn!("mqtt event loop did not stop in time");
        }
    }
}

async fn drive_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    inbound: mpsc::Sender<InboundMessage>,
    connected: watch::Sender<bool>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => {
                if *connected.borrow() {
                    flush_until_disconnect(&mut eventloop).await;
                }
                debug!("mqtt event loop stopped");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected.send_replace(true);
                    for topic in &subscriptions {
                        if let Err(err) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                            warn!(topic = %topic, error = %err, "mqtt subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match String::from_utf8(publish.payload.to_vec()) {
                        Ok(payload) => {
                            let message = InboundMessage { topic: publish.topic, payload };
                            if let Err(err) = inbound.try_send(message) {
                                warn!(error = %err, "mqtt inbound message dropped");
                            }
                        }
                        Err(_) => warn!(topic = %publish.topic, "mqtt payload is not utf-8"),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    connected.send_replace(false);
                    warn!(error = %err, "mqtt connection error; reconnecting");
                    tokio::select! {
                        _ = &mut stop => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            },
        }
    }
    connected.send_replace(false);
}

/// Poll until queued requests and the disconnect packet have been written.
async fn flush_until_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(FLUSH_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("mqtt requests still pending at shutdown");
    }
}
