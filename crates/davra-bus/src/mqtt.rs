//! MQTT channel: one broker connection subscribed to one topic.
//!
//! The `rumqttc` event loop runs on its own task. It (re)subscribes on every
//! `ConnAck`, forwards payloads published on the topic into an `mpsc` channel,
//! and keeps retrying the broker after failures. Only the first failure is
//! logged at warn level; a missing broker degrades latency, not correctness.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{BusError, Result};
use crate::transport::Transport;

/// Port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 1883;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 10;

/// `host[:port]` of a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix("mqtt://")
            .or_else(|| s.strip_prefix("tcp://"))
            .unwrap_or(s);
        if s.is_empty() {
            return Err(BusError::InvalidAddress("empty address".into()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| BusError::InvalidAddress(format!("bad port in {s}")))?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            Some(_) => Err(BusError::InvalidAddress(format!("missing host in {s}"))),
            None => Ok(Self {
                host: s.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

/// Connection settings for one channel.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// MQTT client identifier.
    pub client_id: String,
    /// Broker to connect to.
    pub broker: BrokerAddress,
    /// Topic to subscribe and publish on.
    pub topic: String,
    /// Username and password.
    pub credentials: Option<(String, String)>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Inbound buffer size.
    pub inbound_capacity: usize,
}

impl ChannelOptions {
    /// Options with default keep-alive and buffer size.
    #[must_use]
    pub fn new(client_id: impl Into<String>, broker: BrokerAddress, topic: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            broker,
            topic: topic.into(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            inbound_capacity: 64,
        }
    }

    /// Authenticate with a username and password.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// A connected (or connecting) MQTT channel.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
    topic: String,
}

impl MqttChannel {
    /// Start the connection and return the channel with its inbound stream.
    ///
    /// Connecting happens in the background; this never fails.
    #[must_use]
    pub fn connect(options: ChannelOptions) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let mut mqtt = MqttOptions::new(
            options.client_id.clone(),
            options.broker.host.clone(),
            options.broker.port,
        );
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        if let Some((username, password)) = options.credentials {
            mqtt.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity);

        info!(
            broker = %options.broker.host,
            port = options.broker.port,
            topic = %options.topic,
            "Connecting to MQTT broker"
        );
        tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            options.topic.clone(),
            inbound_tx,
        ));

        (
            Self {
                client,
                topic: options.topic,
            },
            inbound_rx,
        )
    }

    /// The topic this channel publishes on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Ask the broker connection to close.
    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(topic = %self.topic, error = %e, "Disconnect request dropped");
        }
    }
}

#[async_trait]
impl Transport for MqttChannel {
    async fn send(&self, payload: Vec<u8>) -> Result<()> {
        // try_publish never waits on a stalled event loop.
        self.client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topic: String,
    inbound: mpsc::Sender<Vec<u8>>,
) {
    let mut failures: u32 = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if failures > 0 {
                    info!(topic = %topic, "Broker connection restored");
                } else {
                    info!(topic = %topic, "Connected to broker");
                }
                failures = 0;
                if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                    warn!(topic = %topic, error = %e, "Subscribe request failed");
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if publish.topic != topic {
                    continue;
                }
                if inbound.send(publish.payload.to_vec()).await.is_err() {
                    debug!(topic = %topic, "Inbound receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(topic = %topic, "Disconnected from broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if failures == 0 {
                    warn!(
                        topic = %topic,
                        error = %e,
                        "Broker unavailable, continuing without this bus"
                    );
                } else {
                    debug!(topic = %topic, error = %e, attempt = failures, "Broker still unavailable");
                }
                failures = failures.saturating_add(1);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
