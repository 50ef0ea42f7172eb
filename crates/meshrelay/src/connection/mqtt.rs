//! MQTT connection driver
//!
//! Subscribes to a broker topic and maps whatever arrives into packets.
//! Brokers in the wild publish three different shapes on Meshtastic topics,
//! tried in order:
//!
//! 1. a JSON document (`{"from":…,"type":"TEXT_MESSAGE_APP",…}`),
//! 2. a binary FromRadio protobuf, the native gateway format,
//! 3. anything else, treated as a raw text message with the sender node
//!    scavenged from a `!xxxxxxxx` topic segment.
//!
//! The client auto-reconnects; a lost broker logs a warning and retries on a
//! fixed interval, resubscribing on every successful connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet as MqttPacket, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshrelay_proto::{proto, PortNum};

use crate::config::MqttConfig;
use crate::connection::stream::{self, NodeRegistry};
use crate::connection::{Connection, ConnectionState, CHANNEL_CAPACITY};
use crate::error::{RelayError, Result};
use crate::message::{NodeInfo, Packet, Payload};

/// Timeout for the initial broker connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between reconnect attempts after the event loop errors
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Connection to an MQTT broker carrying Meshtastic traffic
#[derive(Debug)]
pub struct MqttConnection {
    config: MqttConfig,
    registry: Arc<NodeRegistry>,
    connected: Arc<AtomicBool>,
    state: ConnectionState,
    receiver: Option<mpsc::Receiver<Packet>>,
    client: Option<AsyncClient>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl MqttConnection {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            registry: Arc::new(NodeRegistry::default()),
            connected: Arc::new(AtomicBool::new(false)),
            state: ConnectionState::Idle,
            receiver: None,
            client: None,
            cancel: None,
            task: None,
        }
    }
}

/// Split a broker URL like `tcp://host:1883` into host and port
fn parse_broker(broker: &str) -> (String, u16) {
    let stripped = broker
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(broker);
    match stripped.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse().unwrap_or(1883),
        ),
        None => (stripped.to_string(), 1883),
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn connect(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        info!(broker = %self.config.broker, topic = %self.config.topic, "connecting to MQTT broker");

        let client_id = if self.config.client_id.is_empty() {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            format!("meshrelay-{nanos}")
        } else {
            self.config.client_id.clone()
        };

        let (host, port) = parse_broker(&self.config.broker);
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // Wait for the broker's ConnAck before declaring success
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                self.state = ConnectionState::Idle;
                return Err(RelayError::Cancelled);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            match timeout(remaining, event_loop.poll()).await {
                Ok(Ok(Event::Incoming(MqttPacket::ConnAck(_)))) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    self.state = ConnectionState::Idle;
                    return Err(RelayError::ConnectFailed {
                        endpoint: self.config.broker.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(_elapsed) => {
                    self.state = ConnectionState::Idle;
                    return Err(RelayError::ConnectTimeout(self.config.broker.clone()));
                }
            }
        }

        client
            .subscribe(&self.config.topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| RelayError::ConnectFailed {
                endpoint: self.config.broker.clone(),
                reason: e.to_string(),
            })?;
        info!(topic = %self.config.topic, "subscribed to topic");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = cancel.child_token();
        self.connected.store(true, Ordering::SeqCst);

        self.task = Some(tokio::spawn(event_loop_task(
            event_loop,
            client.clone(),
            self.config.topic.clone(),
            tx,
            self.connected.clone(),
            token.clone(),
        )));
        self.client = Some(client);
        self.cancel = Some(token);
        self.receiver = Some(rx);
        self.state = ConnectionState::Connected;

        info!(broker = %self.config.broker, "connected to MQTT broker");
        Ok(())
    }

    fn messages(&mut self) -> Option<mpsc::Receiver<Packet>> {
        self.receiver.take()
    }

    async fn close(&mut self) -> Result<()> {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            self.state = ConnectionState::Closed;
            return Ok(());
        }
        self.state = ConnectionState::Closing;
        debug!(broker = %self.config.broker, "closing MQTT connection");

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.receiver = None;
        self.state = ConnectionState::Closed;

        info!(broker = %self.config.broker, "MQTT connection closed");
        Ok(())
    }

    fn name(&self) -> String {
        format!("mqtt:{}", self.config.broker)
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.connected.load(Ordering::SeqCst)
    }

    fn node_info(&self, node_num: u32) -> Option<NodeInfo> {
        self.registry.snapshot(node_num)
    }
}

async fn event_loop_task(
    mut event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    topic: String,
    tx: mpsc::Sender<Packet>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    debug!("MQTT event loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("MQTT event loop stopped: cancelled");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(MqttPacket::ConnAck(_))) => {
                    info!("MQTT reconnected, resubscribing");
                    connected.store(true, Ordering::SeqCst);
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        warn!(error = %e, "failed to resubscribe");
                    }
                }
                Ok(Event::Incoming(MqttPacket::Publish(publish))) => {
                    debug!(topic = %publish.topic, size = publish.payload.len(), "received MQTT message");
                    if let Some(packet) = parse_message(&publish.topic, &publish.payload) {
                        stream::publish(&tx, packet);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection lost");
                    connected.store(false, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_INTERVAL) => {}
                    }
                }
            }
        }
    }
}

/// JSON schema some MQTT gateways publish; field names as observed in the
/// wild, not documented upstream
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonEnvelope {
    from: u32,
    to: u32,
    channel: u32,
    #[serde(rename = "type")]
    kind: String,
    payload: serde_json::Value,
    id: u32,
    #[serde(rename = "rxTime")]
    rx_time: i64,
    #[serde(rename = "rxSnr")]
    rx_snr: f32,
    #[serde(rename = "rxRssi")]
    rx_rssi: i32,
    #[serde(rename = "hopLimit")]
    hop_limit: u32,
}

/// Map one MQTT message into a packet, trying JSON, protobuf, then raw text
fn parse_message(topic: &str, payload: &[u8]) -> Option<Packet> {
    if let Ok(envelope) = serde_json::from_slice::<JsonEnvelope>(payload) {
        if envelope.from != 0 {
            return Some(packet_from_json(envelope, topic));
        }
    }

    if let Ok(fr) = proto::FromRadio::decode(payload) {
        if fr.packet.is_some() {
            if let Some(packet) = Packet::from_radio(&fr) {
                return Some(packet);
            }
        }
    }

    // Raw text fallback; sender scavenged from a !xxxxxxxx topic segment
    let from = topic
        .split('/')
        .find_map(|segment| {
            segment
                .strip_prefix('!')
                .filter(|hex| hex.len() == 8)
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        })
        .unwrap_or(0);

    Some(Packet {
        id: 0,
        from,
        to: 0,
        channel: 0,
        port_num: PortNum::TextMessage,
        payload: Payload::Text {
            text: String::from_utf8_lossy(payload).into_owned(),
        },
        raw_payload: None,
        snr: 0.0,
        rssi: 0,
        hop_limit: 0,
        want_ack: false,
        received_at: Utc::now(),
        from_node: None,
    })
}

fn packet_from_json(envelope: JsonEnvelope, topic: &str) -> Packet {
    let received_at = if envelope.rx_time > 0 {
        Utc.timestamp_opt(envelope.rx_time, 0)
            .single()
            .unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    };

    let port_num = parse_port_num(&envelope.kind, topic);
    let payload = match (&port_num, &envelope.payload) {
        (PortNum::TextMessage, serde_json::Value::String(text)) => Payload::Text {
            text: text.clone(),
        },
        (_, serde_json::Value::Null) => Payload::Raw(Vec::new()),
        (_, value) => Payload::Raw(serde_json::to_vec(value).unwrap_or_default()),
    };

    Packet {
        id: envelope.id,
        from: envelope.from,
        to: envelope.to,
        channel: envelope.channel,
        port_num,
        payload,
        raw_payload: None,
        snr: envelope.rx_snr,
        rssi: envelope.rx_rssi,
        hop_limit: envelope.hop_limit,
        want_ack: false,
        received_at,
        from_node: None,
    }
}

const PORT_KEYS: &[(&str, PortNum)] = &[
    ("TEXT_MESSAGE_APP", PortNum::TextMessage),
    ("TEXT", PortNum::TextMessage),
    ("POSITION_APP", PortNum::Position),
    ("POSITION", PortNum::Position),
    ("NODEINFO_APP", PortNum::NodeInfo),
    ("NODEINFO", PortNum::NodeInfo),
    ("TELEMETRY_APP", PortNum::Telemetry),
    ("TELEMETRY", PortNum::Telemetry),
    ("ROUTING_APP", PortNum::Routing),
    ("ROUTING", PortNum::Routing),
    ("TRACEROUTE_APP", PortNum::Traceroute),
    ("TRACEROUTE", PortNum::Traceroute),
    ("NEIGHBORINFO_APP", PortNum::NeighborInfo),
    ("NEIGHBORINFO", PortNum::NeighborInfo),
];

/// Resolve a port from the JSON `type` string, falling back to a
/// case-insensitive search of the topic
fn parse_port_num(kind: &str, topic: &str) -> PortNum {
    let kind = kind.to_uppercase();
    for (key, port) in PORT_KEYS {
        if kind == *key {
            return *port;
        }
    }

    let topic = topic.to_uppercase();
    for (key, port) in PORT_KEYS {
        if topic.contains(key) {
            return *port;
        }
    }

    PortNum::Unknown
}
