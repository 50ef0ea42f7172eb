//! Connection drivers for the Meshtastic node
//!
//! Three transports present one uniform source of decoded packets: a serial
//! port, a TCP socket, or an MQTT broker. Each driver owns a bounded channel
//! of capacity [`CHANNEL_CAPACITY`]; when the relay falls behind, new packets
//! are dropped with a warning rather than back-pressuring the transport read
//! loop. The channel closes exactly once, when the connection closes.
//!
//! Stream transports (serial, TCP) additionally maintain a per-connection
//! node database populated from the initial config exchange, used to decorate
//! outgoing packets with a snapshot of the sender's identity.

mod mqtt;
mod serial;
mod stream;
mod tcp;

pub use mqtt::MqttConnection;
pub use serial::SerialConnection;
pub use tcp::TcpConnection;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{RelayError, Result};
use crate::message::{NodeInfo, Packet};

/// Bounded capacity of every driver's messages channel
pub const CHANNEL_CAPACITY: usize = 100;

/// Lifecycle state of a connection driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Uniform contract over the three transport drivers
#[async_trait]
pub trait Connection: Send + std::fmt::Debug {
    /// Open the transport and start the read loop. Re-connecting an already
    /// connected driver is a no-op.
    async fn connect(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Take the receive half of the messages channel. Returns `None` after
    /// the first call.
    fn messages(&mut self) -> Option<mpsc::Receiver<Packet>>;

    /// Transmit a packet to the mesh. The relay is a one-way ingest path,
    /// so no current driver implements outbound delivery.
    async fn send(&mut self, packet: &Packet) -> Result<()> {
        let _ = packet;
        Err(RelayError::WriteError("send not implemented".to_string()))
    }

    /// Close the transport and the messages channel. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Human-readable connection identifier for logs
    fn name(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Look up a cached node record, if this transport maintains one
    fn node_info(&self, node_num: u32) -> Option<NodeInfo> {
        let _ = node_num;
        None
    }
}

/// Construct the driver selected by `connection.type`
pub fn build(config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
    match config.kind.as_str() {
        "serial" => Ok(Box::new(SerialConnection::new(config.serial.clone()))),
        "tcp" => Ok(Box::new(TcpConnection::new(config.tcp.clone()))),
        "mqtt" => Ok(Box::new(MqttConnection::new(config.mqtt.clone()))),
        other => Err(RelayError::InvalidConfig(format!(
            "invalid connection.type: {other} (must be serial, tcp, or mqtt)"
        ))),
    }
}
