//! Serial connection driver
//!
//! Opens the configured port at 8-N-1 and runs the shared framed read loop.
//! The short framer timeout doubles as the cancellation poll interval.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use meshrelay_proto::StreamFramer;

use crate::config::SerialConfig;
use crate::connection::stream::{self, NodeRegistry};
use crate::connection::{Connection, ConnectionState, CHANNEL_CAPACITY};
use crate::error::{RelayError, Result};
use crate::message::{NodeInfo, Packet};

/// Connection to a Meshtastic device on a serial port
#[derive(Debug)]
pub struct SerialConnection {
    config: SerialConfig,
    registry: Arc<NodeRegistry>,
    state: ConnectionState,
    receiver: Option<mpsc::Receiver<Packet>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl SerialConnection {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            registry: Arc::new(NodeRegistry::default()),
            state: ConnectionState::Idle,
            receiver: None,
            cancel: None,
            task: None,
        }
    }

    /// True once the device finished its config exchange
    pub fn config_complete(&self) -> bool {
        self.registry.config_complete()
    }

    /// This node's number, once MyInfo has been received
    pub fn my_node_num(&self) -> Option<u32> {
        self.registry.my_node_num()
    }
}

#[async_trait]
impl Connection for SerialConnection {
    async fn connect(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        info!(port = %self.config.port, baud = self.config.baud, "connecting to serial port");

        let stream = tokio_serial::new(&self.config.port, self.config.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Idle;
                RelayError::ConnectFailed {
                    endpoint: self.config.port.clone(),
                    reason: e.to_string(),
                }
            })?;

        let framer = StreamFramer::new(stream);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = cancel.child_token();

        self.task = Some(tokio::spawn(stream::run(
            framer,
            self.registry.clone(),
            tx,
            token.clone(),
        )));
        self.cancel = Some(token);
        self.receiver = Some(rx);
        self.state = ConnectionState::Connected;

        info!(port = %self.config.port, "connected to serial port");
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
        debug!(port = %self.config.port, "closing serial connection");

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        // The task drops the port and the channel sender on exit
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.receiver = None;
        self.state = ConnectionState::Closed;

        info!(port = %self.config.port, "serial connection closed");
        Ok(())
    }

    fn name(&self) -> String {
        format!("serial:{}", self.config.port)
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn node_info(&self, node_num: u32) -> Option<NodeInfo> {
        self.registry.snapshot(node_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_and_initial_state() {
        let conn = SerialConnection::new(SerialConfig::default());
        assert_eq!(conn.name(), "serial:/dev/ttyUSB0");
        assert!(!conn.is_connected());
        assert!(conn.node_info(1).is_none());
    }

    #[tokio::test]
    async fn test_connect_missing_port_fails() {
        let mut conn = SerialConnection::new(SerialConfig {
            port: "/dev/does-not-exist".to_string(),
            baud: 115200,
        });
        let err = conn
            .connect(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ConnectFailed { .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let mut conn = SerialConnection::new(SerialConfig::default());
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!conn.is_connected());
    }
}
