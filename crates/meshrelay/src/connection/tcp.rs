//! TCP connection driver
//!
//! Some Meshtastic devices expose the stream protocol on a network socket,
//! by convention port 4403. After the dial, this is byte-for-byte the same
//! protocol as serial and shares its read loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use meshrelay_proto::StreamFramer;

use crate::config::TcpConfig;
use crate::connection::stream::{self, NodeRegistry};
use crate::connection::{Connection, ConnectionState, CHANNEL_CAPACITY};
use crate::error::{RelayError, Result};
use crate::message::{NodeInfo, Packet};

/// Dial timeout for the initial connect
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection to a Meshtastic device over TCP
#[derive(Debug)]
pub struct TcpConnection {
    config: TcpConfig,
    registry: Arc<NodeRegistry>,
    state: ConnectionState,
    receiver: Option<mpsc::Receiver<Packet>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl TcpConnection {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            registry: Arc::new(NodeRegistry::default()),
            state: ConnectionState::Idle,
            receiver: None,
            cancel: None,
            task: None,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn connect(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        let addr = self.address();
        info!(address = %addr, "connecting to TCP endpoint");

        let dial = async {
            match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(RelayError::ConnectFailed {
                    endpoint: addr.clone(),
                    reason: e.to_string(),
                }),
                Err(_elapsed) => Err(RelayError::ConnectTimeout(addr.clone())),
            }
        };

        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                self.state = ConnectionState::Idle;
                return Err(RelayError::Cancelled);
            }
            result = dial => match result {
                Ok(stream) => stream,
                Err(e) => {
                    self.state = ConnectionState::Idle;
                    return Err(e);
                }
            },
        };

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

        info!(address = %addr, "connected to TCP endpoint");
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
        debug!(address = %self.address(), "closing TCP connection");

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.receiver = None;
        self.state = ConnectionState::Closed;

        info!(address = %self.address(), "TCP connection closed");
        Ok(())
    }

    fn name(&self) -> String {
        format!("tcp:{}", self.address())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn node_info(&self, node_num: u32) -> Option<NodeInfo> {
        self.registry.snapshot(node_num)
    }
}
