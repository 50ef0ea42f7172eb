//! Simulated Meshtastic device
//!
//! Serves the radio end of the stream protocol on a PTY master. A serial
//! consumer opens the reported slave path, sends a WantConfig request, and
//! receives the same config exchange a real node performs: MyNodeInfo, a
//! NodeInfo per known node, then ConfigCompleteId. With a message interval
//! configured, the device also broadcasts text messages from random simulated
//! peers, which makes it useful for exercising the whole relay pipeline
//! without hardware.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::encode;
use crate::error::{ProtoError, Result};
use crate::framing::{self, StreamFramer};
use crate::proto::{PortNum, ToRadio, BROADCAST_ADDR};

use super::pty::{self, PtyStream};

/// Read timeout for the master loop; long enough to stay quiet, short enough
/// to notice cancellation
const MASTER_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Text messages the auto-sender picks from
const MESSAGES: &[&str] = &[
    "Hello from the mesh!",
    "Testing 1 2 3",
    "Meshtastic is awesome!",
    "Anyone copy?",
    "Good morning mesh!",
    "Signal check",
    "Weather is nice today",
    "73s de simulated node",
];

/// A peer node the simulator reports during the config exchange
#[derive(Debug, Clone)]
pub struct SimulatedNode {
    pub node_num: u32,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
}

/// Configuration for the simulated device
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// This device's node number
    pub node_num: u32,
    pub long_name: String,
    /// Short display name, four characters
    pub short_name: String,
    pub hw_model: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    /// Other nodes reported in the config exchange
    pub simulated_nodes: Vec<SimulatedNode>,
    /// Interval between auto-generated broadcasts; zero disables them
    pub message_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            node_num: 0x12345678,
            long_name: "Simulated Node".to_string(),
            short_name: "SIM1".to_string(),
            hw_model: 9, // TBEAM
            latitude: 37.7749,
            longitude: -122.4194,
            altitude: 10,
            simulated_nodes: vec![
                SimulatedNode {
                    node_num: 0xAABBCCDD,
                    long_name: "Remote Node 1".to_string(),
                    short_name: "REM1".to_string(),
                    hw_model: 9,
                    latitude: 37.7849,
                    longitude: -122.4094,
                    altitude: 20,
                },
                SimulatedNode {
                    node_num: 0x11223344,
                    long_name: "Remote Node 2".to_string(),
                    short_name: "REM2".to_string(),
                    hw_model: 14, // HELTEC
                    latitude: 37.7649,
                    longitude: -122.4294,
                    altitude: 15,
                },
            ],
            message_interval: Duration::from_secs(30),
        }
    }
}

impl DeviceConfig {
    /// Defaults with auto-messages disabled, the usual test setup
    pub fn for_tests() -> Self {
        Self {
            message_interval: Duration::ZERO,
            ..Self::default()
        }
    }
}

struct DeviceState {
    config: DeviceConfig,
    writer: Mutex<Option<PtyStream>>,
    packet_id: AtomicU32,
    config_sent: AtomicBool,
}

/// Simulated Meshtastic device bound to a PTY
pub struct Device {
    state: Arc<DeviceState>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    slave_path: Option<PathBuf>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        let packet_id = rand::thread_rng().gen_range(0..10_000);
        Self {
            state: Arc::new(DeviceState {
                config,
                writer: Mutex::new(None),
                packet_id: AtomicU32::new(packet_id),
                config_sent: AtomicBool::new(false),
            }),
            cancel: None,
            tasks: Vec::new(),
            slave_path: None,
        }
    }

    /// Start serving the protocol; returns the slave path to connect to.
    /// Starting an already-running device just returns the existing path.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<PathBuf> {
        if let Some(path) = &self.slave_path {
            return Ok(path.clone());
        }

        let (master, slave_path) = pty::open()?;
        let writer = master.try_clone().map_err(ProtoError::Io)?;
        *self.state.writer.lock().await = Some(writer);
        self.state.config_sent.store(false, Ordering::SeqCst);

        let framer = StreamFramer::new(master).with_read_timeout(MASTER_READ_TIMEOUT);
        let token = cancel.child_token();

        self.tasks.push(tokio::spawn(read_loop(
            self.state.clone(),
            framer,
            token.clone(),
        )));

        if !self.state.config.message_interval.is_zero() {
            self.tasks.push(tokio::spawn(message_loop(
                self.state.clone(),
                self.state.config.message_interval,
                token.clone(),
            )));
        }

        debug!(path = %slave_path.display(), "simulated device started");
        self.cancel = Some(token);
        self.slave_path = Some(slave_path.clone());
        Ok(slave_path)
    }

    /// Stop the device and release the PTY. Safe to call twice.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.writer.lock().await = None;
        self.slave_path = None;
        debug!("simulated device stopped");
    }

    /// Slave path while running
    pub fn path(&self) -> Option<&PathBuf> {
        self.slave_path.as_ref()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.state.config
    }

    /// Broadcast a text message on behalf of a simulated node
    pub async fn send_text_message(&self, from_node: u32, text: &str) -> Result<()> {
        self.state.send_text(from_node, text).await
    }

    /// Broadcast a position update on behalf of a simulated node
    pub async fn send_position(&self, from_node: u32, lat: f64, lon: f64, alt: i32) -> Result<()> {
        self.state.send_position(from_node, lat, lon, alt).await
    }

    /// Wait until the config exchange has run, polling until the deadline
    pub async fn wait_for_config(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state.config_sent.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl DeviceState {
    fn next_packet_id(&self) -> u32 {
        self.packet_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn write_from_radio(
        &self,
        packet: &[u8],
        my_info: &[u8],
        node_info: &[u8],
        config_complete_id: u32,
    ) -> Result<()> {
        let id = self.next_packet_id();
        let msg = encode::from_radio(id, packet, my_info, node_info, config_complete_id);
        let framed = framing::frame(&msg)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtoError::DeviceNotRunning)?;
        writer.write_all(&framed).await?;
        Ok(())
    }

    /// Run the config exchange once per session
    async fn send_config(&self, config_id: u32) {
        if self.config_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = config_id, "sending device configuration");

        let now = unix_now();
        let cfg = &self.config;

        let my_info = encode::my_node_info(cfg.node_num, 1);

        let own_user = encode::user(
            &format!("!{:08x}", cfg.node_num),
            &cfg.long_name,
            &cfg.short_name,
            cfg.hw_model,
        );
        let own_position = encode::position(
            (cfg.latitude * 1e7) as i32,
            (cfg.longitude * 1e7) as i32,
            cfg.altitude,
            now,
        );
        let own_info = encode::node_info(cfg.node_num, &own_user, &own_position, 0.0, now);

        // Pre-encode peers so no RNG is held across an await
        let peers: Vec<Vec<u8>> = {
            let mut rng = rand::thread_rng();
            cfg.simulated_nodes
                .iter()
                .map(|node| {
                    let user = encode::user(
                        &format!("!{:08x}", node.node_num),
                        &node.long_name,
                        &node.short_name,
                        node.hw_model,
                    );
                    let position = encode::position(
                        (node.latitude * 1e7) as i32,
                        (node.longitude * 1e7) as i32,
                        node.altitude,
                        now.saturating_sub(rng.gen_range(0..3600)),
                    );
                    let snr = rng.gen_range(-10..10) as f32;
                    let last_heard = now.saturating_sub(rng.gen_range(0..600));
                    encode::node_info(node.node_num, &user, &position, snr, last_heard)
                })
                .collect()
        };

        if let Err(e) = self.write_from_radio(&[], &my_info, &[], 0).await {
            debug!(error = %e, "failed to send my_info");
            return;
        }
        if let Err(e) = self.write_from_radio(&[], &[], &own_info, 0).await {
            debug!(error = %e, "failed to send own node_info");
        }
        for peer in &peers {
            if let Err(e) = self.write_from_radio(&[], &[], peer, 0).await {
                debug!(error = %e, "failed to send peer node_info");
            }
        }
        if let Err(e) = self.write_from_radio(&[], &[], &[], config_id).await {
            debug!(error = %e, "failed to send config complete");
        }

        debug!("device configuration sent");
    }

    async fn send_text(&self, from_node: u32, text: &str) -> Result<()> {
        let id = self.next_packet_id();
        let (snr, rssi) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-5..15) as f32, -(60 + rng.gen_range(0..40)))
        };
        let data = encode::data(u32::from(PortNum::TextMessage), text.as_bytes());
        let packet = encode::mesh_packet(
            from_node,
            BROADCAST_ADDR,
            0,
            id,
            &data,
            unix_now(),
            snr,
            rssi,
            3,
        );
        self.write_from_radio(&packet, &[], &[], 0).await
    }

    async fn send_position(&self, from_node: u32, lat: f64, lon: f64, alt: i32) -> Result<()> {
        let id = self.next_packet_id();
        let (snr, rssi) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-5..15) as f32, -(60 + rng.gen_range(0..40)))
        };
        let position = encode::position((lat * 1e7) as i32, (lon * 1e7) as i32, alt, unix_now());
        let data = encode::data(u32::from(PortNum::Position), &position);
        let packet = encode::mesh_packet(
            from_node,
            BROADCAST_ADDR,
            0,
            id,
            &data,
            unix_now(),
            snr,
            rssi,
            3,
        );
        self.write_from_radio(&packet, &[], &[], 0).await
    }
}

async fn read_loop(state: Arc<DeviceState>, mut framer: StreamFramer<PtyStream>, cancel: CancellationToken) {
    debug!("simulator read loop started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match framer.read_packet().await {
            Ok(payload) => {
                if let Ok(to_radio) = ToRadio::decode(&payload) {
                    if to_radio.want_config_id > 0 {
                        trace!(id = to_radio.want_config_id, "config request received");
                        state.send_config(to_radio.want_config_id).await;
                    }
                }
            }
            Err(e) if is_expected_read_error(&e) => {
                // EIO until the slave is opened; back off instead of spinning
                if needs_backoff(&e) {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
            Err(e) => {
                trace!(error = %e, "simulator read error");
            }
        }
    }
    debug!("simulator read loop stopped");
}

/// Errors the master loop tolerates silently: timeouts, EAGAIN, and the EIO
/// seen while no slave is open
fn is_expected_read_error(e: &ProtoError) -> bool {
    match e {
        ProtoError::IncompletePacket => true,
        ProtoError::Io(io) => {
            matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::UnexpectedEof
            ) || pty::is_no_slave_error(io)
        }
        _ => false,
    }
}

fn needs_backoff(e: &ProtoError) -> bool {
    match e {
        ProtoError::Io(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof || pty::is_no_slave_error(io)
        }
        _ => false,
    }
}

async fn message_loop(state: Arc<DeviceState>, period: Duration, cancel: CancellationToken) {
    debug!(interval = ?period, "simulator message loop started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some((node_num, short_name, text)) = ({
                    let mut rng = rand::thread_rng();
                    state
                        .config
                        .simulated_nodes
                        .choose(&mut rng)
                        .map(|node| {
                            let text = *MESSAGES.choose(&mut rng).unwrap_or(&MESSAGES[0]);
                            (node.node_num, node.short_name.clone(), text)
                        })
                }) else {
                    continue;
                };

                trace!(from = %short_name, message = text, "sending simulated broadcast");
                if let Err(e) = state.send_text(node_num, text).await {
                    debug!(error = %e, "simulated broadcast failed");
                }
            }
        }
    }
    debug!("simulator message loop stopped");
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt;

    #[test]
    fn test_default_config_nodes() {
        let cfg = DeviceConfig::default();
        assert_eq!(cfg.node_num, 0x12345678);
        assert_eq!(cfg.simulated_nodes.len(), 2);
        assert_eq!(cfg.simulated_nodes[0].node_num, 0xAABBCCDD);
    }

    #[test]
    fn test_for_tests_disables_auto_messages() {
        assert!(DeviceConfig::for_tests().message_interval.is_zero());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let device = Device::new(DeviceConfig::for_tests());
        let err = device.send_text_message(1, "too early").await.unwrap_err();
        assert!(matches!(err, ProtoError::DeviceNotRunning));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let cancel = CancellationToken::new();
        let mut device = Device::new(DeviceConfig::for_tests());
        let first = device.start(&cancel).await.unwrap();
        let second = device.start(&cancel).await.unwrap();
        assert_eq!(first, second);
        device.stop().await;
    }

    #[tokio::test]
    async fn test_config_exchange_on_want_config() {
        let cancel = CancellationToken::new();
        let mut device = Device::new(DeviceConfig::for_tests());
        let path = device.start(&cancel).await.unwrap();

        // Play the host: open the slave and send a framed WantConfig
        let path_clone = path.clone();
        tokio::task::spawn_blocking(move || {
            let mut slave = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(&path_clone)
                .unwrap();
            let framed = framing::frame(crate::proto::WANT_CONFIG_REQUEST).unwrap();
            slave.write_all(&framed).unwrap();
            // Keep the slave open long enough for the device to respond
            std::thread::sleep(Duration::from_millis(500));
        });

        assert!(device.wait_for_config(Duration::from_secs(5)).await);

        // A second request must not replay the exchange
        assert!(device.state.config_sent.load(Ordering::SeqCst));
        device.stop().await;
    }
}
