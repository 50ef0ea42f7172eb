//! Shared read loop for stream transports
//!
//! Serial and TCP speak the identical framed protocol, so both drivers hand
//! their transport to this loop. It requests the device's config after a
//! short settle delay, then decodes FromRadio frames until cancellation or
//! stream close, maintaining the node database and publishing packets to the
//! bounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use meshrelay_proto::{proto, ProtoError, StreamFramer, WANT_CONFIG_REQUEST};

use crate::message::{NodeInfo, Packet};

/// Delay before the initial WantConfig request, letting the port settle
const WANT_CONFIG_DELAY: Duration = Duration::from_millis(500);

/// Per-connection cache of mesh state learned from the config exchange
#[derive(Debug, Default)]
pub(crate) struct NodeRegistry {
    nodes: RwLock<HashMap<u32, proto::NodeInfo>>,
    my_info: RwLock<Option<proto::MyNodeInfo>>,
    config_complete: AtomicBool,
}

impl NodeRegistry {
    pub(crate) fn snapshot(&self, node_num: u32) -> Option<NodeInfo> {
        self.nodes.read().get(&node_num).map(NodeInfo::from_proto)
    }

    pub(crate) fn my_node_num(&self) -> Option<u32> {
        self.my_info.read().as_ref().map(|i| i.my_node_num)
    }

    pub(crate) fn config_complete(&self) -> bool {
        self.config_complete.load(Ordering::SeqCst)
    }
}

/// Drive a framed stream until cancellation or stream close.
///
/// Dropping the `tx` sender on return is what closes the messages channel.
pub(crate) async fn run<T>(
    mut framer: StreamFramer<T>,
    registry: Arc<NodeRegistry>,
    tx: mpsc::Sender<Packet>,
    cancel: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    debug!("read loop started");
    let started = Instant::now();
    let mut want_config_sent = false;

    loop {
        if cancel.is_cancelled() {
            debug!("read loop stopped: cancelled");
            break;
        }

        if !want_config_sent && started.elapsed() >= WANT_CONFIG_DELAY {
            debug!("requesting initial configuration");
            if let Err(e) = framer.write_packet(WANT_CONFIG_REQUEST).await {
                warn!(error = %e, "failed to request config");
            }
            want_config_sent = true;
        }

        // The framer's internal timeout bounds this await, so cancellation is
        // observed at least every poll interval
        match framer.read_packet().await {
            Ok(payload) => handle_frame(&payload, &registry, &tx),
            Err(e) if e.is_resumable() => continue,
            Err(ProtoError::InvalidMagic) | Err(ProtoError::PacketTooLarge(_)) => {
                debug!("framing error, discarding");
                continue;
            }
            Err(ProtoError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("read loop stopped: stream closed");
                break;
            }
            Err(e) => {
                debug!(error = %e, "error reading packet");
                continue;
            }
        }
    }
}

fn handle_frame(payload: &[u8], registry: &NodeRegistry, tx: &mpsc::Sender<Packet>) {
    let fr = match proto::FromRadio::decode(payload) {
        Ok(fr) => fr,
        Err(e) => {
            debug!(error = %e, "error parsing FromRadio");
            return;
        }
    };

    if let Some(my_info) = &fr.my_info {
        info!(node_num = my_info.my_node_num, "received MyInfo");
        *registry.my_info.write() = Some(my_info.clone());
    }

    if let Some(node_info) = &fr.node_info {
        let name = node_info
            .user
            .as_ref()
            .map(|u| u.long_name.as_str())
            .unwrap_or("");
        debug!(num = node_info.num, name, "received NodeInfo");
        registry.nodes.write().insert(node_info.num, node_info.clone());
    }

    if fr.config_complete_id != 0 {
        info!(id = fr.config_complete_id, "config complete");
        registry.config_complete.store(true, Ordering::SeqCst);
    }

    if fr.packet.is_some() {
        if let Some(mut packet) = Packet::from_radio(&fr) {
            packet.from_node = registry.snapshot(packet.from);
            debug!(
                from = packet.from,
                to = packet.to,
                port = %packet.port_num,
                "received packet"
            );
            publish(tx, packet);
        }
    }
}

/// Non-blocking publish implementing the drop-on-full backpressure policy.
/// A full channel is a transport-level event; the dropped packet is not
/// counted in relay statistics.
pub(crate) fn publish(tx: &mpsc::Sender<Packet>, packet: Packet) {
    match tx.try_send(packet) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("message channel full, dropping packet");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CHANNEL_CAPACITY;
    use chrono::Utc;
    use meshrelay_proto::encode;

    fn test_packet(id: u32) -> Packet {
        Packet {
            id,
            from: 1,
            to: 2,
            channel: 0,
            port_num: meshrelay_proto::PortNum::TextMessage,
            payload: crate::message::Payload::Text {
                text: format!("packet {id}"),
            },
            raw_payload: None,
            snr: 0.0,
            rssi: 0,
            hop_limit: 3,
            want_ack: false,
            received_at: Utc::now(),
            from_node: None,
        }
    }

    #[tokio::test]
    async fn test_publish_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Publish well past capacity with no consumer running
        for i in 0..(CHANNEL_CAPACITY as u32 + 50) {
            publish(&tx, test_packet(i));
        }
        drop(tx);

        let mut delivered = Vec::new();
        while let Some(packet) = rx.recv().await {
            delivered.push(packet.id);
        }

        // Exactly the first CHANNEL_CAPACITY packets survive, in order
        assert_eq!(delivered.len(), CHANNEL_CAPACITY);
        assert_eq!(delivered[0], 0);
        assert_eq!(delivered[CHANNEL_CAPACITY - 1], CHANNEL_CAPACITY as u32 - 1);
    }

    #[tokio::test]
    async fn test_handle_frame_populates_registry() {
        let registry = NodeRegistry::default();
        let (tx, _rx) = mpsc::channel(4);

        let my_info = encode::my_node_info(0x12345678, 3);
        let frame = encode::from_radio(1, &[], &my_info, &[], 0);
        handle_frame(&frame, &registry, &tx);
        assert_eq!(registry.my_node_num(), Some(0x12345678));

        let user = encode::user("!aabbccdd", "Remote Node 1", "REM1", 9);
        let node_info = encode::node_info(0xAABBCCDD, &user, &[], 5.0, 0);
        let frame = encode::from_radio(2, &[], &[], &node_info, 0);
        handle_frame(&frame, &registry, &tx);

        let snapshot = registry.snapshot(0xAABBCCDD).unwrap();
        assert_eq!(snapshot.num, 0xAABBCCDD);
        assert_eq!(snapshot.user.unwrap().short_name, "REM1");

        assert!(!registry.config_complete());
        let frame = encode::from_radio(3, &[], &[], &[], 42);
        handle_frame(&frame, &registry, &tx);
        assert!(registry.config_complete());
    }

    #[tokio::test]
    async fn test_handle_frame_attaches_node_snapshot() {
        let registry = NodeRegistry::default();
        let (tx, mut rx) = mpsc::channel(4);

        let user = encode::user("!aabbccdd", "Remote Node 1", "REM1", 9);
        let node_info = encode::node_info(0xAABBCCDD, &user, &[], 5.0, 0);
        let frame = encode::from_radio(1, &[], &[], &node_info, 0);
        handle_frame(&frame, &registry, &tx);

        let data = encode::data(1, b"hello");
        let mesh = encode::mesh_packet(0xAABBCCDD, 0xFFFFFFFF, 0, 9, &data, 0, 4.0, -70, 3);
        let frame = encode::from_radio(2, &mesh, &[], &[], 0);
        handle_frame(&frame, &registry, &tx);

        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.from, 0xAABBCCDD);
        let node = packet.from_node.expect("snapshot missing");
        assert_eq!(node.user.unwrap().long_name, "Remote Node 1");
    }

    #[tokio::test]
    async fn test_handle_frame_ignores_garbage() {
        let registry = NodeRegistry::default();
        let (tx, mut rx) = mpsc::channel(4);
        handle_frame(&[0xFF, 0xFF, 0xFF], &registry, &tx);
        assert!(rx.try_recv().is_err());
    }
}
