//! Internal packet model
//!
//! The decoded, sink-facing representation of one radio message. The wire
//! structs in `meshrelay-proto` mirror the protobuf schema; this model is
//! what filters see and what sinks serialize. Payloads are a proper sum type
//! instead of opaque bytes, and timestamps are wall-clock `DateTime<Utc>`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use meshrelay_proto::{proto, PortNum};

/// One decoded Meshtastic packet, ready for filtering and fan-out
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
    /// Unique packet identifier
    pub id: u32,
    /// Sender node number
    pub from: u32,
    /// Recipient node number; `0xFFFFFFFF` is broadcast
    pub to: u32,
    /// Channel index
    pub channel: u32,
    /// Application port of the payload
    pub port_num: PortNum,
    /// Decoded payload
    pub payload: Payload,
    /// Raw payload bytes, when the packet carried a decoded Data message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<Vec<u8>>,
    /// Signal-to-noise ratio in dB
    pub snr: f32,
    /// Received signal strength in dBm
    pub rssi: i32,
    /// Remaining hop count
    pub hop_limit: u32,
    /// Whether the sender requested an acknowledgement
    pub want_ack: bool,
    /// When the packet was received (radio rx_time when reported, otherwise
    /// ingest wall clock)
    pub received_at: DateTime<Utc>,
    /// Snapshot of the sender's node record at receive time, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_node: Option<NodeInfo>,
}

/// Decoded payload variants
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text { text: String },
    Position(Position),
    Raw(Vec<u8>),
}

impl Payload {
    /// Best-effort single-line rendering for text-format sinks
    pub fn display(&self) -> String {
        match self {
            Payload::Text { text } => text.clone(),
            Payload::Position(p) => {
                format!("{:.5},{:.5} alt {}m", p.latitude, p.longitude, p.altitude)
            }
            Payload::Raw(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// The text payload, if this is a text message
    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Snapshot of a mesh peer
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub num: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    pub last_heard: DateTime<Utc>,
    pub snr: f32,
}

/// User record of a mesh peer
#[derive(Debug, Clone, Serialize)]
pub struct User {
    /// Hex node id, `!` followed by eight hex digits
    pub id: String,
    pub long_name: String,
    /// Short display name, at most four characters
    pub short_name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub hw_model: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Position in degrees
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    pub time: DateTime<Utc>,
}

fn timestamp(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

impl Position {
    fn from_proto(p: &proto::Position) -> Self {
        Self {
            latitude: p.latitude(),
            longitude: p.longitude(),
            altitude: p.altitude,
            time: timestamp(p.time),
        }
    }
}

impl User {
    fn from_proto(u: &proto::User) -> Self {
        Self {
            id: u.id.clone(),
            long_name: u.long_name.clone(),
            short_name: u.short_name.clone(),
            hw_model: u.hw_model,
        }
    }
}

impl NodeInfo {
    /// Clone a wire-level node record into a snapshot. The snapshot owns its
    /// data so packet lifetimes never reach back into a connection's cache.
    pub fn from_proto(n: &proto::NodeInfo) -> Self {
        Self {
            num: n.num,
            user: n.user.as_ref().map(User::from_proto),
            position: n.position.as_ref().map(Position::from_proto),
            last_heard: timestamp(n.last_heard),
            snr: n.snr,
        }
    }

    /// Display name for notifications: long name, then short name, then
    /// `!`-prefixed hex id
    pub fn display_name(&self) -> String {
        if let Some(user) = &self.user {
            if !user.long_name.is_empty() {
                return user.long_name.clone();
            }
            if !user.short_name.is_empty() {
                return user.short_name.clone();
            }
        }
        format!("!{:08x}", self.num)
    }
}

impl Packet {
    /// Convert a decoded FromRadio envelope into the internal form.
    ///
    /// Returns `None` when the envelope carries no mesh packet. Text payloads
    /// become `Payload::Text`, position payloads are decoded a second time as
    /// a Position message, and everything else stays raw.
    pub fn from_radio(fr: &proto::FromRadio) -> Option<Packet> {
        let mp = fr.packet.as_ref()?;

        let received_at = if mp.rx_time > 0 {
            timestamp(mp.rx_time)
        } else {
            Utc::now()
        };

        let (port_num, payload, raw_payload) = match &mp.decoded {
            Some(data) => {
                let payload = match data.port_num {
                    PortNum::TextMessage => Payload::Text {
                        text: String::from_utf8_lossy(&data.payload).into_owned(),
                    },
                    PortNum::Position => match proto::Position::decode(&data.payload) {
                        Ok(p) => Payload::Position(Position::from_proto(&p)),
                        Err(_) => Payload::Raw(data.payload.clone()),
                    },
                    _ => Payload::Raw(data.payload.clone()),
                };
                (data.port_num, payload, Some(data.payload.clone()))
            }
            None => (PortNum::Unknown, Payload::Raw(Vec::new()), None),
        };

        Some(Packet {
            id: mp.id,
            from: mp.from,
            to: mp.to,
            channel: mp.channel,
            port_num,
            payload,
            raw_payload,
            snr: mp.rx_snr,
            rssi: mp.rx_rssi,
            hop_limit: mp.hop_limit,
            want_ack: mp.want_ack,
            received_at,
            from_node: None,
        })
    }

    /// Sender short name when known, otherwise the `!`-prefixed hex id
    pub fn sender_label(&self) -> String {
        self.from_node
            .as_ref()
            .and_then(|n| n.user.as_ref())
            .map(|u| u.short_name.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("!{:08x}", self.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrelay_proto::{encode, proto::FromRadio, BROADCAST_ADDR};

    fn text_envelope(from: u32, text: &str) -> FromRadio {
        let data = encode::data(1, text.as_bytes());
        let packet = encode::mesh_packet(
            from,
            BROADCAST_ADDR,
            0,
            42,
            &data,
            1_700_000_000,
            8.0,
            -72,
            3,
        );
        let msg = encode::from_radio(1, &packet, &[], &[], 0);
        FromRadio::decode(&msg).unwrap()
    }

    #[test]
    fn test_text_payload_specialization() {
        let fr = text_envelope(0xAABBCCDD, "Hello World");
        let packet = Packet::from_radio(&fr).unwrap();

        assert_eq!(packet.from, 0xAABBCCDD);
        assert_eq!(packet.port_num, PortNum::TextMessage);
        assert_eq!(packet.payload.text(), Some("Hello World"));
        assert_eq!(packet.raw_payload.as_deref(), Some(b"Hello World".as_ref()));
    }

    #[test]
    fn test_position_payload_specialization() {
        let position = encode::position(377_749_000, -1_224_194_000, 30, 1_700_000_000);
        let data = encode::data(3, &position);
        let packet = encode::mesh_packet(1, BROADCAST_ADDR, 0, 7, &data, 0, 0.0, 0, 3);
        let msg = encode::from_radio(1, &packet, &[], &[], 0);
        let fr = FromRadio::decode(&msg).unwrap();

        let packet = Packet::from_radio(&fr).unwrap();
        assert_eq!(packet.port_num, PortNum::Position);
        match &packet.payload {
            Payload::Position(p) => {
                assert!((p.latitude - 37.7749).abs() < 1e-6);
                assert!((p.longitude - -122.4194).abs() < 1e-6);
                assert_eq!(p.altitude, 30);
            }
            other => panic!("expected position payload, got {other:?}"),
        }
    }

    #[test]
    fn test_rx_time_becomes_received_at() {
        let fr = text_envelope(1, "hi");
        let packet = Packet::from_radio(&fr).unwrap();
        assert_eq!(packet.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_received_at_defaults_to_now() {
        let data = encode::data(1, b"x");
        let mesh = encode::mesh_packet(1, 2, 0, 1, &data, 0, 0.0, 0, 3);
        let msg = encode::from_radio(1, &mesh, &[], &[], 0);
        let fr = FromRadio::decode(&msg).unwrap();

        let before = Utc::now();
        let packet = Packet::from_radio(&fr).unwrap();
        assert!(packet.received_at >= before);
    }

    #[test]
    fn test_no_packet_yields_none() {
        let msg = encode::from_radio(1, &[], &[], &[], 5);
        let fr = FromRadio::decode(&msg).unwrap();
        assert!(Packet::from_radio(&fr).is_none());
    }

    #[test]
    fn test_json_shape() {
        let fr = text_envelope(0xAABBCCDD, "json check");
        let packet = Packet::from_radio(&fr).unwrap();
        let value = serde_json::to_value(&packet).unwrap();

        assert_eq!(value["id"], 42);
        assert_eq!(value["from"], 0xAABBCCDDu32);
        assert_eq!(value["port_num"], 1);
        assert_eq!(value["payload"]["text"], "json check");
        assert_eq!(value["hop_limit"], 3);
        // RFC 3339 timestamp string
        assert!(value["received_at"].as_str().unwrap().starts_with("2023-11-14T"));
        assert!(value.get("from_node").is_none());
    }

    #[test]
    fn test_sender_label_prefers_short_name() {
        let fr = text_envelope(0xAABBCCDD, "x");
        let mut packet = Packet::from_radio(&fr).unwrap();
        assert_eq!(packet.sender_label(), "!aabbccdd");

        packet.from_node = Some(NodeInfo {
            num: 0xAABBCCDD,
            user: Some(User {
                id: "!aabbccdd".to_string(),
                long_name: "Remote Node 1".to_string(),
                short_name: "REM1".to_string(),
                hw_model: 9,
            }),
            position: None,
            last_heard: Utc::now(),
            snr: 5.0,
        });
        assert_eq!(packet.sender_label(), "REM1");
    }

    #[test]
    fn test_display_name_fallback_chain() {
        let mut node = NodeInfo {
            num: 0x01020304,
            user: None,
            position: None,
            last_heard: Utc::now(),
            snr: 0.0,
        };
        assert_eq!(node.display_name(), "!01020304");

        node.user = Some(User {
            id: "!01020304".to_string(),
            long_name: String::new(),
            short_name: "NODE".to_string(),
            hw_model: 0,
        });
        assert_eq!(node.display_name(), "NODE");

        node.user.as_mut().unwrap().long_name = "Full Name".to_string();
        assert_eq!(node.display_name(), "Full Name");
    }
}
