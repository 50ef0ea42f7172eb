//! Meshtastic protobuf messages and partial decoders
//!
//! A hand-rolled decoder for the subset of the Meshtastic protobuf schema the
//! relay consumes. Only the fields listed per message are interpreted; every
//! other field is skipped by wire type, so firmware additions pass through
//! harmlessly.
//!
//! Field numbers follow the upstream `mesh.proto` definitions. Two quirks of
//! the wire encoding are preserved here: `MeshPacket.rx_snr` (field 13) is a
//! fixed-point varint scaled by 4, while `NodeInfo.snr` (field 4) is a plain
//! IEEE-754 float.

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::wire::{FieldReader, FieldValue};

/// Application port number carried in a `Data` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
#[repr(u32)]
pub enum PortNum {
    Unknown = 0,
    TextMessage = 1,
    RemoteHardware = 2,
    Position = 3,
    NodeInfo = 4,
    Routing = 5,
    Admin = 6,
    TextMessageCompressed = 7,
    Waypoint = 8,
    Audio = 9,
    DetectionSensor = 10,
    Reply = 32,
    IpTunnel = 33,
    Paxcounter = 34,
    Serial = 64,
    StoreForward = 65,
    RangeTest = 66,
    Telemetry = 67,
    Zps = 68,
    Simulator = 69,
    Traceroute = 70,
    NeighborInfo = 71,
    AtakPlugin = 72,
    MapReport = 73,
    Private = 256,
    AtakForwarder = 257,
    Max = 511,
}

impl From<u32> for PortNum {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::TextMessage,
            2 => Self::RemoteHardware,
            3 => Self::Position,
            4 => Self::NodeInfo,
            5 => Self::Routing,
            6 => Self::Admin,
            7 => Self::TextMessageCompressed,
            8 => Self::Waypoint,
            9 => Self::Audio,
            10 => Self::DetectionSensor,
            32 => Self::Reply,
            33 => Self::IpTunnel,
            34 => Self::Paxcounter,
            64 => Self::Serial,
            65 => Self::StoreForward,
            66 => Self::RangeTest,
            67 => Self::Telemetry,
            68 => Self::Zps,
            69 => Self::Simulator,
            70 => Self::Traceroute,
            71 => Self::NeighborInfo,
            72 => Self::AtakPlugin,
            73 => Self::MapReport,
            256 => Self::Private,
            257 => Self::AtakForwarder,
            511 => Self::Max,
            _ => Self::Unknown,
        }
    }
}

impl From<PortNum> for u32 {
    fn from(port: PortNum) -> Self {
        port as u32
    }
}

impl PortNum {
    /// Upstream enum name, used by filters and text output
    pub fn name(&self) -> &'static str {
        match self {
            PortNum::TextMessage => "TEXT_MESSAGE_APP",
            PortNum::RemoteHardware => "REMOTE_HARDWARE_APP",
            PortNum::Position => "POSITION_APP",
            PortNum::NodeInfo => "NODEINFO_APP",
            PortNum::Routing => "ROUTING_APP",
            PortNum::Admin => "ADMIN_APP",
            PortNum::TextMessageCompressed => "TEXT_MESSAGE_COMPRESSED_APP",
            PortNum::Waypoint => "WAYPOINT_APP",
            PortNum::Audio => "AUDIO_APP",
            PortNum::DetectionSensor => "DETECTION_SENSOR_APP",
            PortNum::Reply => "REPLY_APP",
            PortNum::IpTunnel => "IP_TUNNEL_APP",
            PortNum::Paxcounter => "PAXCOUNTER_APP",
            PortNum::Serial => "SERIAL_APP",
            PortNum::StoreForward => "STORE_FORWARD_APP",
            PortNum::RangeTest => "RANGE_TEST_APP",
            PortNum::Telemetry => "TELEMETRY_APP",
            PortNum::Zps => "ZPS_APP",
            PortNum::Simulator => "SIMULATOR_APP",
            PortNum::Traceroute => "TRACEROUTE_APP",
            PortNum::NeighborInfo => "NEIGHBORINFO_APP",
            PortNum::AtakPlugin => "ATAK_PLUGIN",
            PortNum::MapReport => "MAP_REPORT_APP",
            PortNum::Private => "PRIVATE_APP",
            PortNum::AtakForwarder => "ATAK_FORWARDER",
            PortNum::Unknown | PortNum::Max => "UNKNOWN_APP",
        }
    }
}

impl std::fmt::Display for PortNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Node number that addresses every node on the mesh
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Top-level message emitted by the radio over the stream
#[derive(Debug, Clone, Default)]
pub struct FromRadio {
    pub id: u32,
    pub packet: Option<MeshPacket>,
    pub my_info: Option<MyNodeInfo>,
    pub node_info: Option<NodeInfo>,
    pub config_complete_id: u32,
    pub rebooted: bool,
    pub xmodem_packet: Vec<u8>,
}

/// One packet heard on the mesh
#[derive(Debug, Clone, Default)]
pub struct MeshPacket {
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub id: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub want_ack: bool,
    pub priority: u32,
    pub decoded: Option<Data>,
    pub encrypted: Vec<u8>,
    pub public_key: Vec<u8>,
    pub pki_encrypted: bool,
}

impl MeshPacket {
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }
}

/// Decoded application payload of a mesh packet
#[derive(Debug, Clone, Default)]
pub struct Data {
    pub port_num: PortNum,
    pub payload: Vec<u8>,
    pub want_response: bool,
    pub dest: u32,
    pub source: u32,
    pub request_id: u32,
    pub reply_id: u32,
    pub emoji: u32,
}

impl Default for PortNum {
    fn default() -> Self {
        PortNum::Unknown
    }
}

/// Identity of the locally attached node
#[derive(Debug, Clone, Default)]
pub struct MyNodeInfo {
    pub my_node_num: u32,
    pub reboot_count: u32,
    pub min_app_version: u32,
}

/// Cached identity of a mesh peer
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub num: u32,
    pub user: Option<User>,
    pub position: Option<Position>,
    pub snr: f32,
    pub last_heard: u32,
    pub channel: u32,
    pub via_mqtt: bool,
    pub hops: u32,
    pub is_favorite: bool,
}

/// User record attached to a node
#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    pub mac: Vec<u8>,
    pub hw_model: u32,
    pub is_licensed: bool,
    pub role: u32,
    pub public_key: Vec<u8>,
}

/// GPS fix, coordinates stored as degrees x 1e7
#[derive(Debug, Clone, Default)]
pub struct Position {
    pub latitude_i: i32,
    pub longitude_i: i32,
    pub altitude: i32,
    pub time: u32,
    pub location_source: u32,
    pub altitude_source: u32,
    pub timestamp: u32,
    pub ground_speed: u32,
    pub ground_track: u32,
    pub sats_in_view: u32,
}

impl Position {
    /// Latitude in degrees
    pub fn latitude(&self) -> f64 {
        self.latitude_i as f64 * 1e-7
    }

    /// Longitude in degrees
    pub fn longitude(&self) -> f64 {
        self.longitude_i as f64 * 1e-7
    }
}

impl FromRadio {
    /// Decode a FromRadio message.
    ///
    /// Fields consumed: 1 id, 2 packet, 3 my_info, 4 node_info,
    /// 8 config_complete_id, 9 rebooted, 11 xmodem_packet.
    pub fn decode(data: &[u8]) -> Result<FromRadio> {
        let mut fr = FromRadio::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Varint(v)) => fr.id = v as u32,
                (2, FieldValue::Bytes(b)) => fr.packet = Some(MeshPacket::decode(b)?),
                (3, FieldValue::Bytes(b)) => fr.my_info = Some(MyNodeInfo::decode(b)?),
                (4, FieldValue::Bytes(b)) => fr.node_info = Some(NodeInfo::decode(b)?),
                (8, FieldValue::Varint(v)) => fr.config_complete_id = v as u32,
                (9, FieldValue::Varint(v)) => fr.rebooted = v != 0,
                (11, FieldValue::Bytes(b)) => fr.xmodem_packet = b.to_vec(),
                _ => {}
            }
        }

        Ok(fr)
    }
}

impl MeshPacket {
    pub fn decode(data: &[u8]) -> Result<MeshPacket> {
        let mut mp = MeshPacket::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Varint(v)) => mp.from = v as u32,
                (2, FieldValue::Varint(v)) => mp.to = v as u32,
                (3, FieldValue::Varint(v)) => mp.channel = v as u32,
                (4, FieldValue::Bytes(b)) => mp.decoded = Some(Data::decode(b)?),
                (5, FieldValue::Bytes(b)) => mp.encrypted = b.to_vec(),
                (6, FieldValue::Varint(v)) => mp.id = v as u32,
                (7, FieldValue::Varint(v)) => mp.rx_time = v as u32,
                (10, FieldValue::Varint(v)) => mp.hop_limit = v as u32,
                (11, FieldValue::Varint(v)) => mp.want_ack = v != 0,
                (12, FieldValue::Varint(v)) => mp.priority = v as u32,
                // Fixed-point SNR, stored as dB x 4
                (13, FieldValue::Varint(v)) => mp.rx_snr = (v as i32) as f32 / 4.0,
                (14, FieldValue::Fixed32(v)) => mp.rx_rssi = v as i32,
                (15, FieldValue::Varint(v)) => mp.hop_start = v as u32,
                (16, FieldValue::Bytes(b)) => mp.public_key = b.to_vec(),
                (17, FieldValue::Varint(v)) => mp.pki_encrypted = v != 0,
                _ => {}
            }
        }

        Ok(mp)
    }
}

impl Data {
    pub fn decode(data: &[u8]) -> Result<Data> {
        let mut d = Data::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Varint(v)) => d.port_num = PortNum::from(v as u32),
                (2, FieldValue::Bytes(b)) => d.payload = b.to_vec(),
                (3, FieldValue::Varint(v)) => d.want_response = v != 0,
                (4, FieldValue::Varint(v)) => d.dest = v as u32,
                (5, FieldValue::Varint(v)) => d.source = v as u32,
                (6, FieldValue::Varint(v)) => d.request_id = v as u32,
                (7, FieldValue::Varint(v)) => d.reply_id = v as u32,
                (8, FieldValue::Varint(v)) => d.emoji = v as u32,
                _ => {}
            }
        }

        Ok(d)
    }
}

impl MyNodeInfo {
    pub fn decode(data: &[u8]) -> Result<MyNodeInfo> {
        let mut info = MyNodeInfo::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Varint(v)) => info.my_node_num = v as u32,
                (8, FieldValue::Varint(v)) => info.reboot_count = v as u32,
                (11, FieldValue::Varint(v)) => info.min_app_version = v as u32,
                _ => {}
            }
        }

        Ok(info)
    }
}

impl NodeInfo {
    pub fn decode(data: &[u8]) -> Result<NodeInfo> {
        let mut info = NodeInfo::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Varint(v)) => info.num = v as u32,
                (2, FieldValue::Bytes(b)) => info.user = Some(User::decode(b)?),
                (3, FieldValue::Bytes(b)) => info.position = Some(Position::decode(b)?),
                (4, FieldValue::Fixed32(v)) => info.snr = f32::from_bits(v),
                (5, FieldValue::Varint(v)) => info.last_heard = v as u32,
                (7, FieldValue::Varint(v)) => info.channel = v as u32,
                (8, FieldValue::Varint(v)) => info.via_mqtt = v != 0,
                (9, FieldValue::Varint(v)) => info.hops = v as u32,
                (10, FieldValue::Varint(v)) => info.is_favorite = v != 0,
                _ => {}
            }
        }

        Ok(info)
    }
}

impl User {
    pub fn decode(data: &[u8]) -> Result<User> {
        let mut user = User::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Bytes(b)) => user.id = String::from_utf8_lossy(b).into_owned(),
                (2, FieldValue::Bytes(b)) => {
                    user.long_name = String::from_utf8_lossy(b).into_owned()
                }
                (3, FieldValue::Bytes(b)) => {
                    user.short_name = String::from_utf8_lossy(b).into_owned()
                }
                (4, FieldValue::Bytes(b)) => user.mac = b.to_vec(),
                (5, FieldValue::Varint(v)) => user.hw_model = v as u32,
                (6, FieldValue::Varint(v)) => user.is_licensed = v != 0,
                (7, FieldValue::Varint(v)) => user.role = v as u32,
                (8, FieldValue::Bytes(b)) => user.public_key = b.to_vec(),
                _ => {}
            }
        }

        Ok(user)
    }
}

impl Position {
    pub fn decode(data: &[u8]) -> Result<Position> {
        let mut pos = Position::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            match (num, value) {
                (1, FieldValue::Fixed32(v)) => pos.latitude_i = v as i32,
                (2, FieldValue::Fixed32(v)) => pos.longitude_i = v as i32,
                (3, FieldValue::Fixed32(v)) => pos.altitude = v as i32,
                (4, FieldValue::Varint(v)) => pos.time = v as u32,
                (5, FieldValue::Varint(v)) => pos.location_source = v as u32,
                (6, FieldValue::Varint(v)) => pos.altitude_source = v as u32,
                (7, FieldValue::Varint(v)) => pos.timestamp = v as u32,
                (14, FieldValue::Varint(v)) => pos.ground_speed = v as u32,
                (15, FieldValue::Varint(v)) => pos.ground_track = v as u32,
                (20, FieldValue::Varint(v)) => pos.sats_in_view = v as u32,
                _ => {}
            }
        }

        Ok(pos)
    }
}

/// Host-to-radio message; the relay only ever inspects `want_config_id`
#[derive(Debug, Clone, Default)]
pub struct ToRadio {
    pub want_config_id: u32,
}

impl ToRadio {
    /// Extract field 3 (`want_config_id`) from an encoded ToRadio, ignoring
    /// everything else
    pub fn decode(data: &[u8]) -> Result<ToRadio> {
        let mut tr = ToRadio::default();
        let mut reader = FieldReader::new(data);

        while let Some((num, value)) = reader.next_field()? {
            if num == 3 {
                if let FieldValue::Varint(v) = value {
                    tr.want_config_id = v as u32;
                }
            }
        }

        Ok(tr)
    }
}

/// Encoded WantConfig request: field 3, varint, value 1
pub const WANT_CONFIG_REQUEST: &[u8] = &[0x18, 0x01];
