//! Protobuf encoders for the radio side of the protocol
//!
//! The simulator plays the device, so it needs to emit the same messages the
//! decoder consumes. Only populated fields are written, matching how real
//! firmware omits defaults.

use crate::wire::{
    put_bytes, put_float, put_int32, put_sfixed32, put_string, put_uint32,
};

/// Minimum app version reported by the simulated device
const MIN_APP_VERSION: u32 = 30000;

/// Encode a MyNodeInfo message
pub fn my_node_info(node_num: u32, reboot_count: u32) -> Vec<u8> {
    let mut msg = Vec::new();
    put_uint32(&mut msg, 1, node_num);
    put_uint32(&mut msg, 8, reboot_count);
    put_uint32(&mut msg, 11, MIN_APP_VERSION);
    msg
}

/// Encode a User message
pub fn user(id: &str, long_name: &str, short_name: &str, hw_model: u32) -> Vec<u8> {
    let mut msg = Vec::new();
    put_string(&mut msg, 1, id);
    put_string(&mut msg, 2, long_name);
    put_string(&mut msg, 3, short_name);
    put_uint32(&mut msg, 5, hw_model);
    msg
}

/// Encode a Position message; coordinates are degrees x 1e7
pub fn position(latitude_i: i32, longitude_i: i32, altitude: i32, time: u32) -> Vec<u8> {
    let mut msg = Vec::new();
    put_sfixed32(&mut msg, 1, latitude_i);
    put_sfixed32(&mut msg, 2, longitude_i);
    put_sfixed32(&mut msg, 3, altitude);
    if time > 0 {
        put_uint32(&mut msg, 4, time);
    }
    msg
}

/// Encode a NodeInfo message from pre-encoded User and Position submessages
pub fn node_info(num: u32, user: &[u8], position: &[u8], snr: f32, last_heard: u32) -> Vec<u8> {
    let mut msg = Vec::new();
    put_uint32(&mut msg, 1, num);
    if !user.is_empty() {
        put_bytes(&mut msg, 2, user);
    }
    if !position.is_empty() {
        put_bytes(&mut msg, 3, position);
    }
    if snr != 0.0 {
        put_float(&mut msg, 4, snr);
    }
    if last_heard > 0 {
        put_uint32(&mut msg, 5, last_heard);
    }
    msg
}

/// Encode a Data message
pub fn data(port_num: u32, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::new();
    put_uint32(&mut msg, 1, port_num);
    put_bytes(&mut msg, 2, payload);
    msg
}

/// Encode a MeshPacket carrying a pre-encoded Data submessage.
///
/// SNR goes out as the fixed-point varint the stream decoder expects (dB x 4);
/// RSSI is an sfixed32.
#[allow(clippy::too_many_arguments)]
pub fn mesh_packet(
    from: u32,
    to: u32,
    channel: u32,
    id: u32,
    decoded: &[u8],
    rx_time: u32,
    snr: f32,
    rssi: i32,
    hop_limit: u32,
) -> Vec<u8> {
    let mut msg = Vec::new();
    put_uint32(&mut msg, 1, from);
    put_uint32(&mut msg, 2, to);
    put_uint32(&mut msg, 3, channel);
    if !decoded.is_empty() {
        put_bytes(&mut msg, 4, decoded);
    }
    put_uint32(&mut msg, 6, id);
    if rx_time > 0 {
        put_uint32(&mut msg, 7, rx_time);
    }
    put_uint32(&mut msg, 10, hop_limit);
    if snr != 0.0 {
        put_int32(&mut msg, 13, (snr * 4.0) as i32);
    }
    if rssi != 0 {
        put_sfixed32(&mut msg, 14, rssi);
    }
    msg
}

/// Encode a FromRadio envelope from pre-encoded submessages
pub fn from_radio(
    id: u32,
    packet: &[u8],
    my_info: &[u8],
    node_info: &[u8],
    config_complete_id: u32,
) -> Vec<u8> {
    let mut msg = Vec::new();
    put_uint32(&mut msg, 1, id);
    if !packet.is_empty() {
        put_bytes(&mut msg, 2, packet);
    }
    if !my_info.is_empty() {
        put_bytes(&mut msg, 3, my_info);
    }
    if !node_info.is_empty() {
        put_bytes(&mut msg, 4, node_info);
    }
    if config_complete_id > 0 {
        put_uint32(&mut msg, 8, config_complete_id);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_layout() {
        let msg = data(1, b"hi");
        // field 1 varint 1, field 2 bytes "hi"
        assert_eq!(msg, vec![0x08, 0x01, 0x12, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_snr_fixed_point_encoding() {
        let msg = mesh_packet(1, 2, 0, 1, &[], 0, 2.5, 0, 3);
        let mp = crate::proto::MeshPacket::decode(&msg).unwrap();
        assert!((mp.rx_snr - 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_submessages_omitted() {
        let msg = from_radio(7, &[], &[], &[], 0);
        // Only the id field is present
        assert_eq!(msg, vec![0x08, 0x07]);
    }
}
