//! Declarative packet filter
//!
//! A pure predicate over a packet and the filter section of the config.
//! Three dimensions, AND-composed; an empty list means the dimension is not
//! filtered. Filtering runs before any sink is touched.

use crate::config::FilterConfig;
use crate::message::Packet;

/// Decide whether a packet passes the configured filters
pub fn should_relay(packet: &Packet, filters: &FilterConfig) -> bool {
    if !filters.message_types.is_empty() {
        let name = packet.port_num.name();
        if !filters.message_types.iter().any(|t| t == name) {
            return false;
        }
    }

    if !filters.node_ids.is_empty() && !filters.node_ids.contains(&packet.from) {
        return false;
    }

    if !filters.channels.is_empty() && !filters.channels.contains(&packet.channel) {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use chrono::Utc;
    use meshrelay_proto::PortNum;

    fn packet(port_num: PortNum, from: u32, channel: u32) -> Packet {
        Packet {
            id: 1,
            from,
            to: 0xFFFFFFFF,
            channel,
            port_num,
            payload: Payload::Text {
                text: "test".to_string(),
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

    #[test]
    fn test_empty_filters_match_everything() {
        let filters = FilterConfig::default();
        assert!(should_relay(&packet(PortNum::TextMessage, 1, 0), &filters));
        assert!(should_relay(&packet(PortNum::Telemetry, 99, 7), &filters));
    }

    #[test]
    fn test_message_type_filter() {
        let filters = FilterConfig {
            message_types: vec!["TEXT_MESSAGE_APP".to_string()],
            ..Default::default()
        };
        assert!(should_relay(&packet(PortNum::TextMessage, 1, 0), &filters));
        assert!(!should_relay(&packet(PortNum::Position, 1, 0), &filters));
    }

    #[test]
    fn test_node_id_filter() {
        let filters = FilterConfig {
            node_ids: vec![0xAA],
            ..Default::default()
        };
        assert!(should_relay(&packet(PortNum::TextMessage, 0xAA, 0), &filters));
        assert!(!should_relay(&packet(PortNum::TextMessage, 0xBB, 0), &filters));
    }

    #[test]
    fn test_channel_filter() {
        let filters = FilterConfig {
            channels: vec![1, 2],
            ..Default::default()
        };
        assert!(should_relay(&packet(PortNum::TextMessage, 1, 2), &filters));
        assert!(!should_relay(&packet(PortNum::TextMessage, 1, 0), &filters));
    }

    #[test]
    fn test_filters_are_and_composed() {
        let filters = FilterConfig {
            message_types: vec!["TEXT_MESSAGE_APP".to_string()],
            node_ids: vec![0xAA],
            channels: vec![0],
        };
        assert!(should_relay(&packet(PortNum::TextMessage, 0xAA, 0), &filters));
        // Each dimension failing alone rejects the packet
        assert!(!should_relay(&packet(PortNum::Position, 0xAA, 0), &filters));
        assert!(!should_relay(&packet(PortNum::TextMessage, 0xBB, 0), &filters));
        assert!(!should_relay(&packet(PortNum::TextMessage, 0xAA, 1), &filters));
    }
}
