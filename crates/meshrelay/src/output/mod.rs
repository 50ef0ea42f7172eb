//! Output sinks
//!
//! Each enabled output receives every packet that survives the filter. Sinks
//! fail independently: an HTTP 500 from the webhook neither aborts the relay
//! loop nor keeps the packet from the other sinks.

mod apprise;
mod file;
mod stdout;
mod webhook;

pub use apprise::AppriseSink;
pub use file::FileSink;
pub use stdout::StdoutSink;
pub use webhook::WebhookSink;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio_util::sync::CancellationToken;

use crate::config::OutputConfig;
use crate::error::Result;
use crate::message::Packet;

/// Contract implemented by every output
#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one packet. May block for as long as its disk or network
    /// operation takes; the cancel token aborts in-flight network calls.
    async fn send(&self, cancel: &CancellationToken, packet: &Packet) -> Result<()>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Identifier for logs
    fn name(&self) -> String;

    fn enabled(&self) -> bool;
}

/// Construct one sink from its config entry
pub fn build_sink(config: &OutputConfig) -> Result<Arc<dyn Sink>> {
    Ok(match config {
        OutputConfig::Stdout { enabled, format } => {
            Arc::new(StdoutSink::new(*format, *enabled))
        }
        OutputConfig::File {
            enabled,
            path,
            format,
            rotate,
            max_size_mb,
            max_backups,
        } => Arc::new(FileSink::new(
            path,
            *format,
            *enabled,
            *rotate,
            *max_size_mb,
            *max_backups,
        )?),
        OutputConfig::Apprise {
            enabled,
            url,
            tag,
            timeout,
            headers,
            channels,
        } => Arc::new(AppriseSink::new(
            url.clone(),
            tag.clone(),
            *timeout,
            headers.clone(),
            channels.clone(),
            *enabled,
        )?),
        OutputConfig::Webhook {
            enabled,
            url,
            method,
            headers,
            timeout,
        } => Arc::new(WebhookSink::new(
            url.clone(),
            method.clone(),
            headers.clone(),
            *timeout,
            *enabled,
        )?),
    })
}

/// Render the text-format line shared by the stdout and file sinks:
/// `[timestamp] <sender> (<port>): <payload>`
pub(crate) fn format_text_line(packet: &Packet) -> String {
    format!(
        "[{}] {} ({}): {}",
        packet
            .received_at
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        packet.sender_label(),
        packet.port_num.name(),
        packet.payload.display()
    )
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::message::{NodeInfo, Payload, User};
    use chrono::{TimeZone, Utc};
    use meshrelay_proto::PortNum;

    /// A deterministic text packet for sink tests
    pub(crate) fn text_packet(from: u32, channel: u32, text: &str) -> Packet {
        Packet {
            id: 101,
            from,
            to: 0xFFFFFFFF,
            channel,
            port_num: PortNum::TextMessage,
            payload: Payload::Text {
                text: text.to_string(),
            },
            raw_payload: Some(text.as_bytes().to_vec()),
            snr: 7.5,
            rssi: -68,
            hop_limit: 3,
            want_ack: false,
            received_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            from_node: None,
        }
    }

    pub(crate) fn with_sender(mut packet: Packet, long_name: &str, short_name: &str) -> Packet {
        packet.from_node = Some(NodeInfo {
            num: packet.from,
            user: Some(User {
                id: format!("!{:08x}", packet.from),
                long_name: long_name.to_string(),
                short_name: short_name.to_string(),
                hw_model: 9,
            }),
            position: None,
            last_heard: Utc::now(),
            snr: 5.0,
        });
        packet
    }
}
