//! Apprise notification sink
//!
//! Posts a small notification envelope to an Apprise gateway, which fans the
//! message out to chat and email services. Per-channel overrides can silence
//! a channel entirely or retag its notifications.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AppriseChannelConfig;
use crate::error::{RelayError, Result};
use crate::message::Packet;
use crate::output::Sink;

/// JSON body accepted by the Apprise `/notify` endpoint
#[derive(Debug, Serialize)]
struct ApprisePayload<'a> {
    body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "String::is_empty")]
    tag: String,
}

#[derive(Debug)]
pub struct AppriseSink {
    url: String,
    tag: String,
    headers: HashMap<String, String>,
    channels: HashMap<u32, AppriseChannelConfig>,
    enabled: bool,
    client: reqwest::Client,
}

impl AppriseSink {
    pub fn new(
        url: String,
        tag: String,
        timeout_secs: u64,
        headers: HashMap<String, String>,
        channels: HashMap<u32, AppriseChannelConfig>,
        enabled: bool,
    ) -> Result<Self> {
        if url.is_empty() {
            return Err(RelayError::InvalidConfig(
                "apprise url is required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RelayError::SinkUnavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            url,
            tag,
            headers,
            channels,
            enabled,
            client,
        })
    }

    /// Title: `Meshtastic: ` plus the sender's long name, falling back to
    /// short name, falling back to the hex id
    fn format_title(&self, packet: &Packet) -> String {
        let sender = packet
            .from_node
            .as_ref()
            .map(|n| n.display_name())
            .unwrap_or_else(|| format!("!{:08x}", packet.from));
        format!("Meshtastic: {sender}")
    }

    fn format_body(&self, packet: &Packet) -> String {
        match packet.payload.text() {
            Some(text) => text.to_string(),
            None => format!("[{}] {}", packet.port_num.name(), packet.payload.display()),
        }
    }

    /// Tag for this packet's channel, and whether the channel is enabled
    fn channel_settings(&self, channel: u32) -> (String, bool) {
        match self.channels.get(&channel) {
            Some(over) => {
                let enabled = over.enabled.unwrap_or(true);
                let tag = if over.tag.is_empty() {
                    self.tag.clone()
                } else {
                    over.tag.clone()
                };
                (tag, enabled)
            }
            None => (self.tag.clone(), true),
        }
    }
}

#[async_trait]
impl Sink for AppriseSink {
    async fn send(&self, cancel: &CancellationToken, packet: &Packet) -> Result<()> {
        let (tag, channel_enabled) = self.channel_settings(packet.channel);
        if !channel_enabled {
            debug!(channel = packet.channel, "apprise disabled for channel, skipping");
            return Ok(());
        }

        let payload = ApprisePayload {
            body: self.format_body(packet),
            title: self.format_title(packet),
            kind: "info",
            tag,
        };

        let mut request = self.client.post(&self.url).json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = request.send() => result.map_err(|e| {
                RelayError::SinkUnavailable(format!("failed to send to apprise: {e}"))
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::SinkUnavailable(format!(
                "apprise returned status {}",
                status.as_u16()
            )));
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        format!("apprise:{}", self.url)
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}
