//! Webhook sink
//!
//! Posts the JSON form of each packet to a configured HTTP endpoint. Any
//! response outside 2xx fails the delivery with the status code in the error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::message::Packet;
use crate::output::Sink;

#[derive(Debug)]
pub struct WebhookSink {
    url: String,
    method: Method,
    headers: HashMap<String, String>,
    enabled: bool,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(
        url: String,
        method: String,
        headers: HashMap<String, String>,
        timeout_secs: u64,
        enabled: bool,
    ) -> Result<Self> {
        if url.is_empty() {
            return Err(RelayError::InvalidConfig(
                "webhook url is required".to_string(),
            ));
        }

        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| RelayError::InvalidConfig(format!("invalid webhook method: {method}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RelayError::SinkUnavailable(format!("failed to build http client: {e}")))?;

        Ok(Self {
            url,
            method,
            headers,
            enabled,
            client,
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    async fn send(&self, cancel: &CancellationToken, packet: &Packet) -> Result<()> {
        let body = serde_json::to_vec(packet)?;

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .body(body);
        if !self.headers.contains_key("Content-Type") {
            request = request.header("Content-Type", "application/json");
        }
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = request.send() => result.map_err(|e| {
                RelayError::SinkUnavailable(format!("failed to send to webhook: {e}"))
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::SinkUnavailable(format!(
                "webhook returned status {}",
                status.as_u16()
            )));
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        format!("webhook:{}", self.url)
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_required() {
        let err = WebhookSink::new(String::new(), "POST".into(), HashMap::new(), 30, true)
            .unwrap_err();
        assert!(err.to_string().contains("webhook url is required"));
    }

    #[test]
    fn test_invalid_method_rejected() {
        let err = WebhookSink::new(
            "http://localhost/hook".into(),
            "P O S T".into(),
            HashMap::new(),
            30,
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid webhook method"));
    }

    #[test]
    fn test_name() {
        let sink = WebhookSink::new(
            "http://localhost/hook".into(),
            "put".into(),
            HashMap::new(),
            30,
            true,
        )
        .unwrap();
        assert_eq!(sink.name(), "webhook:http://localhost/hook");
        assert_eq!(sink.method, Method::PUT);
    }
}
