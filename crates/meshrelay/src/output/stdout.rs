//! Stdout sink
//!
//! One line per packet on standard output, either the packet's JSON form or
//! the shared human-readable text line.

use std::io::Write;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::OutputFormat;
use crate::error::Result;
use crate::message::Packet;
use crate::output::{format_text_line, Sink};

pub struct StdoutSink {
    format: OutputFormat,
    enabled: bool,
}

impl StdoutSink {
    pub fn new(format: OutputFormat, enabled: bool) -> Self {
        Self { format, enabled }
    }

    fn render(&self, packet: &Packet) -> Result<String> {
        Ok(match self.format {
            OutputFormat::Json => serde_json::to_string(packet)?,
            OutputFormat::Text => format_text_line(packet),
        })
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn send(&self, _cancel: &CancellationToken, packet: &Packet) -> Result<()> {
        let line = self.render(packet)?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{line}")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        "stdout".to_string()
    }

    fn enabled(&self) -> bool {
        self.enabled
    }
}
