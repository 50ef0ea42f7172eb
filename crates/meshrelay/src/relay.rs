//! Relay service
//!
//! Orchestrates one connection driver, the filter, and the enabled sinks.
//! The relay loop consumes the connection's bounded channel, applies the
//! filter, and fans each surviving packet out to every sink in order. Sinks
//! fail independently; only statistics record the failure.
//!
//! Lifecycle: `start` builds sinks, builds and connects the driver, and
//! spawns the loop. A single cancellation token threads through everything;
//! `stop` fires it, closes the connection (which closes the channel, which
//! ends the loop), then closes each sink exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::connection::{self, Connection};
use crate::error::{RelayError, Result};
use crate::filter;
use crate::message::Packet;
use crate::output::{self, Sink};

/// Monotonic counters read concurrently by the host process
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    sent: AtomicU64,
    filtered: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub filtered: u64,
    pub errors: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Inner {
    running: bool,
    connection: Option<Box<dyn Connection>>,
    sinks: Vec<Arc<dyn Sink>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// The relay service
pub struct RelayService {
    config: Config,
    stats: Arc<RelayStats>,
    inner: Mutex<Inner>,
}

impl RelayService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            stats: Arc::new(RelayStats::default()),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start relaying. Builds sinks first, then the connection; a failure at
    /// any step rolls back what was already built and leaves the service
    /// stopped.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.running {
                return Err(RelayError::AlreadyRunning);
            }
            inner.running = true;
        }

        info!("starting relay service");

        match self.start_inner(cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.lock().running = false;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, cancel: CancellationToken) -> Result<()> {
        // Sinks first; an invalid sink aborts before any transport is opened
        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for output in self.config.outputs.iter().filter(|o| o.enabled()) {
            match output::build_sink(output) {
                Ok(sink) => {
                    debug!(sink = %sink.name(), "initialized output");
                    sinks.push(sink);
                }
                Err(e) => {
                    close_sinks(&sinks).await;
                    return Err(e);
                }
            }
        }
        if sinks.is_empty() {
            return Err(RelayError::InvalidConfig(
                "at least one output must be enabled".to_string(),
            ));
        }

        let mut conn = match connection::build(&self.config.connection) {
            Ok(conn) => conn,
            Err(e) => {
                close_sinks(&sinks).await;
                return Err(e);
            }
        };

        if let Err(e) = conn.connect(cancel.clone()).await {
            close_sinks(&sinks).await;
            return Err(e);
        }

        let receiver = match conn.messages() {
            Some(receiver) => receiver,
            None => {
                let _ = conn.close().await;
                close_sinks(&sinks).await;
                return Err(RelayError::NotConnected);
            }
        };

        info!(
            connection = %conn.name(),
            outputs = sinks.len(),
            "relay service started"
        );

        let task = tokio::spawn(relay_loop(
            receiver,
            sinks.clone(),
            self.config.filters.clone(),
            self.stats.clone(),
            cancel.clone(),
        ));

        let mut inner = self.inner.lock();
        inner.connection = Some(conn);
        inner.sinks = sinks;
        inner.cancel = Some(cancel);
        inner.task = Some(task);
        Ok(())
    }

    /// Stop the service. Safe to call when not running and safe to call
    /// twice; the second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (mut connection, sinks, cancel, task) = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return Ok(());
            }
            inner.running = false;
            (
                inner.connection.take(),
                std::mem::take(&mut inner.sinks),
                inner.cancel.take(),
                inner.task.take(),
            )
        };

        info!("stopping relay service");

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if let Some(conn) = connection.as_mut() {
            if let Err(e) = conn.close().await {
                error!(error = %e, "error closing connection");
            }
        }

        close_sinks(&sinks).await;

        if let Some(task) = task {
            let _ = task.await;
        }

        info!("relay service stopped");
        Ok(())
    }
}

async fn close_sinks(sinks: &[Arc<dyn Sink>]) {
    for sink in sinks {
        if let Err(e) = sink.close().await {
            error!(sink = %sink.name(), error = %e, "error closing output");
        }
    }
}

/// The dispatch loop: one packet in, filter, fan out to every sink in order.
async fn relay_loop(
    mut receiver: mpsc::Receiver<Packet>,
    sinks: Vec<Arc<dyn Sink>>,
    filters: crate::config::FilterConfig,
    stats: Arc<RelayStats>,
    cancel: CancellationToken,
) {
    debug!("relay loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("relay loop stopped: cancelled");
                return;
            }
            packet = receiver.recv() => {
                let Some(packet) = packet else {
                    debug!("relay loop stopped: message channel closed");
                    return;
                };

                stats.received.fetch_add(1, Ordering::Relaxed);

                if !filter::should_relay(&packet, &filters) {
                    stats.filtered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                for sink in &sinks {
                    match sink.send(&cancel, &packet).await {
                        Ok(()) => {
                            stats.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            error!(sink = %sink.name(), error = %e, "failed to send message to output");
                            stats.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::message::Payload;
    use async_trait::async_trait;
    use chrono::Utc;
    use meshrelay_proto::PortNum;
    use std::sync::atomic::AtomicUsize;

    struct StubSink {
        fail: bool,
        sends: AtomicUsize,
        closes: AtomicUsize,
    }

    impl StubSink {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                sends: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Sink for StubSink {
        async fn send(&self, _cancel: &CancellationToken, _packet: &Packet) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RelayError::SinkUnavailable("stub failure".to_string()))
            } else {
                Ok(())
            }
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> String {
            "stub".to_string()
        }

        fn enabled(&self) -> bool {
            true
        }
    }

    fn test_packet(port_num: PortNum, channel: u32) -> Packet {
        Packet {
            id: 1,
            from: 0xAA,
            to: 0xFFFFFFFF,
            channel,
            port_num,
            payload: Payload::Text {
                text: "stub".to_string(),
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
    async fn test_dispatch_counts_per_sink() {
        let good = StubSink::new(false);
        let bad = StubSink::new(true);
        let sinks: Vec<Arc<dyn Sink>> = vec![good.clone(), bad.clone()];

        let (tx, rx) = mpsc::channel(16);
        let stats = Arc::new(RelayStats::default());
        let cancel = CancellationToken::new();

        let n = 5;
        for _ in 0..n {
            tx.send(test_packet(PortNum::TextMessage, 0)).await.unwrap();
        }
        drop(tx);

        relay_loop(rx, sinks, FilterConfig::default(), stats.clone(), cancel).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, n);
        assert_eq!(snapshot.sent, n, "successes from the good sink");
        assert_eq!(snapshot.errors, n, "failures from the bad sink");
        assert_eq!(snapshot.filtered, 0);
        assert_eq!(good.sends.load(Ordering::SeqCst), n as usize);
        assert_eq!(bad.sends.load(Ordering::SeqCst), n as usize);
    }

    #[tokio::test]
    async fn test_filtered_packets_never_reach_sinks() {
        let sink = StubSink::new(false);
        let sinks: Vec<Arc<dyn Sink>> = vec![sink.clone()];

        let filters = FilterConfig {
            message_types: vec!["TEXT_MESSAGE_APP".to_string()],
            ..Default::default()
        };

        let (tx, rx) = mpsc::channel(16);
        let stats = Arc::new(RelayStats::default());

        tx.send(test_packet(PortNum::Position, 0)).await.unwrap();
        tx.send(test_packet(PortNum::TextMessage, 0)).await.unwrap();
        drop(tx);

        relay_loop(rx, sinks, filters, stats.clone(), CancellationToken::new()).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.filtered, 1);
        assert_eq!(snapshot.sent, 1);
        assert_eq!(sink.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_exits_on_cancel() {
        let sinks: Vec<Arc<dyn Sink>> = vec![StubSink::new(false)];
        let (_tx, rx) = mpsc::channel(16);
        let stats = Arc::new(RelayStats::default());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(relay_loop(
            rx,
            sinks,
            FilterConfig::default(),
            stats,
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("relay loop did not exit on cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_enabled_output() {
        let mut config = Config::default();
        config.outputs = vec![];
        let service = RelayService::new(config);
        let err = service.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("at least one output"));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        // Invalid connection makes the first start fail after the guard; use
        // a bad serial port so no transport is really opened
        let mut config = Config::with_default_output();
        config.connection.serial.port = "/dev/does-not-exist".to_string();
        let service = RelayService::new(config);

        assert!(service.start(CancellationToken::new()).await.is_err());
        // Failure rolled the running flag back, so a retry hits the same
        // connect error rather than AlreadyRunning
        let err = service.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let service = RelayService::new(Config::with_default_output());
        service.stop().await.unwrap();
        service.stop().await.unwrap();
    }
}
