//! Relay Meshtastic mesh messages to notification sinks
//!
//! A one-way ingest path: packets arrive from a Meshtastic node over serial,
//! TCP or MQTT, are decoded and filtered, and fan out to every enabled sink
//! (stdout, rotating file, HTTP webhook, Apprise).
//!
//! ```text
//! connection driver -> bounded channel -> relay loop -> filter -> sinks
//! ```
//!
//! The [`relay::RelayService`] owns the lifecycle: one connection, the
//! filter, the sink set and a single cancellation token threaded through
//! every task. See `meshrelay-proto` for the wire codec and the device
//! simulator used in tests.

pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod message;
pub mod output;
pub mod relay;

pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use error::{RelayError, Result};
pub use message::{NodeInfo, Packet, Payload, Position, User};
pub use output::Sink;
pub use relay::{RelayService, StatsSnapshot};
