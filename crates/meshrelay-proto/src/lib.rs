//! Meshtastic wire protocol support for the relay
//!
//! This crate owns everything that touches raw protocol bytes:
//!
//! 1. **Framing** - the `0x94 0xC3` magic / length-prefixed stream framing
//!    used over serial and TCP, with resumable reads and resync recovery.
//! 2. **Codec** - a hand-rolled protobuf decoder for the subset of
//!    `FromRadio` the relay consumes, and the matching encoders the
//!    simulator emits.
//! 3. **Simulator** - a PTY-backed device that performs the config exchange
//!    and broadcasts synthetic traffic for tests and local development.
//!
//! # Wire format
//!
//! Every stream packet is `0x94 0xC3 <len_hi> <len_lo> <protobuf payload>`
//! with payloads capped at 512 bytes. Inside the payload, `FromRadio` is the
//! radio-to-host envelope and `ToRadio` the host-to-radio one; the only
//! ToRadio message the relay ever sends is the two-byte WantConfig request.

pub mod encode;
pub mod error;
pub mod framing;
pub mod proto;
pub mod simulator;
pub mod wire;

pub use error::{ProtoError, Result};
pub use framing::{StreamFramer, DEFAULT_READ_TIMEOUT, HEADER_SIZE, MAGIC1, MAGIC2, MAX_PACKET_SIZE};
pub use proto::{
    Data, FromRadio, MeshPacket, MyNodeInfo, NodeInfo, PortNum, Position, ToRadio, User,
    BROADCAST_ADDR, WANT_CONFIG_REQUEST,
};

#[cfg(unix)]
pub use simulator::{Device, DeviceConfig, SimulatedNode};
