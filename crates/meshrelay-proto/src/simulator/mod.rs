//! Test-time Meshtastic device simulator
//!
//! Plays the radio side of the wire protocol over a pseudo-terminal pair so
//! the serial driver and the relay pipeline can be exercised without
//! hardware. Unix only; on other platforms the module is absent and dependent
//! tests compile out.

#[cfg(unix)]
mod device;
#[cfg(unix)]
mod pty;

#[cfg(unix)]
pub use device::{Device, DeviceConfig, SimulatedNode};
#[cfg(unix)]
pub use pty::PtyStream;
