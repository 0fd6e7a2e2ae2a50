//! Device link orchestration for tether.
//!
//! Ties a plugged-in phone to the relay: a port forward from the desktop's
//! tunnel port to the phone's proxy port, then a relay listener in front of it.
//!
//! # Architecture
//!
//! ```text
//! DeviceEvent channel (plug / unplug)
//!       |
//!       v
//! ConnectionOrchestrator
//!       |
//!       +-- ForwardingProvider (adb forward tcp:TUNNEL tcp:REMOTE)
//!       |
//!       +-- RelayManager (listener on LISTEN_PORT)
//! ```
//!
//! Device discovery is not part of this crate; whatever watches for devices
//! feeds [`DeviceEvent`]s into [`ConnectionOrchestrator::run`].

mod forward;
mod orchestrator;
mod probe;

pub use forward::{AdbForwarder, ForwardingProvider};
pub use orchestrator::{ConnectionOrchestrator, DeviceEvent, LinkStatus};
pub use probe::{probe_tunnel, DEFAULT_PROBE_TIMEOUT};

use tether_relay::RelayError;

/// Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while linking a device.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The forwarding tool could not be launched.
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The forwarding tool ran and reported failure.
    #[error("Port forward failed: {0}")]
    Forward(String),

    /// An operation needed a device and none is attached.
    #[error("No device connected. Please connect a device via USB.")]
    NoDevice,

    #[error(transparent)]
    Relay(#[from] RelayError),
}
