//! Mesh port: the only seam between the protocol and a radio.
//!
//! A port is a duplex datagram channel addressed by node id. The mesh
//! underneath may lose, reorder and duplicate frames; the protocol above
//! tolerates all three. Exactly one task owns a port: it is the sole
//! writer to the device and the sole reader from it.

use std::fmt::{Display, Formatter};

use crate::core::session::NodeId;

pub mod memory;

pub use memory::{LinkProfile, MemoryMesh, MemoryPort};

/// Where a frame is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Node(NodeId),
    Broadcast,
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Node(id) => id.fmt(f),
            Destination::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Per-frame link quality as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkInfo {
    /// Signal-to-noise ratio in dB.
    pub snr: Option<f64>,
    /// Received signal strength in dBm.
    pub rssi: Option<i32>,
    /// Hops the frame took through the mesh.
    pub hop_count: Option<u8>,
}

/// One frame received from the mesh.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub origin: NodeId,
    pub text: String,
    pub link: LinkInfo,
}

/// Send failures, split by whether retrying can help.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Radio busy, not ready, duty-cycle pause. Retry with backoff.
    #[error("transient device error: {0}")]
    Transient(String),
    /// Device gone. The engine aborts all sessions and stops.
    #[error("fatal device error: {0}")]
    Fatal(String),
}

/// Adapter around a concrete mesh device.
///
/// `recv` yields frames until the device goes away, then returns `None`
/// forever; the stream is not restartable.
pub trait MeshPort: Send {
    /// The local node's id as enumerated from the device.
    fn local_id(&self) -> NodeId;

    /// Send one text frame to a node or to everyone in range.
    fn send(
        &mut self,
        dest: &Destination,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), SendError>> + Send;

    /// Await the next inbound frame.
    fn recv(&mut self) -> impl std::future::Future<Output = Option<Inbound>> + Send;
}
