//! # Z-Mesh
//!
//! Reliable file transfer over a Meshtastic-style LoRa mesh: tiny text
//! frames, multi-second latency, loss and reordering everywhere, no
//! session layer. Z-Mesh layers a chunked, acknowledged, watchdog-guarded
//! transfer protocol on top of that datagram service.
//!
//! ## Architecture
//!
//! - **Codec** ([`core::codec`]): pipe-separated ASCII frames sized to fit
//!   one mesh text payload; binary chunks travel base64-encoded.
//! - **Mesh port** ([`core::port`]): the only seam to the radio. Everything
//!   above it sees an idealized lossy datagram channel, so the whole engine
//!   runs unchanged against the in-memory mesh used by the tests and the
//!   `zmesh` simulation binary.
//! - **Engine** ([`core::engine`]): single owner of all session and node
//!   state. Pure state machine: inputs are frames, commands and clock
//!   ticks; outputs are frames to send, files to deliver, and events.
//! - **Protocol task** ([`workers::engine`]): the one async task that owns
//!   the port and drives the engine; no locks anywhere in the protocol.
//! - **Event bus** ([`core::events`]): bounded, non-blocking fan-out of
//!   progress/discovery/log events to UI subscribers.

pub mod app;
pub mod core;
pub mod utils;
pub mod workers;

pub use crate::core::codec::Frame;
pub use crate::core::config::Config;
pub use crate::core::engine::Engine;
pub use crate::core::events::{Event, EventBus};
pub use crate::core::port::{Destination, Inbound, LinkInfo, MeshPort};
pub use crate::core::session::{NodeId, TransferId};
