//! Mesh node orchestration.
//!
//! Wires the wire codec, crypto engine, router, link pool, and offline
//! store into one event loop ([`MeshNode`]) and exposes the application
//! API: a command handle ([`NodeHandle`]) plus an [`AppEvent`] stream.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handle;
pub mod node;
pub mod peers;

pub use error::NodeError;
pub use handle::{AppEvent, MessageContext, NodeHandle};
pub use node::{MeshNode, NodeConfig};
pub use peers::{PeerInfo, PeerRegistry, MAX_PEERS};
