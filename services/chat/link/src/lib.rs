//! Transport abstraction and link management for the whisper mesh.
//!
//! The [`Transport`] trait hides the medium (TCP, in-process hub, a
//! future radio backend) behind frame-oriented connect/send/disconnect
//! plus an event stream. [`LinkManager`] sits on top and owns the
//! neighbor pool: spawned dialers and per-link send workers with
//! bounded retries, least-recently-active eviction, independent
//! broadcast fan-out, and suspend/resume. Dial and delivery failures
//! surface asynchronously as [`LinkEvent`]s.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod link;
pub mod manager;
pub mod memory;
pub mod tcp;
pub mod transport;

pub use error::LinkError;
pub use link::{Link, LinkState};
pub use manager::{
    LinkEvent, LinkManager, CONNECT_ATTEMPTS, CONNECT_BACKOFF, DEFAULT_MAX_LINKS,
    OUTBOUND_QUEUE_DEPTH, SEND_ATTEMPTS, SEND_BACKOFF,
};
pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;
pub use transport::{Transport, TransportEvent, EVENT_CHANNEL_DEPTH};
