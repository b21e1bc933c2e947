//! Flood routing for the whisper mesh.
//!
//! Packets spread by controlled flooding: every floodable packet is
//! retransmitted on all links with a decremented TTL, duplicate
//! suppression keeps each packet to one delivery and one retransmission
//! per node, and an advisory route table learned from advertisements
//! biases unicast floods toward a known next hop when one exists.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod router;
pub mod seen;
pub mod table;

pub use router::{DropReason, MeshRouter, RouteAction, RouterStats};
pub use seen::SeenSet;
pub use table::{Route, RouteTable, MAX_ROUTES};
