//! Tree-shaped peer-to-peer overlay.
//!
//! Peers register with a root, are placed into a degree-2, depth-8 tree and
//! then flood text messages along tree edges. A periodic reunion heartbeat
//! lets the root expire silent subtrees and lets orphaned peers re-attach.

pub mod address;
pub mod config;
pub mod constants;
pub mod error;
pub mod network;
pub mod network_graph;
pub mod peer;
pub mod reunion;
pub mod shutdown;

pub use address::Address;
pub use network_graph::NetworkGraph;
pub use peer::{Peer, PeerOptions, Role};
