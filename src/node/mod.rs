//!
//! Remote node integration.
//!
//! Re-exports the request/response model, the network seam used by the wallet and the
//! HTTP/WebSocket client that talks to a real node.
pub mod client;
pub mod network;
pub mod types;

pub use client::{NodeClient, TipUpdate};
pub use network::{ChannelNodeNetwork, NodeNetwork, OutgoingRequest};
pub use types::*;
