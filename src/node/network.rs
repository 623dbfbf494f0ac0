use super::types::{NodeError, NodeRequest, RequestId};

use tokio::sync::mpsc;
use tracing::warn;

/// Outbound side of the node connection.
///
/// The answer to every posted request is delivered back to the wallet with the same
/// [`RequestId`]; posting never blocks.
pub trait NodeNetwork {
    fn post_request(&mut self, id: RequestId, request: &NodeRequest) -> Result<(), NodeError>;

    /// Whether the node reports itself in sync with the network.
    fn is_node_in_sync(&self) -> bool {
        true
    }
}

/// A request handed to the node client task.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub id: RequestId,
    pub request: NodeRequest,
}

/// [`NodeNetwork`] that forwards requests over a tokio channel to a [`super::NodeClient`] task.
pub struct ChannelNodeNetwork {
    sender: mpsc::UnboundedSender<OutgoingRequest>,
}

impl ChannelNodeNetwork {
    pub fn new(sender: mpsc::UnboundedSender<OutgoingRequest>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutgoingRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl NodeNetwork for ChannelNodeNetwork {
    fn post_request(&mut self, id: RequestId, request: &NodeRequest) -> Result<(), NodeError> {
        self.sender
            .send(OutgoingRequest {
                id,
                request: request.clone(),
            })
            .map_err(|_| {
                warn!("Node client is gone, dropping request {}", id);
                NodeError::Disconnected
            })
    }
}
