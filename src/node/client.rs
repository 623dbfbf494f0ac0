//!
//! HTTP/WebSocket client for the remote node.
//!
//! Requests posted by the wallet are executed as JSON POSTs against the node's HTTP endpoint and
//! retried with exponential backoff on transport errors. Chain tip changes are received over a
//! WebSocket subscription. Both loops report back to the wallet through a single notification
//! channel so that all state changes happen on the wallet's own task.

use super::network::OutgoingRequest;
use super::types::*;
use crate::wallet::types::{ChainState, Height};

use backoff::{ExponentialBackoff, future::retry};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Chain tip update pushed by the node over the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TipUpdate {
    NewTip { state: ChainState },
    TipUnchanged,
    RolledBack { height: Height },
}

impl From<TipUpdate> for NodeNotification {
    fn from(update: TipUpdate) -> Self {
        match update {
            TipUpdate::NewTip { state } => NodeNotification::NewTip(state),
            TipUpdate::TipUnchanged => NodeNotification::TipUnchanged,
            TipUpdate::RolledBack { height } => NodeNotification::RolledBack(height),
        }
    }
}

/// Remote node client
#[derive(Clone)]
pub struct NodeClient {
    /// The underlying HTTP client for requests.
    http_client: Client,
    /// Base URL of the node HTTP endpoint.
    node_url: String,
    /// WebSocket URL for tip subscriptions.
    ws_url: String,
    /// Upper bound for retrying a single request.
    request_timeout: Duration,
}

impl NodeClient {
    /// Create a new node client.
    ///
    /// # Arguments
    /// * `node_url` - The HTTP endpoint for requests.
    /// * `ws_url` - The WebSocket endpoint for tip updates.
    /// * `request_timeout` - Timeout of a single HTTP call, also used as the retry budget.
    pub fn new(
        node_url: String,
        ws_url: String,
        request_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let http_client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            http_client,
            node_url,
            ws_url,
            request_timeout,
        })
    }

    /// Execute one request against the node.
    ///
    /// Transport failures are retried; a reply of the wrong kind is an error.
    pub async fn execute(&self, request: &NodeRequest) -> Result<NodeResponse, NodeError> {
        let url = format!("{}/request", self.node_url.trim_end_matches('/'));
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.request_timeout),
            ..ExponentialBackoff::default()
        };

        let response = retry(backoff, || async {
            let resp = self
                .http_client
                .post(&url)
                .json(request)
                .send()
                .await
                .map_err(|e| {
                    debug!("Node request send error: {}", e);
                    backoff::Error::transient(NodeError::from(e))
                })?;

            let status = resp.status();
            if status.is_server_error() {
                return Err(backoff::Error::transient(NodeError::Rejected(format!(
                    "server error {}",
                    status
                ))));
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(NodeError::Rejected(format!(
                    "{}: {}",
                    status, body
                ))));
            }

            resp.json::<NodeResponse>()
                .await
                .map_err(|e| backoff::Error::permanent(NodeError::from(e)))
        })
        .await?;

        if response.kind() != request.kind() {
            return Err(NodeError::UnexpectedResponse {
                expected: request.kind(),
                actual: response.kind(),
            });
        }
        Ok(response)
    }

    /// Execute every request arriving on `requests`, reporting each result on `notifications`.
    ///
    /// Returns when either channel is closed.
    pub async fn run_requests(
        self,
        mut requests: mpsc::UnboundedReceiver<OutgoingRequest>,
        notifications: mpsc::UnboundedSender<NodeNotification>,
    ) {
        while let Some(OutgoingRequest { id, request }) = requests.recv().await {
            let client = self.clone();
            let notifications = notifications.clone();
            tokio::spawn(async move {
                debug!("Executing node request {} ({:?})", id, request.kind());
                let result = client.execute(&request).await;
                if let Err(e) = &result {
                    warn!("Node request {} failed: {}", id, e);
                }
                if notifications
                    .send(NodeNotification::Response { id, result })
                    .is_err()
                {
                    debug!("Wallet loop closed, dropping response {}", id);
                }
            });
        }
        info!("Node request loop stopped");
    }

    /// Subscribe to chain tip updates.
    ///
    /// # Returns
    /// A pinned async stream of tip updates. Each item is either an update or an error.
    pub async fn subscribe_tips(
        &self,
    ) -> Result<
        std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<TipUpdate, NodeError>> + Send>>,
        NodeError,
    > {
        debug!("Attempting WebSocket connection to: {}", self.ws_url);

        let (ws_stream, response) = connect_async(self.ws_url.as_str()).await?;
        debug!(
            "WebSocket connection established, response status: {}",
            response.status()
        );
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let subscribe_message = json!({
            "type": "subscribe",
            "topic": "tip"
        });
        ws_sender
            .send(Message::Text(subscribe_message.to_string()))
            .await?;

        let stream = ws_receiver.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<TipUpdate>(&text) {
                    Ok(update) => Some(Ok(update)),
                    Err(e) => {
                        error!("Failed to deserialize tip update: {}", e);
                        error!("Raw data was: {}", text);
                        Some(Err(NodeError::from(e)))
                    }
                },
                Ok(Message::Close(_)) => Some(Err(NodeError::Disconnected)),
                Ok(_) => None,
                Err(e) => Some(Err(NodeError::from(e))),
            }
        });

        Ok(Box::pin(stream))
    }

    /// Keep a tip subscription open, reconnecting after `reconnect_delay` when it drops.
    ///
    /// Connection state is reported as [`NodeNotification::OwnedNode`].
    pub async fn run_tip_subscription(
        self,
        notifications: mpsc::UnboundedSender<NodeNotification>,
        reconnect_delay: Duration,
    ) {
        loop {
            match self.subscribe_tips().await {
                Ok(mut stream) => {
                    info!("Subscribed to node tip updates");
                    if notifications.send(NodeNotification::OwnedNode(true)).is_err() {
                        return;
                    }

                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(update) => {
                                if notifications.send(update.into()).is_err() {
                                    return;
                                }
                            }
                            Err(NodeError::Json(_)) => continue,
                            Err(e) => {
                                warn!("Tip subscription error: {}", e);
                                break;
                            }
                        }
                    }

                    if notifications.send(NodeNotification::OwnedNode(false)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("Failed to subscribe to node tip updates: {}", e);
                }
            }

            if notifications.is_closed() {
                return;
            }
            tokio::time::sleep(reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::types::BlockHash;

    #[test]
    fn tip_updates_map_to_notifications() {
        let update: TipUpdate = serde_json::from_str(
            r#"{"type":"new_tip","state":{"height":12,"hash":[0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0],"timestamp":1000}}"#,
        )
        .unwrap();
        match NodeNotification::from(update) {
            NodeNotification::NewTip(state) => {
                assert_eq!(state.height, 12);
                assert_eq!(state.hash, BlockHash::default());
            }
            other => panic!("unexpected notification {:?}", other),
        }

        let update: TipUpdate =
            serde_json::from_str(r#"{"type":"rolled_back","height":9}"#).unwrap();
        assert!(matches!(
            NodeNotification::from(update),
            NodeNotification::RolledBack(9)
        ));
    }

    #[tokio::test]
    async fn unreachable_node_fails_request() {
        let client = NodeClient::new(
            "http://127.0.0.1:1".to_string(),
            "ws://127.0.0.1:1".to_string(),
            Duration::from_millis(200),
        )
        .unwrap();
        let result = client.execute(&NodeRequest::StateSummary).await;
        assert!(result.is_err());
    }
}
