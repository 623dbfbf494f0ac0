//! In-flight node request tracking.
//!
//! The multiplexer owns every outstanding request, keyed by `(RequestKind, RequestKey)`. At most
//! one request exists per key; a second post for the same key is refused without any I/O. Each
//! accepted post gets a fresh [`RequestId`] which the node echoes back, so an answer for a request
//! that was aborted in the meantime is recognised as stale and dropped.

use crate::node::{AssetRef, NodeNetwork, NodeRequest, RequestId, RequestKind};
use crate::wallet::types::{CoinId, SubTxId, TxId};

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Dedup key of a request within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestKey {
    Singleton,
    Coin(CoinId),
    Tx {
        tx_id: TxId,
        sub_tx_id: SubTxId,
    },
    Asset {
        tx_id: TxId,
        sub_tx_id: SubTxId,
        target: AssetRef,
    },
    TxOnly(TxId),
}

impl RequestKey {
    /// Transaction owning the request, if any.
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            RequestKey::Tx { tx_id, .. }
            | RequestKey::Asset { tx_id, .. }
            | RequestKey::TxOnly(tx_id) => Some(*tx_id),
            RequestKey::Singleton | RequestKey::Coin(_) => None,
        }
    }

    pub fn sub_tx_id(&self) -> Option<SubTxId> {
        match self {
            RequestKey::Tx { sub_tx_id, .. } | RequestKey::Asset { sub_tx_id, .. } => {
                Some(*sub_tx_id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub key: RequestKey,
    pub request: NodeRequest,
}

impl PendingRequest {
    pub fn kind(&self) -> RequestKind {
        self.request.kind()
    }
}

#[derive(Debug, Default)]
pub struct RequestMultiplexer {
    pending: BTreeMap<(RequestKind, RequestKey), PendingRequest>,
    by_id: HashMap<RequestId, (RequestKind, RequestKey)>,
    next_id: u64,
    /// Sync-critical requests posted since the last completed sync round.
    sync_total: usize,
}

impl RequestMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post `request` under `key`.
    ///
    /// Returns false, without touching the network, when no network is attached or a request
    /// with the same kind and key is already outstanding. A network refusal also returns false
    /// and leaves nothing pending.
    pub fn post(
        &mut self,
        key: RequestKey,
        request: NodeRequest,
        network: Option<&mut (dyn NodeNetwork + '_)>,
    ) -> bool {
        let Some(network) = network else {
            debug!("No node attached, {:?} request not posted", request.kind());
            return false;
        };

        let kind = request.kind();
        if self.pending.contains_key(&(kind, key)) {
            debug!("{:?} request for {:?} is already pending", kind, key);
            return false;
        }

        self.next_id += 1;
        let id = RequestId(self.next_id);
        if let Err(e) = network.post_request(id, &request) {
            warn!("Failed to post {:?} request {}: {}", kind, id, e);
            return false;
        }

        if kind.is_sync_critical() {
            self.sync_total += 1;
        }
        self.by_id.insert(id, (kind, key));
        self.pending.insert((kind, key), PendingRequest { id, key, request });
        true
    }

    /// Take the request answered by `id`. `None` means it was aborted or already completed.
    pub fn complete(&mut self, id: RequestId) -> Option<PendingRequest> {
        let slot = self.by_id.remove(&id)?;
        self.pending.remove(&slot)
    }

    /// Drop a pending request without completing it.
    pub fn abort(&mut self, kind: RequestKind, key: RequestKey) -> bool {
        match self.pending.remove(&(kind, key)) {
            Some(request) => {
                self.by_id.remove(&request.id);
                debug!("Aborted {:?} request {}", kind, request.id);
                true
            }
            None => false,
        }
    }

    /// Drop every pending request owned by `tx_id`.
    pub fn abort_for_tx(&mut self, tx_id: &TxId) -> usize {
        let slots: Vec<_> = self
            .pending
            .keys()
            .filter(|(_, key)| key.tx_id().as_ref() == Some(tx_id))
            .copied()
            .collect();
        for (kind, key) in &slots {
            self.abort(*kind, *key);
        }
        slots.len()
    }

    pub fn abort_all(&mut self) {
        self.pending.clear();
        self.by_id.clear();
    }

    pub fn get(&self, kind: RequestKind, key: &RequestKey) -> Option<&PendingRequest> {
        self.pending.get(&(kind, *key))
    }

    pub fn is_pending(&self, kind: RequestKind, key: &RequestKey) -> bool {
        self.pending.contains_key(&(kind, *key))
    }

    /// Outstanding sync-critical requests.
    pub fn sync_remains(&self) -> usize {
        self.pending
            .keys()
            .filter(|(kind, _)| kind.is_sync_critical())
            .count()
    }

    pub fn sync_total(&self) -> usize {
        self.sync_total
    }

    pub fn reset_sync_total(&mut self) {
        self.sync_total = 0;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeError;
    use crate::wallet::types::KernelId;

    #[derive(Default)]
    struct RecordingNetwork {
        posted: Vec<(RequestId, NodeRequest)>,
        refuse: bool,
    }

    impl NodeNetwork for RecordingNetwork {
        fn post_request(&mut self, id: RequestId, request: &NodeRequest) -> Result<(), NodeError> {
            if self.refuse {
                return Err(NodeError::Disconnected);
            }
            self.posted.push((id, request.clone()));
            Ok(())
        }
    }

    fn kernel_request() -> NodeRequest {
        NodeRequest::KernelProof {
            kernel_id: KernelId([1; 32]),
        }
    }

    fn tx_key(byte: u8) -> RequestKey {
        RequestKey::Tx {
            tx_id: TxId([byte; 16]),
            sub_tx_id: 0,
        }
    }

    #[test]
    fn duplicate_post_is_refused_without_io() {
        let mut network = RecordingNetwork::default();
        let mut mux = RequestMultiplexer::new();

        assert!(mux.post(tx_key(1), kernel_request(), Some(&mut network)));
        assert!(!mux.post(tx_key(1), kernel_request(), Some(&mut network)));
        assert_eq!(network.posted.len(), 1);
        assert_eq!(mux.len(), 1);

        // Same key, other kind is independent.
        let details = NodeRequest::KernelDetails {
            kernel_id: KernelId([1; 32]),
            fetch_body: true,
        };
        assert!(mux.post(tx_key(1), details, Some(&mut network)));
        assert_eq!(network.posted.len(), 2);
    }

    #[test]
    fn no_network_means_no_post() {
        let mut mux = RequestMultiplexer::new();
        assert!(!mux.post(RequestKey::Singleton, NodeRequest::StateSummary, None));
        assert!(mux.is_empty());

        let mut network = RecordingNetwork {
            refuse: true,
            ..Default::default()
        };
        assert!(!mux.post(
            RequestKey::Singleton,
            NodeRequest::StateSummary,
            Some(&mut network)
        ));
        assert!(mux.is_empty());
        assert_eq!(mux.sync_total(), 0);
    }

    #[test]
    fn completion_frees_the_key() {
        let mut network = RecordingNetwork::default();
        let mut mux = RequestMultiplexer::new();
        mux.post(tx_key(1), kernel_request(), Some(&mut network));
        let id = network.posted[0].0;

        let done = mux.complete(id).unwrap();
        assert_eq!(done.key, tx_key(1));
        assert!(mux.complete(id).is_none());
        assert!(mux.post(tx_key(1), kernel_request(), Some(&mut network)));
    }

    #[test]
    fn aborted_request_is_never_completed() {
        let mut network = RecordingNetwork::default();
        let mut mux = RequestMultiplexer::new();
        mux.post(tx_key(1), kernel_request(), Some(&mut network));
        mux.post(
            RequestKey::TxOnly(TxId([1; 16])),
            NodeRequest::ShieldedList { start: 0, count: 10 },
            Some(&mut network),
        );
        mux.post(tx_key(2), kernel_request(), Some(&mut network));

        assert_eq!(mux.abort_for_tx(&TxId([1; 16])), 2);
        assert!(mux.complete(network.posted[0].0).is_none());
        assert!(mux.complete(network.posted[1].0).is_none());
        assert!(mux.complete(network.posted[2].0).is_some());
    }

    #[test]
    fn sync_counters_track_critical_kinds() {
        let mut network = RecordingNetwork::default();
        let mut mux = RequestMultiplexer::new();
        mux.post(
            RequestKey::Singleton,
            NodeRequest::Events { start_height: 0 },
            Some(&mut network),
        );
        mux.post(tx_key(1), kernel_request(), Some(&mut network));
        mux.post(
            tx_key(1),
            NodeRequest::Registration {
                transaction: vec![1],
            },
            Some(&mut network),
        );

        assert_eq!(mux.sync_remains(), 2);
        assert_eq!(mux.sync_total(), 2);

        mux.complete(network.posted[0].0);
        assert_eq!(mux.sync_remains(), 1);
        assert_eq!(mux.sync_total(), 2);

        mux.reset_sync_total();
        assert_eq!(mux.sync_total(), 0);
    }
}
