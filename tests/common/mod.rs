#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use wallet_sync_engine::node::{
    ChainEvent, KernelProof, NodeError, NodeNetwork, NodeRequest, NodeResponse, RegistrationStatus,
    RequestId, RequestKind, StateSummary,
};
use wallet_sync_engine::transaction::key_keeper::{
    KeyKeeper, KeyKeeperError, MessageEndpoint, ReceiverSignRequest, ReceiverSignature,
    SenderPublicData, SenderSignRequest, SignedTransaction,
};
use wallet_sync_engine::transaction::{
    ParameterId, SetTxParameter, TxParameters, TxSettings, TxType,
};
use wallet_sync_engine::wallet::sync::{EventCollector, SharedEvents};
use wallet_sync_engine::wallet::*;

pub type Posted = Rc<RefCell<Vec<(RequestId, NodeRequest)>>>;
pub type Sent = Rc<RefCell<Vec<(WalletId, SetTxParameter)>>>;

pub struct RecordingNetwork(pub Posted);

impl NodeNetwork for RecordingNetwork {
    fn post_request(&mut self, id: RequestId, request: &NodeRequest) -> Result<(), NodeError> {
        self.0.borrow_mut().push((id, request.clone()));
        Ok(())
    }
}

pub struct RecordingEndpoint(pub Sent);

impl MessageEndpoint for RecordingEndpoint {
    fn send(&mut self, peer: &WalletId, message: SetTxParameter) {
        self.0.borrow_mut().push((*peer, message));
    }
}

/// Key keeper that hands out sequential coin indices and deterministic signatures.
pub struct MockKeyKeeper {
    next_idx: u64,
}

impl MockKeyKeeper {
    pub fn new(first_idx: u64) -> Self {
        Self { next_idx: first_idx }
    }
}

pub fn kernel_for(tx_id: &TxId) -> KernelId {
    let mut id = [0u8; 32];
    id[..16].copy_from_slice(&tx_id.0);
    KernelId(id)
}

impl KeyKeeper for MockKeyKeeper {
    fn generate_coin(
        &mut self,
        value: u64,
        asset_id: AssetId,
        key_type: KeyType,
    ) -> Result<CoinId, KeyKeeperError> {
        self.next_idx += 1;
        Ok(CoinId::new(self.next_idx, key_type, value).with_asset(asset_id))
    }

    fn sender_public_data(
        &mut self,
        _tx_id: &TxId,
        _inputs: &[CoinId],
        _outputs: &[CoinId],
    ) -> Result<SenderPublicData, KeyKeeperError> {
        Ok(SenderPublicData {
            public_nonce: vec![1, 2],
            public_excess: vec![3, 4],
        })
    }

    fn sign_receiver(
        &mut self,
        request: &ReceiverSignRequest,
    ) -> Result<ReceiverSignature, KeyKeeperError> {
        Ok(ReceiverSignature {
            kernel_id: kernel_for(&request.tx_id),
            public_nonce: vec![5],
            public_excess: vec![6],
            signature: vec![7],
            outputs: vec![8],
        })
    }

    fn sign_sender(
        &mut self,
        request: &SenderSignRequest,
    ) -> Result<SignedTransaction, KeyKeeperError> {
        Ok(SignedTransaction {
            kernel_id: request.peer.kernel_id,
            body: vec![9, 9, 9],
        })
    }
}

pub fn state(height: Height) -> ChainState {
    ChainState {
        height,
        hash: BlockHash([height as u8; 32]),
        timestamp: chrono::Utc::now().timestamp(),
    }
}

pub fn settings_for(my_id: WalletId) -> TxSettings {
    TxSettings {
        my_id,
        ..TxSettings::default()
    }
}

pub struct Harness {
    pub wallet: Wallet,
    pub my_id: WalletId,
    pub posted: Posted,
    pub sent: Sent,
    pub events: SharedEvents,
}

impl Harness {
    /// Wallet with a key keeper, a recording node and one owned node online.
    pub fn new(my_id: WalletId) -> Self {
        Self::with_store(my_id, MemoryWalletStore::new())
    }

    pub fn with_store(my_id: WalletId, store: MemoryWalletStore) -> Self {
        let wallet = Wallet::new(Box::new(store), settings_for(my_id))
            .with_key_keeper(Box::new(MockKeyKeeper::new(my_id.0[0] as u64 * 1000)));
        Self::with_wallet(my_id, wallet)
    }

    /// Attach the recording node and endpoint to a wallet built by the caller.
    pub fn with_wallet(my_id: WalletId, mut wallet: Wallet) -> Self {
        let posted = Posted::default();
        let sent = Sent::default();
        wallet.set_node_network(Box::new(RecordingNetwork(posted.clone())));
        wallet.add_message_endpoint(Box::new(RecordingEndpoint(sent.clone())));
        let (collector, events) = EventCollector::shared();
        wallet.register_event_handler(Box::new(collector));
        wallet.on_owned_node(true);
        Self {
            wallet,
            my_id,
            posted,
            sent,
            events,
        }
    }

    pub fn take_posted(&self) -> Vec<(RequestId, NodeRequest)> {
        std::mem::take(&mut *self.posted.borrow_mut())
    }

    pub fn take_sent(&self) -> Vec<(WalletId, SetTxParameter)> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    pub fn events(&self) -> Vec<WalletEvent> {
        self.events.borrow().clone()
    }

    /// Pop the pending request of `kind`, leaving the others recorded.
    pub fn take_request(&self, kind: RequestKind) -> Option<(RequestId, NodeRequest)> {
        let mut posted = self.posted.borrow_mut();
        let pos = posted.iter().position(|(_, r)| r.kind() == kind)?;
        Some(posted.remove(pos))
    }

    /// Announce tip `height` and answer the sync requests, delivering `events` on the first
    /// Events page.
    pub fn sync_to(&mut self, height: Height, events: Vec<ChainEvent>) {
        self.wallet.on_new_tip(state(height));
        self.answer_sync(events);
    }

    pub fn answer_sync(&mut self, mut events: Vec<ChainEvent>) {
        while let Some((id, request)) = self
            .take_request(RequestKind::Events)
            .or_else(|| self.take_request(RequestKind::StateSummary))
        {
            let response = match request {
                NodeRequest::Events { .. } => NodeResponse::Events {
                    events: std::mem::take(&mut events),
                },
                _ => NodeResponse::StateSummary(StateSummary::default()),
            };
            self.wallet.on_response(id, Ok(response));
        }
    }

    pub fn answer_registration(&mut self, status: RegistrationStatus) {
        let (id, _) = self
            .take_request(RequestKind::Registration)
            .expect("registration request");
        self.wallet.on_response(
            id,
            Ok(NodeResponse::Registration {
                status,
                extra_info: String::new(),
            }),
        );
    }

    pub fn answer_kernel(&mut self, proof_height: Option<Height>) {
        let (id, _) = self
            .take_request(RequestKind::Kernel)
            .expect("kernel proof request");
        self.wallet.on_response(
            id,
            Ok(NodeResponse::KernelProof {
                proof: proof_height.map(|h| KernelProof {
                    state: state(h),
                    merkle_proof: vec![],
                }),
            }),
        );
    }

    pub fn coin(&self, id: &CoinId) -> Option<Coin> {
        self.wallet.store().find_coin(id)
    }

    pub fn status(&self, tx_id: &TxId) -> Option<wallet_sync_engine::transaction::TxStatus> {
        use wallet_sync_engine::transaction::parameters::TxParameterStore;
        self.wallet.store().tx_status(tx_id)
    }
}

pub fn send_params(peer: WalletId, amount: u64, fee: u64) -> TxParameters {
    let mut params = TxParameters::new(None);
    params
        .set(ParameterId::TransactionType, &TxType::Simple)
        .unwrap()
        .set(ParameterId::PeerId, &peer)
        .unwrap()
        .set(ParameterId::Amount, &amount)
        .unwrap()
        .set(ParameterId::Fee, &fee)
        .unwrap();
    params
}

/// Receiver's reply to an invitation, carrying its signature.
pub fn receiver_reply(from: WalletId, tx_id: TxId) -> SetTxParameter {
    SetTxParameter::new(from, tx_id, TxType::Simple)
        .add_parameter(
            ParameterId::PeerSignature,
            &ReceiverSignature {
                kernel_id: kernel_for(&tx_id),
                public_nonce: vec![5],
                public_excess: vec![6],
                signature: vec![7],
                outputs: vec![8],
            },
        )
        .unwrap()
}
