//! Collaborators a transaction talks to from inside `update_impl`: the signing/proving service,
//! the coin selection strategy and the peer messaging endpoint.

use crate::transaction::parameters::SetTxParameter;
use crate::wallet::types::{AssetId, Coin, CoinId, KernelId, KeyType, TxId, WalletId};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyKeeperError {
    #[error("Aborted by the user")]
    UserAbort,

    #[error("Key keeper out of slots")]
    NoSlots,

    #[error("Key keeper failed: {0}")]
    Failed(String),
}

/// Sender's half of the kernel before the peer has signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderPublicData {
    pub public_nonce: Vec<u8>,
    pub public_excess: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSignRequest {
    pub tx_id: TxId,
    pub amount: u64,
    pub fee: u64,
    pub asset_id: AssetId,
    pub outputs: Vec<CoinId>,
    pub peer_public_nonce: Vec<u8>,
    pub peer_public_excess: Vec<u8>,
}

/// Receiver's contribution returned to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverSignature {
    pub kernel_id: KernelId,
    pub public_nonce: Vec<u8>,
    pub public_excess: Vec<u8>,
    pub signature: Vec<u8>,
    /// Serialized receiver outputs.
    pub outputs: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSignRequest {
    pub tx_id: TxId,
    pub amount: u64,
    pub fee: u64,
    pub inputs: Vec<CoinId>,
    pub outputs: Vec<CoinId>,
    pub peer: ReceiverSignature,
}

/// Fully signed transaction ready for registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub kernel_id: KernelId,
    pub body: Vec<u8>,
}

/// Signing/proving service.
///
/// Owns all key material; the engine only ever sees opaque public data and signed blobs.
pub trait KeyKeeper {
    /// Allocate a fresh output of `value`.
    fn generate_coin(
        &mut self,
        value: u64,
        asset_id: AssetId,
        key_type: KeyType,
    ) -> Result<CoinId, KeyKeeperError>;

    fn sender_public_data(
        &mut self,
        tx_id: &TxId,
        inputs: &[CoinId],
        outputs: &[CoinId],
    ) -> Result<SenderPublicData, KeyKeeperError>;

    fn sign_receiver(
        &mut self,
        request: &ReceiverSignRequest,
    ) -> Result<ReceiverSignature, KeyKeeperError>;

    fn sign_sender(&mut self, request: &SenderSignRequest)
    -> Result<SignedTransaction, KeyKeeperError>;
}

/// Coin selection strategy.
pub trait CoinSelector {
    /// Pick coins from `available` covering `amount`, or `None` when funds are insufficient.
    fn select(&self, available: &[Coin], amount: u64) -> Option<Vec<CoinId>>;
}

/// Largest coins first until the amount is covered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestFirstSelector;

impl CoinSelector for LargestFirstSelector {
    fn select(&self, available: &[Coin], amount: u64) -> Option<Vec<CoinId>> {
        let mut coins: Vec<&Coin> = available.iter().collect();
        coins.sort_by(|a, b| b.value().cmp(&a.value()).then(a.id.cmp(&b.id)));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for coin in coins {
            if total >= amount {
                break;
            }
            total = total.saturating_add(coin.value());
            selected.push(coin.id);
        }
        (total >= amount).then_some(selected)
    }
}

/// Outbound peer messaging.
pub trait MessageEndpoint {
    fn send(&mut self, peer: &WalletId, message: SetTxParameter);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coin(idx: u64, value: u64) -> Coin {
        Coin::new(CoinId::new(idx, KeyType::Regular, value))
    }

    #[test]
    fn largest_first_covers_amount() {
        let available = vec![coin(1, 10), coin(2, 50), coin(3, 30)];
        let selected = LargestFirstSelector.select(&available, 70).unwrap();
        assert_eq!(
            selected.iter().map(|c| c.idx).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn insufficient_funds() {
        let available = vec![coin(1, 10)];
        assert!(LargestFirstSelector.select(&available, 11).is_none());
    }
}
