//! Applies pages of chain events to the coin ledger.
//!
//! Events arrive in height order, at most `page_max` per page. Applying a page is idempotent:
//! heights only ever move down to the lowest reported value, so a page delivered twice (for
//! instance after a restart before the cursor was saved) leaves the ledger unchanged.

use crate::node::{AssetEvent, ChainEvent, Event, ShieldedEvent, UtxoEvent};
use crate::transaction::parameters::{ParameterId, TxParameterStore};
use crate::wallet::WalletError;
use crate::wallet::ledger::{CoinLedger, min_height};
use crate::wallet::storage::{VarStore, WalletStore};
use crate::wallet::types::*;

use tracing::{debug, info};

/// Result of applying one page of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventsPage {
    pub applied: usize,
    /// Height of the last applied event
    pub last_height: Option<Height>,
    /// The page was full; the next one must be requested
    pub more: bool,
}

#[derive(Debug, Clone)]
pub struct EventProcessor {
    page_max: usize,
}

impl EventProcessor {
    pub fn new(page_max: usize) -> Self {
        Self { page_max }
    }

    pub fn page_max(&self) -> usize {
        self.page_max
    }

    /// Apply a page and move the event cursor.
    ///
    /// `active` are the transactions currently driven by the wallet; a confirmed coin that one of
    /// them spends is recorded as spent by it.
    pub fn apply(
        &self,
        store: &mut dyn WalletStore,
        events: &[ChainEvent],
        active: &[TxId],
    ) -> Result<EventsPage, WalletError> {
        let mut last_height = None;
        for event in events {
            match &event.body {
                Event::Utxo(e) => Self::process_utxo(store, e, event.height, active),
                Event::Shielded(e) => Self::process_shielded(store, e, event.height, active),
                Event::Asset(e) => Self::process_asset(store, e, event.height),
            }
            last_height = Some(event.height);
        }

        let more = events.len() >= self.page_max;
        match last_height {
            Some(h) if more => Self::set_events_height(store, h)?,
            _ => {
                let tip = store.history().get_tip().map_or(0, |s| s.height);
                Self::set_events_height(store, tip)?;
            }
        }

        Ok(EventsPage {
            applied: events.len(),
            last_height,
            more,
        })
    }

    /// Record that events up to and including `height` were processed.
    pub fn set_events_height(
        store: &mut dyn WalletStore,
        height: Height,
    ) -> Result<(), WalletError> {
        store.set_next_event_height(height + 1)
    }

    pub fn process_utxo(
        store: &mut dyn WalletStore,
        event: &UtxoEvent,
        height: Height,
        active: &[TxId],
    ) {
        let existing = store.find_coin(&event.coin);
        let exists = existing.is_some();
        let mut coin = existing.unwrap_or_else(|| Coin::new(event.coin));
        coin.maturity = event.maturity;

        info!(
            "CoinID: {} Maturity={} {}, Height={}",
            coin.id,
            event.maturity,
            if event.added { "Confirmed" } else { "Spent" },
            height
        );

        if event.added {
            coin.confirm_height = Some(min_height(coin.confirm_height, height));

            // Inputs of an active transaction may be confirmed after the transaction reserved them.
            for tx_id in active {
                let inputs: Vec<CoinId> = store
                    .get_tx_param(tx_id, DEFAULT_SUB_TX_ID, ParameterId::InputCoins)
                    .unwrap_or_default();
                if inputs.contains(&coin.id) {
                    coin.spent_tx_id = Some(*tx_id);
                    info!("CoinID: {} marked as Outgoing", coin.id);
                }
            }
        } else {
            if !exists {
                debug!("Ignoring spend of unknown coin {}", coin.id);
                return;
            }
            coin.spent_height = Some(min_height(coin.spent_height, height));
        }

        CoinLedger::new(store).save(coin);
    }

    pub fn process_shielded(
        store: &mut dyn WalletStore,
        event: &ShieldedEvent,
        height: Height,
        active: &[TxId],
    ) {
        let mut coin = store
            .find_shielded_coin(event.txo_id)
            .unwrap_or_else(|| ShieldedCoin::new(event.coin, event.txo_id));
        coin.id = event.coin;
        coin.visibility = if event.outgoing {
            ShieldedVisibility::Observed
        } else {
            ShieldedVisibility::Mine
        };

        if event.added {
            coin.confirm_height = Some(min_height(coin.confirm_height, height));
        } else {
            coin.spent_height = Some(min_height(coin.spent_height, height));
        }

        for tx_id in active {
            let inputs: Vec<ShieldedCoinId> = store
                .get_tx_param(tx_id, DEFAULT_SUB_TX_ID, ParameterId::InputCoinsShielded)
                .unwrap_or_default();
            if inputs.contains(&event.coin) {
                coin.spent_tx_id = Some(*tx_id);
                info!("Shielded output, ID: {} marked as Outgoing", event.txo_id);
            }
        }

        CoinLedger::new(store).save_shielded(coin);
        info!(
            "Shielded output, ID: {} {}, Height={}",
            event.txo_id,
            if event.added { "Confirmed" } else { "Spent" },
            height
        );
    }

    pub fn process_asset(store: &mut dyn WalletStore, event: &AssetEvent, height: Height) {
        let id = event.info.id;
        if !event.added {
            if store.drop_asset(id) {
                info!("Asset {} unregistered at {}", id, height);
            }
            return;
        }

        let is_owned = store.find_asset(id).is_some_and(|a| a.is_owned);
        let mut asset = WalletAsset::new(event.info.clone(), height);
        asset.is_owned = is_owned;
        store.save_asset(&asset);
        debug!("Asset {} updated at {}", id, height);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::storage::MemoryWalletStore;

    fn store_at(height: Height) -> MemoryWalletStore {
        let mut store = MemoryWalletStore::new();
        store.history_mut().add_states(&[ChainState {
            height,
            hash: BlockHash::default(),
            timestamp: 0,
        }]);
        store
    }

    fn coin_id(idx: u64) -> CoinId {
        CoinId::new(idx, KeyType::Regular, 100)
    }

    #[test]
    fn short_page_moves_cursor_to_tip() {
        let mut store = store_at(50);
        let processor = EventProcessor::new(4);
        let page = processor
            .apply(&mut store, &[ChainEvent::utxo(10, coin_id(1), 10, true)], &[])
            .unwrap();
        assert!(!page.more);
        assert_eq!(store.next_event_height(), 51);
    }

    #[test]
    fn full_page_moves_cursor_to_last_event() {
        let mut store = store_at(50);
        let processor = EventProcessor::new(2);
        let events = [
            ChainEvent::utxo(10, coin_id(1), 10, true),
            ChainEvent::utxo(12, coin_id(2), 12, true),
        ];
        let page = processor.apply(&mut store, &events, &[]).unwrap();
        assert!(page.more);
        assert_eq!(page.last_height, Some(12));
        assert_eq!(store.next_event_height(), 13);
    }

    #[test]
    fn replay_is_idempotent() {
        let mut store = store_at(50);
        let processor = EventProcessor::new(64);
        let events = [
            ChainEvent::utxo(10, coin_id(1), 10, true),
            ChainEvent::utxo(15, coin_id(1), 10, false),
            ChainEvent::utxo(20, coin_id(2), 20, true),
        ];
        processor.apply(&mut store, &events, &[]).unwrap();
        let once = store.snapshot();
        processor.apply(&mut store, &events, &[]).unwrap();
        assert_eq!(store.snapshot(), once);

        let spent = store.find_coin(&coin_id(1)).unwrap();
        assert_eq!(spent.confirm_height, Some(10));
        assert_eq!(spent.spent_height, Some(15));
        assert_eq!(spent.status, CoinStatus::Spent);
    }

    #[test]
    fn spend_of_unknown_coin_is_ignored() {
        let mut store = store_at(50);
        EventProcessor::process_utxo(
            &mut store,
            &UtxoEvent {
                coin: coin_id(9),
                maturity: 0,
                added: false,
            },
            30,
            &[],
        );
        assert!(store.find_coin(&coin_id(9)).is_none());
    }

    #[test]
    fn shielded_input_of_active_tx_is_outgoing() {
        let mut store = store_at(50);
        let tx_id = TxId([4; 16]);
        let mine = ShieldedCoinId {
            key: 1,
            value: 500,
            asset_id: NATIVE_ASSET_ID,
        };
        store
            .set_tx_param(
                &tx_id,
                DEFAULT_SUB_TX_ID,
                ParameterId::Status,
                &crate::transaction::TxStatus::InProgress,
            )
            .unwrap();
        store
            .set_tx_param(
                &tx_id,
                DEFAULT_SUB_TX_ID,
                ParameterId::InputCoinsShielded,
                &vec![mine],
            )
            .unwrap();

        let event = ShieldedEvent {
            coin: mine,
            txo_id: 77,
            added: true,
            outgoing: false,
        };
        EventProcessor::process_shielded(&mut store, &event, 30, &[tx_id]);
        EventProcessor::process_shielded(&mut store, &event, 32, &[tx_id]);

        let coin = store.find_shielded_coin(77).unwrap();
        assert_eq!(coin.confirm_height, Some(30));
        assert_eq!(coin.spent_tx_id, Some(tx_id));
        assert_eq!(coin.visibility, ShieldedVisibility::Mine);
        assert_eq!(coin.status, CoinStatus::Outgoing);

        // Not an input of the active transaction: stays ours and spendable.
        let other = ShieldedCoinId { key: 2, ..mine };
        EventProcessor::process_shielded(
            &mut store,
            &ShieldedEvent {
                coin: other,
                txo_id: 78,
                added: true,
                outgoing: false,
            },
            31,
            &[tx_id],
        );
        let coin = store.find_shielded_coin(78).unwrap();
        assert!(coin.spent_tx_id.is_none());
        assert_eq!(coin.status, CoinStatus::Unspent);

        EventProcessor::process_shielded(
            &mut store,
            &ShieldedEvent {
                coin: other,
                txo_id: 78,
                added: false,
                outgoing: false,
            },
            40,
            &[],
        );
        assert_eq!(store.find_shielded_coin(78).unwrap().status, CoinStatus::Spent);
    }

    #[test]
    fn asset_events_update_table() {
        let mut store = store_at(50);
        let info = AssetInfo {
            id: 3,
            ..AssetInfo::default()
        };
        EventProcessor::process_asset(
            &mut store,
            &AssetEvent {
                info: info.clone(),
                added: true,
            },
            40,
        );
        assert_eq!(store.find_asset(3).unwrap().refresh_height, 40);
        EventProcessor::process_asset(&mut store, &AssetEvent { info, added: false }, 41);
        assert!(store.find_asset(3).is_none());
    }
}
