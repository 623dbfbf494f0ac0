//! Wallet observer events.
//!
//! This module defines the notifications the wallet emits while it synchronizes and drives
//! transactions, the handler trait observers implement, and the dispatcher that fans every event
//! out to all registered handlers. Observers are how the runner persists state after a sync round
//! and how front-ends learn about transaction outcomes without polling storage.

use crate::wallet::WalletError;
use crate::wallet::types::{Height, TxId};

use std::cell::RefCell;
use std::rc::Rc;

/// Event buffer shared between an [`EventCollector`] and its owner.
pub type SharedEvents = Rc<RefCell<Vec<WalletEvent>>>;

/// Events emitted by the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// Sync round progress: `done` of `total` sync-critical requests answered
    SyncProgress { done: usize, total: usize },
    /// Sync round finished with the wallet at `height`
    SyncCompleted { height: Height },
    /// Owned node connectivity changed
    OwnedNode { connected: bool },
    TransactionCompleted(TxId),
    TransactionFailed(TxId),
    /// Local state was rolled back to `height`
    RolledBack { height: Height },
}

/// Trait for handling wallet events.
pub trait WalletEventHandler {
    /// Handle a wallet event.
    ///
    /// Called synchronously from the wallet loop; long work should be handed off.
    fn handle(&mut self, event: &WalletEvent) -> Result<(), WalletError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order for each event.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn WalletEventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn WalletEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub fn dispatch(&mut self, event: &WalletEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event) {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handler that collects every event into a shared buffer.
///
/// Used by the async runner to react to sync completion outside the wallet borrow.
pub struct EventCollector {
    events: SharedEvents,
}

impl EventCollector {
    pub fn shared() -> (Self, SharedEvents) {
        let events = SharedEvents::default();
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

impl WalletEventHandler for EventCollector {
    fn handle(&mut self, event: &WalletEvent) -> Result<(), WalletError> {
        self.events.borrow_mut().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EventCollector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingHandler;

    impl WalletEventHandler for FailingHandler {
        fn handle(&mut self, _event: &WalletEvent) -> Result<(), WalletError> {
            Err(WalletError::Storage("disk full".to_string()))
        }

        fn name(&self) -> &'static str {
            "FailingHandler"
        }
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        let mut dispatcher = EventDispatcher::new();
        let (collector, events) = EventCollector::shared();
        dispatcher.register_handler(Box::new(FailingHandler));
        dispatcher.register_handler(Box::new(collector));

        dispatcher.dispatch(&WalletEvent::OwnedNode { connected: true });
        dispatcher.dispatch(&WalletEvent::SyncProgress { done: 1, total: 2 });

        assert_eq!(
            *events.borrow(),
            vec![
                WalletEvent::OwnedNode { connected: true },
                WalletEvent::SyncProgress { done: 1, total: 2 }
            ]
        );
    }
}
