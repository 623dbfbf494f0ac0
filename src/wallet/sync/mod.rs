//! Wallet synchronization.
//!
//! This module holds the engine that keeps a wallet in step with a node and the services it is
//! composed of:
//!
//! - `orchestrator`: the [`Wallet`] engine. Routes node notifications, gates transaction updates
//!   on sync state and executes the actions transactions record.
//! - `multiplexer`: correlates outstanding node requests with their owners and counts the
//!   sync-critical ones.
//! - `event_processor`: applies pages of chain events to the coin ledger.
//! - `rollback`: forgets state above a reorganization point and re-queues affected transactions.
//! - `events`: observer events emitted by the wallet and the dispatcher that fans them out.
//! - `progress_tracker`: sync round progress and statistics.
//! - `repositories` / `state_persistence`: saving the store between runs.
//! - `service`: the async runner wiring a wallet to a node client.

/// Applies chain events to the ledger
pub mod event_processor;
/// Event system for decoupled communication with observers
pub mod events;
/// Request correlation and sync accounting
pub mod multiplexer;
/// Main coordinator of the wallet engine
pub mod orchestrator;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Storage backends for wallet snapshots
pub mod repositories;
/// Chain reorganization handling
pub mod rollback;
/// Async runner connecting the engine to a node
pub mod service;
/// Snapshot save/restore service
pub mod state_persistence;

pub use events::{EventCollector, EventDispatcher, SharedEvents, WalletEvent, WalletEventHandler};
pub use multiplexer::{PendingRequest, RequestKey, RequestMultiplexer};
pub use orchestrator::Wallet;
pub use service::{WalletService, load_or_create_wallet_id};
pub use state_persistence::StatePersistenceService;
