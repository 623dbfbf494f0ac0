//! Progress tracking for wallet synchronization.
//!
//! A sync round starts with the first sync-critical request after the wallet was last in sync and
//! ends when none is outstanding. `SyncProgressTracker` turns the multiplexer's counters into a
//! percentage, logs it, and keeps statistics across rounds.

use crate::wallet::types::Height;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct SyncProgressTracker {
    /// `(done, total)` last reported, to avoid logging unchanged progress
    last_reported: Option<(usize, usize)>,
    /// Completed sync rounds
    rounds_completed: usize,
    /// Chain events applied to the ledger
    events_applied: usize,
    /// Highest height events were applied up to
    highest_event_height: Height,
    rollbacks: usize,
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress of the current round. Returns `(done, total)` when it changed.
    pub fn report(&mut self, total: usize, remains: usize) -> Option<(usize, usize)> {
        let done = total.saturating_sub(remains);
        if self.last_reported == Some((done, total)) {
            return None;
        }
        self.last_reported = Some((done, total));
        if total > 0 {
            info!(
                "Synchronizing with node: {}% ({}/{})",
                Self::percent(done, total),
                done,
                total
            );
        }
        Some((done, total))
    }

    pub fn percent(done: usize, total: usize) -> usize {
        if total == 0 {
            return 100;
        }
        done * 100 / total
    }

    pub fn record_events(&mut self, count: usize, up_to: Height) {
        self.events_applied += count;
        self.highest_event_height = self.highest_event_height.max(up_to);
    }

    pub fn record_rollback(&mut self) {
        self.rollbacks += 1;
    }

    pub fn complete_round(&mut self) {
        self.rounds_completed += 1;
        self.last_reported = None;
    }

    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            rounds_completed: self.rounds_completed,
            events_applied: self.events_applied,
            highest_event_height: self.highest_event_height,
            rollbacks: self.rollbacks,
        }
    }
}

/// Statistics about synchronization since start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub rounds_completed: usize,
    pub events_applied: usize,
    pub highest_event_height: Height,
    pub rollbacks: usize,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "{} sync rounds, {} events applied up to height {}{}",
            self.rounds_completed,
            self.events_applied,
            self.highest_event_height,
            if self.rollbacks == 0 {
                String::new()
            } else {
                format!(" ({} rollbacks)", self.rollbacks)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_progress_is_not_reported_twice() {
        let mut tracker = SyncProgressTracker::new();
        assert_eq!(tracker.report(4, 3), Some((1, 4)));
        assert_eq!(tracker.report(4, 3), None);
        assert_eq!(tracker.report(4, 0), Some((4, 4)));
        tracker.complete_round();
        assert_eq!(tracker.report(0, 0), Some((0, 0)));
    }

    #[test]
    fn percent_of_empty_round_is_complete() {
        assert_eq!(SyncProgressTracker::percent(0, 0), 100);
        assert_eq!(SyncProgressTracker::percent(1, 3), 33);
    }

    #[test]
    fn summary_mentions_rollbacks_only_when_present() {
        let mut tracker = SyncProgressTracker::new();
        tracker.record_events(5, 120);
        tracker.complete_round();
        assert_eq!(
            tracker.get_stats().summary(),
            "1 sync rounds, 5 events applied up to height 120"
        );
        tracker.record_rollback();
        assert!(tracker.get_stats().summary().ends_with("(1 rollbacks)"));
    }
}
