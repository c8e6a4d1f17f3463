//! Engine counters.

use serde::{Deserialize, Serialize};

/// Counters describing the engine's traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    /// Server data updates applied.
    pub data_updates: u64,
    /// Puts and merges sent, transactions included.
    pub writes_sent: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions finished without committing.
    pub transactions_aborted: u64,
    /// Remote listens started.
    pub listens_started: u64,
    /// Remote listens stopped.
    pub listens_stopped: u64,
}

impl RepoStats {
    /// Counts that changed since `earlier`.
    pub fn delta_since(&self, earlier: &RepoStats) -> RepoStats {
        RepoStats {
            data_updates: self.data_updates.saturating_sub(earlier.data_updates),
            writes_sent: self.writes_sent.saturating_sub(earlier.writes_sent),
            transactions_started: self
                .transactions_started
                .saturating_sub(earlier.transactions_started),
            transactions_committed: self
                .transactions_committed
                .saturating_sub(earlier.transactions_committed),
            transactions_aborted: self
                .transactions_aborted
                .saturating_sub(earlier.transactions_aborted),
            listens_started: self.listens_started.saturating_sub(earlier.listens_started),
            listens_stopped: self.listens_stopped.saturating_sub(earlier.listens_stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta() {
        let earlier = RepoStats {
            writes_sent: 2,
            ..Default::default()
        };
        let now = RepoStats {
            writes_sent: 5,
            data_updates: 1,
            ..Default::default()
        };
        let delta = now.delta_since(&earlier);
        assert_eq!(delta.writes_sent, 3);
        assert_eq!(delta.data_updates, 1);
    }

    #[test]
    fn serializes_to_json() {
        let stats = RepoStats {
            listens_started: 4,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["listens_started"], 4);
        let back: RepoStats = serde_json::from_value(json).unwrap();
        assert_eq!(back, stats);
    }
}
