//! Compaction configuration and bookkeeping.
//!
//! Compaction rewrites the reachable history into a single snapshot node and
//! discards every other block. It is irreversible: cursors taken before it
//! become stale.

use cinder_merkle::Cid;
use serde::{Deserialize, Serialize};

/// Configuration for compaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Whether to compact automatically after writes.
    pub auto_compact: bool,

    /// Minimum batches written since the last compaction before an
    /// automatic compaction is considered.
    pub min_ops_for_compaction: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            auto_compact: false,
            min_ops_for_compaction: 100,
        }
    }
}

impl CompactionConfig {
    pub fn should_compact(&self, stats: &CompactionStats) -> bool {
        self.auto_compact && stats.ops_since_compaction >= self.min_ops_for_compaction.max(1)
    }
}

/// Statistics about compaction operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Total compactions performed.
    pub compactions: u64,

    /// Total blocks discarded across all compactions.
    pub blocks_discarded: u64,

    /// Batches written since the last compaction.
    pub ops_since_compaction: u64,

    /// Snapshot node of the last compaction.
    pub last_compaction: Option<Cid>,
}

impl CompactionStats {
    pub(crate) fn record_write(&mut self) {
        self.ops_since_compaction += 1;
    }

    pub(crate) fn record_compaction(&mut self, snapshot: Cid, discarded: usize) {
        self.compactions += 1;
        self.blocks_discarded += discarded as u64;
        self.ops_since_compaction = 0;
        self.last_compaction = Some(snapshot);
    }
}
