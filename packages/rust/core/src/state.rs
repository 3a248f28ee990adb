//! Monotonic merge rule for chunk stage transitions.
//!
//! The store applies the same rule atomically (`Storage::advance_chunk`);
//! this is the pure form the orchestrator checks before writing.

use chrono::{DateTime, Utc};
use relingo_shared::{ChunkRecord, Stage};

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The record after the merge: the proposed state if accepted, the
    /// current record unchanged otherwise.
    pub record: ChunkRecord,
    pub accepted: bool,
}

/// Merge a proposed stage/content into the current record.
///
/// Accepted only if `proposed_stage` ranks strictly higher than the stored
/// stage; acceptance resets the chunk's retry budget.
pub fn merge(
    current: &ChunkRecord,
    proposed_stage: Stage,
    proposed_content: String,
    now: DateTime<Utc>,
) -> MergeOutcome {
    if proposed_stage.rank() <= current.stage.rank() {
        return MergeOutcome {
            record: current.clone(),
            accepted: false,
        };
    }

    MergeOutcome {
        record: ChunkRecord {
            stage: proposed_stage,
            content: proposed_content,
            retry_count: 0,
            next_attempt_at: now,
            updated_at: now,
            ..current.clone()
        },
        accepted: true,
    }
}
