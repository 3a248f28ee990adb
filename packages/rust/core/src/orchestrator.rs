//! Drives one chunk one stage forward per change event.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use relingo_content::{normalize_response, restore_edges};
use relingo_shared::{ChunkKey, ChunkRecord, FailureKind, Result, RetryConfig, Stage};
use relingo_storage::Storage;
use relingo_transform::{TransformError, TransformService};

use crate::retry::{RetryAction, RetryLedger, escalate};
use crate::state::merge;

/// Why an event needed no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No chunk record (job completed, cancelled, or escalated).
    Missing,
    /// Chunk already at the terminal stage; the barrier owns it.
    Terminal,
    /// Chunk is waiting out a retry backoff; a later event will wake it.
    NotDue,
    /// Chunk records exist but the job row does not.
    Orphaned,
}

/// Result of handling one change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced { from: Stage, to: Stage },
    /// Someone else already moved the chunk; the write was discarded.
    Rejected,
    Skipped(SkipReason),
    RetryScheduled { attempt: u32, delay: Duration },
    Escalated { kind: FailureKind },
}

/// Reacts to chunk change events by calling the transform service for the
/// chunk's next stage.
pub struct Orchestrator {
    storage: Arc<Storage>,
    transform: Arc<dyn TransformService>,
    ledger: RetryLedger,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        transform: Arc<dyn TransformService>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            storage,
            transform,
            ledger: RetryLedger::new(retry),
        }
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Advance the chunk at `key` by one stage, or record why it failed.
    ///
    /// Safe under duplicate and out-of-order delivery: the stage write is
    /// conditional, so repeated calls never advance a chunk twice.
    #[instrument(skip_all, fields(job_id = %key.job_id, chunk_index = key.chunk_index))]
    pub async fn handle(&self, key: &ChunkKey, now: DateTime<Utc>) -> Result<StepOutcome> {
        let Some(chunk) = self.storage.get_chunk(key).await? else {
            debug!("chunk gone, nothing to do");
            return Ok(StepOutcome::Skipped(SkipReason::Missing));
        };

        let Some(next) = chunk.stage.next() else {
            debug!("chunk already terminal");
            return Ok(StepOutcome::Skipped(SkipReason::Terminal));
        };

        if chunk.next_attempt_at > now {
            debug!(next_attempt_at = %chunk.next_attempt_at, "chunk in backoff");
            return Ok(StepOutcome::Skipped(SkipReason::NotDue));
        }

        let Some(job) = self.storage.get_job(&key.job_id).await? else {
            warn!("chunk has no job, removing leftovers");
            self.storage.delete_chunks(&key.job_id).await?;
            return Ok(StepOutcome::Skipped(SkipReason::Orphaned));
        };

        let language = match next {
            Stage::Translated | Stage::Improved => Some(job.target_language.as_str()),
            _ => None,
        };

        match self.produce(&chunk, next, language).await {
            Ok(content) => self.commit(&chunk, next, content, now).await,
            Err(err) => self.fail(&chunk, next, err, now).await,
        }
    }

    /// Content for `next`: the provider's answer, or the unchanged text for
    /// whitespace-only chunks.
    async fn produce(
        &self,
        chunk: &ChunkRecord,
        next: Stage,
        language: Option<&str>,
    ) -> std::result::Result<String, TransformError> {
        if chunk.content.trim().is_empty() {
            return Ok(chunk.content.clone());
        }

        let raw = self.transform.transform(next, &chunk.content, language).await?;
        let content = normalize_response(&raw);
        if content.is_empty() {
            return Err(TransformError::Transient(
                "response was empty after normalization".into(),
            ));
        }
        Ok(restore_edges(&chunk.content, &content))
    }

    async fn commit(
        &self,
        chunk: &ChunkRecord,
        next: Stage,
        content: String,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let merged = merge(chunk, next, content, now);
        if !merged.accepted {
            debug!(stage = %chunk.stage, proposed = %next, "stale transition discarded");
            return Ok(StepOutcome::Rejected);
        }

        let key = chunk.key();
        let accepted = self
            .storage
            .advance_chunk(&key, merged.record.stage, &merged.record.content, now)
            .await?;

        if accepted {
            info!(from = %chunk.stage, to = %next, "chunk advanced");
            Ok(StepOutcome::Advanced {
                from: chunk.stage,
                to: next,
            })
        } else {
            debug!(proposed = %next, "chunk advanced concurrently, write discarded");
            Ok(StepOutcome::Rejected)
        }
    }

    async fn fail(
        &self,
        chunk: &ChunkRecord,
        next: Stage,
        err: TransformError,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let kind = err.failure_kind();
        let attempt = chunk.retry_count + 1;
        let key = chunk.key();

        if kind == FailureKind::RateLimited {
            self.storage.record_rate_limit(&key.job_id, now).await?;
        }

        match self.ledger.decide(chunk.retry_count, kind) {
            RetryAction::RetryAfter(delay) => {
                let accepted = self
                    .storage
                    .schedule_retry(&key, chunk.stage, chunk.retry_count, now, now + delay)
                    .await?;
                if !accepted {
                    debug!("chunk changed concurrently, retry not recorded");
                    return Ok(StepOutcome::Rejected);
                }
                warn!(
                    stage = %next,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transform failed, retry scheduled"
                );
                Ok(StepOutcome::RetryScheduled { attempt, delay })
            }
            RetryAction::Escalate => {
                let reason = format!(
                    "chunk {} failed to reach {next} after {attempt} attempt(s): {err}",
                    chunk.chunk_index
                );
                escalate(
                    &self.storage,
                    &key.job_id,
                    Some(chunk.chunk_index),
                    kind,
                    &reason,
                    now,
                )
                .await?;
                Ok(StepOutcome::Escalated { kind })
            }
        }
    }
}
