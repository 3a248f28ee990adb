//! Retry budget, backoff policy, and failure escalation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use relingo_shared::{FailureKind, FailureRecord, JobId, Result, RetryConfig};
use relingo_storage::Storage;

// ---------------------------------------------------------------------------
// Backoff policy
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * multiplier^attempt`, capped.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt + 1` (`attempt` failures so far, zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

// ---------------------------------------------------------------------------
// Retry ledger
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    RetryAfter(Duration),
    Escalate,
}

/// Decides between retry-with-backoff and escalation.
#[derive(Debug, Clone)]
pub struct RetryLedger {
    max_attempts: u32,
    transient: BackoffPolicy,
    rate_limited: BackoffPolicy,
}

impl RetryLedger {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            transient: BackoffPolicy {
                base: config.base_delay,
                multiplier: config.multiplier,
                cap: config.max_delay,
            },
            rate_limited: BackoffPolicy {
                base: config.rate_limited_base_delay,
                multiplier: config.multiplier,
                cap: config.max_delay,
            },
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the action for a failure of `kind`, given `retry_count`
    /// earlier failures at the same stage.
    ///
    /// With `max_attempts = N`, the N-th consecutive failure escalates, so at
    /// most N calls are made per stage. Failures that retrying cannot fix
    /// escalate at once without consuming budget.
    pub fn decide(&self, retry_count: u32, kind: FailureKind) -> RetryAction {
        let policy = match kind {
            FailureKind::Transient => &self.transient,
            FailureKind::RateLimited => &self.rate_limited,
            FailureKind::InvalidInput | FailureKind::DeliveryExhausted | FailureKind::Invariant => {
                return RetryAction::Escalate;
            }
        };

        if retry_count.saturating_add(1) >= self.max_attempts {
            RetryAction::Escalate
        } else {
            RetryAction::RetryAfter(policy.delay(retry_count))
        }
    }

    /// Backoff for redelivering a change event whose handler errored out.
    pub fn redelivery_delay(&self, deliveries: u32) -> Duration {
        self.transient.delay(deliveries.saturating_sub(1))
    }
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

/// Permanently fail a job: write its FailureRecord, then delete its chunk
/// records and the job itself so it leaves the in-flight count.
///
/// Returns `false` if the job row was already gone; nothing can be keyed by
/// `(source_url, target_language)` then, so only leftover chunks are removed.
pub async fn escalate(
    storage: &Storage,
    job_id: &JobId,
    chunk_index: Option<u32>,
    kind: FailureKind,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(job) = storage.get_job(job_id).await? else {
        warn!(%job_id, %kind, reason, "escalating job that no longer exists");
        storage.delete_chunks(job_id).await?;
        return Ok(false);
    };

    let record = FailureRecord {
        source_url: job.source_url.clone(),
        target_language: job.target_language.clone(),
        job_id: job_id.clone(),
        chunk_index,
        kind,
        reason: reason.to_string(),
        created_at: now,
        updated_at: now,
    };
    storage.upsert_failure(&record).await?;

    let chunks = storage.delete_chunks(job_id).await?;
    storage.delete_job(job_id).await?;

    error!(
        %job_id,
        source_url = %job.source_url,
        target_language = %job.target_language,
        chunk_index = ?chunk_index,
        %kind,
        chunks,
        reason,
        "job permanently failed"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn ledger(max_attempts: u32) -> RetryLedger {
        RetryLedger::new(&RetryConfig {
            max_attempts,
            base_delay: Duration::from_secs(1),
            rate_limited_base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        })
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn transient_retries_until_budget_is_spent() {
        let ledger = ledger(5);
        for retry_count in 0..4 {
            assert!(matches!(
                ledger.decide(retry_count, FailureKind::Transient),
                RetryAction::RetryAfter(_)
            ));
        }
        assert_eq!(ledger.decide(4, FailureKind::Transient), RetryAction::Escalate);
    }

    #[test]
    fn rate_limited_uses_longer_base_delay() {
        let ledger = ledger(5);
        assert_eq!(
            ledger.decide(0, FailureKind::RateLimited),
            RetryAction::RetryAfter(Duration::from_secs(60))
        );
        assert_eq!(
            ledger.decide(1, FailureKind::RateLimited),
            RetryAction::RetryAfter(Duration::from_secs(120))
        );
        assert_eq!(
            ledger.decide(0, FailureKind::Transient),
            RetryAction::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn invalid_input_escalates_immediately() {
        let ledger = ledger(5);
        assert_eq!(ledger.decide(0, FailureKind::InvalidInput), RetryAction::Escalate);
        assert_eq!(ledger.decide(0, FailureKind::Invariant), RetryAction::Escalate);
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        assert_eq!(ledger(1).decide(0, FailureKind::Transient), RetryAction::Escalate);
    }

    #[tokio::test]
    async fn escalate_records_failure_and_cleans_up() {
        let storage = test_storage().await;
        let job = seed_job(&storage, "https://example.com/fail", "<h1>A</h1><h2>B</h2>").await;
        dispatch_all(&storage).await;
        assert!(storage.job_has_chunks(&job.id).await.unwrap());

        let written = escalate(
            &storage,
            &job.id,
            Some(1),
            FailureKind::RateLimited,
            "rate limited 5 times",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(written);

        let failure = storage
            .get_failure(&job.source_url, &job.target_language)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.chunk_index, Some(1));
        assert_eq!(failure.kind, FailureKind::RateLimited);
        assert!(!storage.job_has_chunks(&job.id).await.unwrap());
        assert!(storage.get_job(&job.id).await.unwrap().is_none());
        assert_eq!(storage.count_in_flight_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn escalate_missing_job_writes_nothing() {
        let storage = test_storage().await;
        let written = escalate(
            &storage,
            &JobId::new(),
            None,
            FailureKind::DeliveryExhausted,
            "gone",
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!written);
        assert!(storage.list_failures().await.unwrap().is_empty());
    }
}
