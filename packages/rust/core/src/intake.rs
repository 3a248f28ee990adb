//! Job intake and dispatch: from a submitted job to partitioned chunk records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use url::Url;

use relingo_content::{PartitionOptions, partition_with};
use relingo_shared::{
    ChunkRecord, Destination, FailureKind, Job, JobId, PipelineConfig, RelingoError, Result,
};
use relingo_storage::Storage;

use crate::admission::{Admission, AdmissionController};
use crate::retry::escalate;

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// A request to rewrite one scraped document into one language.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source_url: String,
    pub target_language: String,
    pub destination: Destination,
}

/// Validate and store a new job. The store enqueues its dispatch message in
/// the same write.
pub async fn submit_job(storage: &Storage, request: SubmitRequest) -> Result<Job> {
    let source_url = parse_http_url(&request.source_url, "source URL")?;
    parse_http_url(&request.destination.blog_url, "blog URL")?;

    let target_language = request.target_language.trim();
    if target_language.is_empty() {
        return Err(RelingoError::validation("target language must not be empty"));
    }

    let job = Job {
        id: JobId::new(),
        source_url: source_url.to_string(),
        target_language: target_language.to_string(),
        destination: request.destination,
        created_at: Utc::now(),
    };
    storage.insert_job(&job).await?;

    info!(
        job_id = %job.id,
        source_url = %job.source_url,
        target_language = %job.target_language,
        "job submitted"
    );
    Ok(job)
}

/// Store scraped content for `source_url`, replacing any earlier scrape.
pub async fn ingest_content(storage: &Storage, source_url: &str, content: &str) -> Result<String> {
    let url = parse_http_url(source_url, "source URL")?;
    storage.put_raw_content(url.as_str(), content).await?;
    info!(source_url = %url, bytes = content.len(), "raw content stored");
    Ok(url.to_string())
}

fn parse_http_url(raw: &str, what: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| RelingoError::validation(format!("invalid {what} '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(RelingoError::validation(format!(
            "{what} must be http or https, got '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Result of one [`Dispatcher::dispatch_once`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No visible dispatch message.
    Idle,
    /// The job was partitioned; `inserted` is lower than `chunks` on redelivery.
    Dispatched {
        job_id: JobId,
        chunks: u32,
        inserted: u64,
    },
    /// Returned to the queue for a later attempt.
    Deferred { job_id: JobId, reason: String },
    /// The job no longer exists (cancelled or already finished).
    Dropped { job_id: JobId },
    /// The job was permanently failed.
    Escalated { job_id: JobId },
}

/// Consumes the job queue, gates each job through admission, and
/// partitions admitted jobs into chunk records.
///
/// Admission is check-then-act, so one process must own dispatching; the
/// worker calls [`Dispatcher::dispatch_once`] serially.
pub struct Dispatcher {
    storage: Arc<Storage>,
    admission: AdmissionController,
    partition: PartitionOptions,
    config: PipelineConfig,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>, admission: AdmissionController, config: PipelineConfig) -> Self {
        Self {
            storage,
            admission,
            partition: PartitionOptions {
                max_heading_level: config.max_heading_level,
            },
            config,
        }
    }

    #[instrument(skip_all)]
    pub async fn dispatch_once(&self, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let Some(message) = self.storage.claim_dispatch(now, self.config.job_lease).await? else {
            return Ok(DispatchOutcome::Idle);
        };
        let job_id = message.job_id.clone();
        let retry_at = now + self.config.job_lease;

        let Some(job) = self.storage.get_job(&job_id).await? else {
            debug!(%job_id, "job gone, dropping dispatch message");
            self.storage.ack_dispatch(message.id).await?;
            return Ok(DispatchOutcome::Dropped { job_id });
        };

        if message.receives > self.config.max_deliveries {
            let reason = format!(
                "dispatch delivered {} times without completing",
                message.receives
            );
            escalate(&self.storage, &job_id, None, FailureKind::DeliveryExhausted, &reason, now)
                .await?;
            self.storage.ack_dispatch(message.id).await?;
            return Ok(DispatchOutcome::Escalated { job_id });
        }

        let Some(raw) = self.storage.get_raw_content(&job.source_url).await? else {
            if message.receives >= self.config.max_deliveries {
                let reason = format!(
                    "no scraped content for {} after {} attempts",
                    job.source_url, message.receives
                );
                escalate(&self.storage, &job_id, None, FailureKind::InvalidInput, &reason, now)
                    .await?;
                self.storage.ack_dispatch(message.id).await?;
                return Ok(DispatchOutcome::Escalated { job_id });
            }
            warn!(%job_id, source_url = %job.source_url, receives = message.receives, "raw content missing");
            self.storage.release_dispatch(message.id, retry_at).await?;
            return Ok(DispatchOutcome::Deferred {
                job_id,
                reason: "raw content missing".into(),
            });
        };

        match self.admission.try_admit(&self.storage, &job_id, now).await? {
            Admission::Admitted | Admission::AlreadyInFlight => {}
            Admission::Deferred {
                in_flight,
                limit,
                circuit_open,
            } => {
                self.storage.defer_dispatch(message.id, retry_at).await?;
                let reason = if circuit_open {
                    "rate-limit circuit open".to_string()
                } else {
                    format!("{in_flight} of {limit} job slots in use")
                };
                return Ok(DispatchOutcome::Deferred { job_id, reason });
            }
        }

        let parts = partition_with(&raw, &self.partition);
        if parts.is_empty() {
            escalate(
                &self.storage,
                &job_id,
                None,
                FailureKind::InvalidInput,
                "scraped content is empty",
                now,
            )
            .await?;
            self.storage.ack_dispatch(message.id).await?;
            return Ok(DispatchOutcome::Escalated { job_id });
        }

        let total = parts.len() as u32;
        let records: Vec<ChunkRecord> = parts
            .into_iter()
            .enumerate()
            .map(|(i, content)| ChunkRecord::initial(job_id.clone(), i as u32, total, content))
            .collect();
        let inserted = self.storage.insert_chunks(&records).await?;
        self.storage.ack_dispatch(message.id).await?;

        info!(%job_id, chunks = total, inserted, "job partitioned");
        Ok(DispatchOutcome::Dispatched {
            job_id,
            chunks: total,
            inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::*;
    use relingo_shared::{CircuitConfig, Stage};

    fn dispatcher(storage: Arc<Storage>, limit: u32) -> Dispatcher {
        let mut config = pipeline_config();
        config.concurrency_limit = limit;
        let admission = AdmissionController::new(
            limit,
            CircuitConfig {
                trip_after: 0,
                window: Duration::from_secs(60),
            },
        );
        Dispatcher::new(storage, admission, config)
    }

    fn request(url: &str) -> SubmitRequest {
        SubmitRequest {
            source_url: url.into(),
            target_language: "Spanish".into(),
            destination: Destination {
                blog_url: "https://blog.example.com".into(),
                username: "editor".into(),
                password: "secret".into(),
            },
        }
    }

    #[tokio::test]
    async fn submit_validates_input() {
        let storage = test_storage().await;

        let err = submit_job(&storage, request("ftp://example.com/a")).await.unwrap_err();
        assert!(matches!(err, RelingoError::Validation { .. }));

        let mut blank = request("https://example.com/a");
        blank.target_language = "  ".into();
        assert!(submit_job(&storage, blank).await.is_err());

        let mut bad_blog = request("https://example.com/a");
        bad_blog.destination.blog_url = "not a url".into();
        assert!(submit_job(&storage, bad_blog).await.is_err());

        assert_eq!(storage.count_pending_dispatch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn submit_enqueues_dispatch() {
        let storage = test_storage().await;
        let job = submit_job(&storage, request("https://example.com/post")).await.unwrap();
        assert_eq!(job.target_language, "Spanish");
        assert!(storage.get_job(&job.id).await.unwrap().is_some());
        assert_eq!(storage.count_pending_dispatch().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dispatch_partitions_job() {
        let storage = Arc::new(test_storage().await);
        let job = seed_job(&storage, "https://example.com/p", "<h1>A</h1><p>a</p><h2>B</h2><p>b</p>").await;
        let d = dispatcher(storage.clone(), 4);

        let outcome = d.dispatch_once(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                job_id: job.id.clone(),
                chunks: 2,
                inserted: 2
            }
        );
        let chunks = storage.list_chunks(&job.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.stage == Stage::Initial && c.total_chunks == 2));
        assert_eq!(
            chunks.iter().map(|c| c.content.as_str()).collect::<String>(),
            "<h1>A</h1><p>a</p><h2>B</h2><p>b</p>"
        );
        assert_eq!(d.dispatch_once(Utc::now()).await.unwrap(), DispatchOutcome::Idle);
    }

    #[tokio::test]
    async fn configured_heading_level_limits_cuts() {
        let storage = Arc::new(test_storage().await);
        let raw = "# A\na\n## B\nb\n# C\nc\n";
        let job = seed_job(&storage, "https://example.com/levels", raw).await;
        let mut config = pipeline_config();
        config.max_heading_level = 1;
        let admission = AdmissionController::new(
            4,
            CircuitConfig {
                trip_after: 0,
                window: Duration::from_secs(60),
            },
        );
        let d = Dispatcher::new(storage.clone(), admission, config);

        d.dispatch_once(Utc::now()).await.unwrap();
        let chunks = storage.list_chunks(&job.id).await.unwrap();
        assert_eq!(
            chunks.iter().map(|c| c.content.as_str()).collect::<Vec<_>>(),
            vec!["# A\na\n## B\nb\n", "# C\nc\n"]
        );
    }

    #[tokio::test]
    async fn full_slots_defer_without_spending_deliveries() {
        let storage = Arc::new(test_storage().await);
        let first = seed_job(&storage, "https://example.com/1", "<p>1</p>").await;
        let second = seed_job(&storage, "https://example.com/2", "<p>2</p>").await;
        let d = dispatcher(storage.clone(), 1);
        let now = Utc::now();

        assert!(matches!(
            d.dispatch_once(now).await.unwrap(),
            DispatchOutcome::Dispatched { .. }
        ));
        for round in 0..10 {
            let later = now + chrono::Duration::hours(round + 1);
            let outcome = d.dispatch_once(later).await.unwrap();
            assert!(
                matches!(&outcome, DispatchOutcome::Deferred { job_id, .. } if *job_id == second.id),
                "round {round}: {outcome:?}"
            );
        }
        assert!(storage.get_job(&second.id).await.unwrap().is_some());
        assert!(storage.list_failures().await.unwrap().is_empty());
        assert!(storage.job_has_chunks(&first.id).await.unwrap());
        assert!(!storage.job_has_chunks(&second.id).await.unwrap());
    }

    #[tokio::test]
    async fn missing_content_escalates_after_budget() {
        let storage = Arc::new(test_storage().await);
        let job = submit_job(&storage, request("https://example.com/unscraped")).await.unwrap();
        let d = dispatcher(storage.clone(), 4);
        let mut now = Utc::now();

        for _ in 1..pipeline_config().max_deliveries {
            assert!(matches!(
                d.dispatch_once(now).await.unwrap(),
                DispatchOutcome::Deferred { .. }
            ));
            now += chrono::Duration::hours(1);
        }
        assert_eq!(
            d.dispatch_once(now).await.unwrap(),
            DispatchOutcome::Escalated { job_id: job.id.clone() }
        );
        let failure = storage
            .get_failure(&job.source_url, &job.target_language)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.kind, FailureKind::InvalidInput);
        assert_eq!(storage.count_pending_dispatch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_job_leaves_nothing_to_dispatch() {
        let storage = Arc::new(test_storage().await);
        let job = seed_job(&storage, "https://example.com/c", "<p>c</p>").await;
        assert!(storage.cancel_job(&job.id).await.unwrap());

        let d = dispatcher(storage.clone(), 4);
        assert_eq!(d.dispatch_once(Utc::now()).await.unwrap(), DispatchOutcome::Idle);
        assert!(!storage.job_has_chunks(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn empty_content_escalates() {
        let storage = Arc::new(test_storage().await);
        let job = seed_job(&storage, "https://example.com/empty", "").await;
        let d = dispatcher(storage.clone(), 4);
        assert_eq!(
            d.dispatch_once(Utc::now()).await.unwrap(),
            DispatchOutcome::Escalated { job_id: job.id.clone() }
        );
        assert!(storage.get_job(&job.id).await.unwrap().is_none());
    }
}
