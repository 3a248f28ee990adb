//! Pipeline logic for relingo.
//!
//! This crate ties the store, the partitioner and the transform service
//! together: job intake and dispatch, per-chunk orchestration, barrier
//! assembly, retry and escalation, and the worker loop that drives them.

pub mod admission;
pub mod barrier;
pub mod intake;
pub mod orchestrator;
pub mod publisher;
pub mod retry;
pub mod state;
pub mod worker;

pub use admission::{Admission, AdmissionController};
pub use barrier::{BarrierAssembler, BarrierOutcome};
pub use intake::{DispatchOutcome, Dispatcher, SubmitRequest, ingest_content, submit_job};
pub use orchestrator::{Orchestrator, SkipReason, StepOutcome};
pub use publisher::{LogPublisher, Publisher};
pub use retry::{BackoffPolicy, RetryAction, RetryLedger, escalate};
pub use worker::{PipelineProgress, RunSummary, SilentProgress, Worker};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use relingo_shared::{
        ArticleMetadata, CircuitConfig, Destination, FinishedArticle, Job, JobId, PipelineConfig,
        RelingoError, Result, RetryConfig, Stage,
    };
    use relingo_storage::Storage;
    use relingo_transform::{TransformError, TransformService};

    use crate::admission::AdmissionController;
    use crate::intake::{DispatchOutcome, Dispatcher};
    use crate::publisher::Publisher;

    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("relingo_core_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    /// Store raw content for `url` and submit a Spanish job for it.
    pub async fn seed_job(storage: &Storage, url: &str, raw: &str) -> Job {
        storage.put_raw_content(url, raw).await.expect("put raw content");
        let job = Job {
            id: JobId::new(),
            source_url: url.to_string(),
            target_language: "Spanish".to_string(),
            destination: Destination {
                blog_url: "https://blog.example.com".to_string(),
                username: "editor".to_string(),
                password: "secret".to_string(),
            },
            created_at: Utc::now(),
        };
        storage.insert_job(&job).await.expect("insert job");
        job
    }

    pub fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            concurrency_limit: 4,
            max_concurrent_invocations: 8,
            invocation_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            event_lease: Duration::from_secs(30),
            job_lease: Duration::ZERO,
            max_deliveries: 5,
            max_heading_level: 6,
        }
    }

    pub fn retry_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_secs(1),
            rate_limited_base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }

    /// Partition every queued job, ignoring admission limits.
    pub async fn dispatch_all(storage: &Storage) {
        let admission = AdmissionController::new(
            u32::MAX,
            CircuitConfig {
                trip_after: 0,
                window: Duration::from_secs(60),
            },
        );
        let shared = Arc::new(storage.clone());
        let dispatcher = Dispatcher::new(shared, admission, pipeline_config());
        loop {
            match dispatcher.dispatch_once(Utc::now()).await.expect("dispatch") {
                DispatchOutcome::Idle => break,
                DispatchOutcome::Deferred { reason, .. } => panic!("unexpected deferral: {reason}"),
                _ => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scripted transform service
    // -----------------------------------------------------------------------

    /// In-process `TransformService` that wraps content in the stage name:
    /// `cleaned(...)`, `translated(...)`, `improved(...)`.
    #[derive(Default)]
    pub struct FakeTransform {
        calls: Mutex<Vec<(Stage, Option<String>)>>,
        failures: Mutex<VecDeque<TransformError>>,
        always: Mutex<Option<TransformError>>,
        response: Mutex<Option<String>>,
        echo: Mutex<bool>,
        gate: Mutex<Option<Arc<tokio::sync::Barrier>>>,
        metadata_error: Mutex<Option<TransformError>>,
        metadata_calls: Mutex<u32>,
    }

    impl FakeTransform {
        pub fn calls(&self) -> Vec<(Stage, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }

        /// Fail every transform call with `err`.
        pub fn fail_always(&self, err: TransformError) {
            *self.always.lock().unwrap() = Some(err);
        }

        /// Fail the next `n` transform calls with `err`.
        pub fn fail_times(&self, n: usize, err: TransformError) {
            let mut failures = self.failures.lock().unwrap();
            for _ in 0..n {
                failures.push_back(err.clone());
            }
        }

        /// Return `raw` verbatim instead of the wrapped content.
        pub fn respond_with(&self, raw: &str) {
            *self.response.lock().unwrap() = Some(raw.to_string());
        }

        /// Return the input unchanged, as a model that only trims its answer.
        pub fn echo(&self) {
            *self.echo.lock().unwrap() = true;
        }

        /// Hold every transform call until `callers` calls are waiting.
        pub fn gate(&self, callers: usize) {
            *self.gate.lock().unwrap() = Some(Arc::new(tokio::sync::Barrier::new(callers)));
        }

        pub fn fail_metadata(&self, err: TransformError) {
            *self.metadata_error.lock().unwrap() = Some(err);
        }

        pub fn metadata_calls(&self) -> u32 {
            *self.metadata_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl TransformService for FakeTransform {
        async fn transform(
            &self,
            stage: Stage,
            content: &str,
            target_language: Option<&str>,
        ) -> std::result::Result<String, TransformError> {
            self.calls
                .lock()
                .unwrap()
                .push((stage, target_language.map(str::to_string)));

            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.wait().await;
            }

            if let Some(err) = self.always.lock().unwrap().clone() {
                return Err(err);
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            if let Some(raw) = self.response.lock().unwrap().clone() {
                return Ok(raw);
            }
            if *self.echo.lock().unwrap() {
                return Ok(content.trim().to_string());
            }
            Ok(format!("{}({})", stage.as_str().to_lowercase(), content))
        }

        async fn extract_metadata(
            &self,
            content: &str,
            _target_language: &str,
        ) -> std::result::Result<ArticleMetadata, TransformError> {
            *self.metadata_calls.lock().unwrap() += 1;
            if let Some(err) = self.metadata_error.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(ArticleMetadata {
                title: "Título".to_string(),
                description: format!("{} bytes", content.len()),
                slug: "titulo".to_string(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Recording publisher
    // -----------------------------------------------------------------------

    #[derive(Default)]
    pub struct RecordingPublisher {
        published: Mutex<Vec<FinishedArticle>>,
        failing: Mutex<bool>,
    }

    impl RecordingPublisher {
        pub fn published(&self) -> Vec<FinishedArticle> {
            self.published.lock().unwrap().clone()
        }

        pub fn fail(&self) {
            *self.failing.lock().unwrap() = true;
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, article: &FinishedArticle, _destination: &Destination) -> Result<()> {
            if *self.failing.lock().unwrap() {
                return Err(RelingoError::Network("destination unreachable".into()));
            }
            self.published.lock().unwrap().push(article.clone());
            Ok(())
        }
    }
}
