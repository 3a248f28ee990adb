//! Worker runtime: drives the dispatcher and the change-feed consumer.
//!
//! Each tick dispatches queued jobs serially, then claims one batch of
//! change events and handles them concurrently, each invocation bounded by
//! a timeout. Events are acknowledged only after their handler returned
//! `Ok`; anything else is released for redelivery with backoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use relingo_shared::{
    ChangeEvent, ChunkKey, CircuitConfig, FailureKind, FinishedArticle, JobId, PipelineConfig,
    RelingoError, Result, RetryConfig, Stage,
};
use relingo_storage::Storage;
use relingo_transform::TransformService;

use crate::admission::AdmissionController;
use crate::barrier::{BarrierAssembler, BarrierOutcome};
use crate::intake::{DispatchOutcome, Dispatcher};
use crate::orchestrator::{Orchestrator, StepOutcome};
use crate::publisher::Publisher;
use crate::retry::{RetryLedger, escalate};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for the worker loop.
pub trait PipelineProgress: Send + Sync {
    /// Called for every dispatch attempt that found a message.
    fn dispatched(&self, outcome: &DispatchOutcome);
    /// Called when a job completed.
    fn article(&self, article: &FinishedArticle);
    /// Called when a job was permanently failed.
    fn failed(&self, job_id: &JobId);
    /// Called after each tick with the running totals.
    fn tick(&self, totals: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl PipelineProgress for SilentProgress {
    fn dispatched(&self, _outcome: &DispatchOutcome) {}
    fn article(&self, _article: &FinishedArticle) {}
    fn failed(&self, _job_id: &JobId) {}
    fn tick(&self, _totals: &RunSummary) {}
}

/// Counters for one tick, or accumulated over a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub jobs_dispatched: u64,
    pub jobs_deferred: u64,
    pub events_handled: u64,
    pub steps_advanced: u64,
    pub retries_scheduled: u64,
    pub articles: u64,
    pub failures: u64,
    pub redeliveries: u64,
}

impl RunSummary {
    fn absorb(&mut self, other: &RunSummary) {
        self.jobs_dispatched += other.jobs_dispatched;
        self.jobs_deferred += other.jobs_deferred;
        self.events_handled += other.events_handled;
        self.steps_advanced += other.steps_advanced;
        self.retries_scheduled += other.retries_scheduled;
        self.articles += other.articles;
        self.failures += other.failures;
        self.redeliveries += other.redeliveries;
    }

    /// Whether the tick found no work it could make progress on.
    pub fn is_idle(&self) -> bool {
        self.jobs_dispatched == 0 && self.events_handled == 0 && self.failures == 0
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// What a single event invocation produced.
#[derive(Debug)]
enum Handled {
    Step(StepOutcome),
    Barrier(BarrierOutcome),
}

pub struct Worker {
    storage: Arc<Storage>,
    dispatcher: Dispatcher,
    orchestrator: Arc<Orchestrator>,
    barrier: Arc<BarrierAssembler>,
    ledger: RetryLedger,
    config: PipelineConfig,
    circuit: CircuitConfig,
}

impl Worker {
    pub fn new(
        storage: Arc<Storage>,
        transform: Arc<dyn TransformService>,
        publisher: Arc<dyn Publisher>,
        config: PipelineConfig,
        retry: &RetryConfig,
        circuit: CircuitConfig,
    ) -> Self {
        let admission = AdmissionController::new(config.concurrency_limit, circuit.clone());
        let dispatcher = Dispatcher::new(storage.clone(), admission, config.clone());
        let orchestrator = Arc::new(Orchestrator::new(storage.clone(), transform.clone(), retry));
        let barrier = Arc::new(BarrierAssembler::new(storage.clone(), transform, publisher));
        let ledger = orchestrator.ledger().clone();
        Self {
            storage,
            dispatcher,
            orchestrator,
            barrier,
            ledger,
            config,
            circuit,
        }
    }

    /// Run ticks until `shutdown` resolves or, with `until_idle`, until no
    /// dispatch message and no change event is left.
    ///
    /// Shutdown is observed between ticks, so the current batch always
    /// finishes first.
    pub async fn run<F>(
        &self,
        until_idle: bool,
        shutdown: F,
        progress: &dyn PipelineProgress,
    ) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut totals = RunSummary::default();

        info!(
            concurrency_limit = self.config.concurrency_limit,
            max_concurrent_invocations = self.config.max_concurrent_invocations,
            until_idle,
            "worker started"
        );

        loop {
            let now = Utc::now();
            let tick = self.tick(now, progress).await?;
            totals.absorb(&tick);
            progress.tick(&totals);

            let pause = if tick.is_idle() {
                if until_idle && self.drained().await? {
                    break;
                }
                let pruned = self.storage.prune_rate_limits(now - self.circuit.window).await?;
                if pruned > 0 {
                    debug!(pruned, "pruned rate-limit signals");
                }
                self.config.poll_interval
            } else {
                std::time::Duration::ZERO
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(
            articles = totals.articles,
            failures = totals.failures,
            events = totals.events_handled,
            "worker stopped"
        );
        Ok(totals)
    }

    /// Dispatch what admission allows, then handle one batch of events.
    #[instrument(skip_all)]
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        progress: &dyn PipelineProgress,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        self.dispatch(now, &mut summary, progress).await?;
        self.consume(now, &mut summary, progress).await?;
        Ok(summary)
    }

    async fn drained(&self) -> Result<bool> {
        Ok(self.storage.count_pending_dispatch().await? == 0
            && self.storage.count_pending_events().await? == 0)
    }

    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
        progress: &dyn PipelineProgress,
    ) -> Result<()> {
        loop {
            let outcome = self.dispatcher.dispatch_once(now).await?;
            match &outcome {
                DispatchOutcome::Idle => return Ok(()),
                DispatchOutcome::Dispatched { .. } => summary.jobs_dispatched += 1,
                DispatchOutcome::Deferred { job_id, reason } => {
                    debug!(%job_id, reason, "dispatch deferred");
                    summary.jobs_deferred += 1;
                }
                DispatchOutcome::Dropped { .. } => {}
                DispatchOutcome::Escalated { job_id } => {
                    summary.failures += 1;
                    progress.failed(job_id);
                }
            }
            progress.dispatched(&outcome);
            // Once one job is deferred the rest would be too.
            if matches!(outcome, DispatchOutcome::Deferred { .. }) {
                return Ok(());
            }
        }
    }

    async fn consume(
        &self,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
        progress: &dyn PipelineProgress,
    ) -> Result<()> {
        let events = self
            .storage
            .claim_events(now, self.config.event_lease, self.config.max_concurrent_invocations)
            .await?;
        if events.is_empty() {
            return Ok(());
        }

        let (latest, superseded) = coalesce(events);
        for seq in superseded {
            self.storage.ack_event(seq).await?;
        }

        let mut tasks = JoinSet::new();
        for event in latest {
            if event.deliveries > self.config.max_deliveries {
                self.dead_letter(&event, now, summary, progress).await?;
                continue;
            }

            let orchestrator = self.orchestrator.clone();
            let barrier = self.barrier.clone();
            let timeout = self.config.invocation_timeout;
            tasks.spawn(async move {
                let invocation = handle(&orchestrator, &barrier, &event, now);
                let result = match tokio::time::timeout(timeout, invocation).await {
                    Ok(result) => result,
                    Err(_) => Err(RelingoError::Transform(format!(
                        "invocation timed out after {}s",
                        timeout.as_secs()
                    ))),
                };
                (event, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (event, result) = joined
                .map_err(|e| RelingoError::invariant(format!("event task panicked: {e}")))?;
            summary.events_handled += 1;
            match result {
                Ok(handled) => {
                    self.storage.ack_event(event.seq).await?;
                    record(&handled, &event, summary, progress);
                }
                Err(e) => {
                    let delay = self.ledger.redelivery_delay(event.deliveries);
                    warn!(
                        job_id = %event.job_id,
                        chunk_index = event.chunk_index,
                        deliveries = event.deliveries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "event handler failed, will redeliver"
                    );
                    self.storage.release_event(event.seq, now + delay).await?;
                    summary.redeliveries += 1;
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
        progress: &dyn PipelineProgress,
    ) -> Result<()> {
        let reason = format!(
            "change event for chunk {} at {} delivered {} times without success",
            event.chunk_index, event.stage, event.deliveries
        );
        if escalate(
            &self.storage,
            &event.job_id,
            Some(event.chunk_index),
            FailureKind::DeliveryExhausted,
            &reason,
            now,
        )
        .await?
        {
            summary.failures += 1;
            progress.failed(&event.job_id);
        }
        self.storage.ack_event(event.seq).await
    }
}

/// Route one event: IMPROVED writes go to the barrier, the rest to the
/// orchestrator.
async fn handle(
    orchestrator: &Orchestrator,
    barrier: &BarrierAssembler,
    event: &ChangeEvent,
    now: DateTime<Utc>,
) -> Result<Handled> {
    if event.stage == Stage::Improved {
        barrier.on_improved(&event.job_id, now).await.map(Handled::Barrier)
    } else {
        orchestrator.handle(&event.key(), now).await.map(Handled::Step)
    }
}

fn record(
    handled: &Handled,
    event: &ChangeEvent,
    summary: &mut RunSummary,
    progress: &dyn PipelineProgress,
) {
    match handled {
        Handled::Step(StepOutcome::Advanced { .. }) => summary.steps_advanced += 1,
        Handled::Step(StepOutcome::RetryScheduled { .. }) => summary.retries_scheduled += 1,
        Handled::Step(StepOutcome::Escalated { .. }) | Handled::Barrier(BarrierOutcome::Escalated) => {
            summary.failures += 1;
            progress.failed(&event.job_id);
        }
        Handled::Barrier(BarrierOutcome::Assembled { article, .. }) => {
            summary.articles += 1;
            progress.article(article);
        }
        Handled::Step(_) | Handled::Barrier(_) => {}
    }
}

/// Keep only the newest event per chunk. Returns the survivors in feed
/// order and the sequence numbers of the superseded ones.
fn coalesce(events: Vec<ChangeEvent>) -> (Vec<ChangeEvent>, Vec<i64>) {
    let mut newest: HashMap<ChunkKey, ChangeEvent> = HashMap::new();
    let mut superseded = Vec::new();

    for event in events {
        match newest.get(&event.key()) {
            Some(kept) if kept.seq > event.seq => superseded.push(event.seq),
            _ => {
                if let Some(old) = newest.insert(event.key(), event) {
                    superseded.push(old.seq);
                }
            }
        }
    }

    let mut latest: Vec<ChangeEvent> = newest.into_values().collect();
    latest.sort_by_key(|e| e.seq);
    (latest, superseded)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::testing::*;
    use relingo_shared::ChangeKind;
    use relingo_transform::TransformError;

    fn worker_with(
        storage: Arc<Storage>,
        transform: Arc<FakeTransform>,
        publisher: Arc<RecordingPublisher>,
        concurrency_limit: u32,
    ) -> Worker {
        let mut config = pipeline_config();
        config.concurrency_limit = concurrency_limit;
        Worker::new(
            storage,
            transform,
            publisher,
            config,
            &retry_config(5),
            CircuitConfig {
                trip_after: 0,
                window: Duration::from_secs(300),
            },
        )
    }

    fn event(seq: i64, job_id: &JobId, chunk_index: u32, stage: Stage) -> ChangeEvent {
        ChangeEvent {
            seq,
            job_id: job_id.clone(),
            chunk_index,
            stage,
            kind: ChangeKind::Advance,
            deliveries: 1,
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        articles: Mutex<Vec<String>>,
        failed: Mutex<u32>,
    }

    impl PipelineProgress for CountingProgress {
        fn dispatched(&self, _outcome: &DispatchOutcome) {}
        fn article(&self, article: &FinishedArticle) {
            self.articles.lock().unwrap().push(article.source_url.clone());
        }
        fn failed(&self, _job_id: &JobId) {
            *self.failed.lock().unwrap() += 1;
        }
        fn tick(&self, _totals: &RunSummary) {}
    }

    #[test]
    fn coalesce_keeps_newest_per_chunk() {
        let job = JobId::new();
        let events = vec![
            event(1, &job, 0, Stage::Initial),
            event(2, &job, 1, Stage::Initial),
            event(3, &job, 0, Stage::Cleaned),
        ];
        let (latest, superseded) = coalesce(events);
        assert_eq!(latest.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(superseded, vec![1]);
    }

    #[tokio::test]
    async fn runs_jobs_to_completion() {
        let storage = Arc::new(test_storage().await);
        let transform = Arc::new(FakeTransform::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let worker = worker_with(storage.clone(), transform.clone(), publisher.clone(), 2);

        let a = seed_job(&storage, "https://example.com/a", "<h1>A</h1><p>one</p><h2>B</h2><p>two</p>").await;
        let b = seed_job(&storage, "https://example.com/b", "<p>single</p>").await;
        let c = seed_job(&storage, "https://example.com/c", "<h1>C</h1>\n   \n<h2>D</h2>").await;

        let progress = CountingProgress::default();
        let summary = worker
            .run(true, std::future::pending(), &progress)
            .await
            .unwrap();

        assert_eq!(summary.articles, 3);
        assert_eq!(summary.failures, 0);
        assert_eq!(progress.articles.lock().unwrap().len(), 3);
        assert_eq!(publisher.published().len(), 3);

        let article = storage
            .get_article(&a.source_url, &a.target_language)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            article.content,
            "improved(translated(cleaned(<h1>A</h1><p>one</p>)))improved(translated(cleaned(<h2>B</h2><p>two</p>)))"
        );
        for job in [&a, &b, &c] {
            assert!(storage.get_job(&job.id).await.unwrap().is_none());
            assert!(!storage.job_has_chunks(&job.id).await.unwrap());
        }
        assert_eq!(storage.count_pending_events().await.unwrap(), 0);
        assert_eq!(storage.count_pending_dispatch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn markdown_structure_survives_the_pipeline() {
        let storage = Arc::new(test_storage().await);
        let transform = Arc::new(FakeTransform::default());
        transform.echo();
        let publisher = Arc::new(RecordingPublisher::default());
        let worker = worker_with(storage.clone(), transform, publisher.clone(), 1);

        let raw = "# One\ntext\n\n## Two\nmore\n### Three\nend\n";
        let job = seed_job(&storage, "https://example.com/md", raw).await;

        worker
            .run(true, std::future::pending(), &SilentProgress)
            .await
            .unwrap();

        let article = storage
            .get_article(&job.source_url, &job.target_language)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(article.content, raw);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn in_flight_jobs_never_exceed_limit() {
        let storage = Arc::new(test_storage().await);
        let transform = Arc::new(FakeTransform::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let worker = worker_with(storage.clone(), transform, publisher.clone(), 2);

        for i in 0..6 {
            seed_job(
                &storage,
                &format!("https://example.com/post-{i}"),
                "<h1>T</h1><p>x</p><h2>U</h2><p>y</p>",
            )
            .await;
        }

        let mut peak = 0;
        for _ in 0..200 {
            worker.tick(Utc::now(), &SilentProgress).await.unwrap();
            let in_flight = storage.count_in_flight_jobs().await.unwrap();
            assert!(in_flight <= 2, "in-flight jobs {in_flight} exceed limit");
            peak = peak.max(in_flight);
            if storage.count_pending_dispatch().await.unwrap() == 0
                && storage.count_pending_events().await.unwrap() == 0
            {
                break;
            }
        }

        assert_eq!(peak, 2);
        assert_eq!(publisher.published().len(), 6);
    }

    #[tokio::test]
    async fn escalated_job_frees_its_slot() {
        let storage = Arc::new(test_storage().await);
        let transform = Arc::new(FakeTransform::default());
        transform.fail_always(TransformError::InvalidRequest("HTTP 400".into()));
        let publisher = Arc::new(RecordingPublisher::default());
        let worker = worker_with(storage.clone(), transform, publisher.clone(), 1);

        let doomed = seed_job(&storage, "https://example.com/doomed", "<p>x</p>").await;
        let next = seed_job(&storage, "https://example.com/next", "<p>y</p>").await;

        let progress = CountingProgress::default();
        let summary = worker
            .run(true, std::future::pending(), &progress)
            .await
            .unwrap();

        assert_eq!(summary.failures, 2);
        assert_eq!(*progress.failed.lock().unwrap(), 2);
        for job in [&doomed, &next] {
            let failure = storage
                .get_failure(&job.source_url, &job.target_language)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(failure.kind, FailureKind::InvalidInput);
        }
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let storage = Arc::new(test_storage().await);
        let worker = worker_with(
            storage,
            Arc::new(FakeTransform::default()),
            Arc::new(RecordingPublisher::default()),
            1,
        );
        let summary = worker
            .run(false, std::future::ready(()), &SilentProgress)
            .await
            .unwrap();
        assert!(summary.is_idle());
    }
}
