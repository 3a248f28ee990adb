//! Final assembly once every chunk of a job is IMPROVED.
//!
//! Fired once per IMPROVED event, so most runs find nothing to do: only the
//! run that finds a complete set of chunks assembles, and only the run whose
//! cleanup actually deletes the chunk records signals the publisher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use relingo_content::{content_hash, fallback_metadata};
use relingo_shared::{
    ArticleMetadata, ChunkRecord, FailureKind, FinishedArticle, Job, JobId, RelingoError, Result,
    Stage,
};
use relingo_storage::Storage;
use relingo_transform::{TransformError, TransformService};

use crate::publisher::Publisher;
use crate::retry::escalate;

/// Result of one barrier check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Some chunks are missing or not yet IMPROVED.
    NotReady { improved: u32, total: u32 },
    /// The chunk records are gone: an earlier run already completed the job.
    AlreadyAssembled,
    /// This run assembled the article and removed the job.
    Assembled { article: FinishedArticle, published: bool },
    /// Chunk records outlived their job; they were removed.
    Orphaned,
    /// The chunk set violated its shape invariant; the job was failed.
    Escalated,
}

pub struct BarrierAssembler {
    storage: Arc<Storage>,
    transform: Arc<dyn TransformService>,
    publisher: Arc<dyn Publisher>,
}

impl BarrierAssembler {
    pub fn new(
        storage: Arc<Storage>,
        transform: Arc<dyn TransformService>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            storage,
            transform,
            publisher,
        }
    }

    /// Check the barrier for `job_id` and assemble if it holds.
    ///
    /// Returns an error only when metadata extraction failed in a way worth
    /// retrying; the triggering event is then redelivered.
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn on_improved(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<BarrierOutcome> {
        let chunks = self.storage.list_chunks(job_id).await?;
        if chunks.is_empty() {
            debug!("no chunk records left, job already assembled");
            return Ok(BarrierOutcome::AlreadyAssembled);
        }

        let total = match check_shape(&chunks) {
            Ok(total) => total,
            Err(e) => {
                escalate(
                    &self.storage,
                    job_id,
                    None,
                    FailureKind::Invariant,
                    &e.to_string(),
                    now,
                )
                .await?;
                return Ok(BarrierOutcome::Escalated);
            }
        };

        let improved = chunks.iter().filter(|c| c.stage == Stage::Improved).count() as u32;
        if improved < total {
            debug!(improved, total, "barrier not satisfied");
            return Ok(BarrierOutcome::NotReady { improved, total });
        }

        let Some(job) = self.storage.get_job(job_id).await? else {
            warn!("chunks have no job, removing leftovers");
            self.storage.delete_chunks(job_id).await?;
            return Ok(BarrierOutcome::Orphaned);
        };

        let content: String = chunks.iter().map(|c| c.content.as_str()).collect();
        let metadata = self.metadata(&job, &content, now).await?;

        let article = FinishedArticle {
            source_url: job.source_url.clone(),
            target_language: job.target_language.clone(),
            job_id: job_id.clone(),
            metadata,
            content_hash: content_hash(&content),
            content,
            created_at: now,
            updated_at: now,
        };
        self.storage.upsert_article(&article).await?;

        let deleted = self.storage.delete_chunks(job_id).await?;
        if deleted == 0 {
            debug!("another run completed the job first");
            return Ok(BarrierOutcome::AlreadyAssembled);
        }
        self.storage.delete_job(job_id).await?;

        info!(
            chunks = total,
            title = %article.metadata.title,
            bytes = article.content.len(),
            "article assembled"
        );

        let published = match self.publisher.publish(&article, &job.destination).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "publish failed, article kept");
                false
            }
        };

        Ok(BarrierOutcome::Assembled { article, published })
    }

    /// Metadata from the provider, or derived locally when the provider
    /// cannot accept the assembled article.
    async fn metadata(
        &self,
        job: &Job,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<ArticleMetadata> {
        match self
            .transform
            .extract_metadata(content, &job.target_language)
            .await
        {
            Ok(meta) => Ok(meta),
            Err(err @ (TransformError::ContextTooLarge(_) | TransformError::InvalidRequest(_))) => {
                warn!(error = %err, "metadata extraction rejected, deriving locally");
                Ok(fallback_metadata(content, &job.source_url))
            }
            Err(err) => {
                if matches!(err, TransformError::RateLimited(_)) {
                    self.storage.record_rate_limit(&job.id, now).await?;
                }
                Err(RelingoError::Transform(format!("metadata extraction: {err}")))
            }
        }
    }
}

/// Validate the chunk set of one job and return its `total_chunks`.
///
/// All records must agree on `total_chunks`, and indices must lie in
/// `0..total_chunks` (so the count can never exceed it). `chunks` is
/// ordered by index.
fn check_shape(chunks: &[ChunkRecord]) -> Result<u32> {
    let total = chunks[0].total_chunks;
    if let Some(other) = chunks.iter().find(|c| c.total_chunks != total) {
        return Err(RelingoError::invariant(format!(
            "chunks disagree on total_chunks: {total} vs {} at index {}",
            other.total_chunks, other.chunk_index
        )));
    }
    if let Some(out_of_range) = chunks.iter().find(|c| c.chunk_index >= total) {
        return Err(RelingoError::invariant(format!(
            "chunk index {} out of range for {total} chunks",
            out_of_range.chunk_index
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use relingo_shared::ChunkKey;

    struct Fixture {
        storage: Arc<Storage>,
        transform: Arc<FakeTransform>,
        publisher: Arc<RecordingPublisher>,
        barrier: BarrierAssembler,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(test_storage().await);
        let transform = Arc::new(FakeTransform::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let barrier = BarrierAssembler::new(storage.clone(), transform.clone(), publisher.clone());
        Fixture {
            storage,
            transform,
            publisher,
            barrier,
        }
    }

    async fn improve(storage: &Storage, job_id: &JobId, index: u32, content: &str) {
        let key = ChunkKey {
            job_id: job_id.clone(),
            chunk_index: index,
        };
        assert!(storage
            .advance_chunk(&key, Stage::Improved, content, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn out_of_order_completion_assembles_in_index_order() {
        let f = fixture().await;
        let job = seed_job(&f.storage, "https://example.com/three", "<h1>a</h1><h2>b</h2><h2>c</h2>").await;
        dispatch_all(&f.storage).await;
        assert_eq!(f.storage.list_chunks(&job.id).await.unwrap().len(), 3);

        improve(&f.storage, &job.id, 0, "content0").await;
        assert_eq!(
            f.barrier.on_improved(&job.id, Utc::now()).await.unwrap(),
            BarrierOutcome::NotReady { improved: 1, total: 3 }
        );
        improve(&f.storage, &job.id, 2, "content2").await;
        assert_eq!(
            f.barrier.on_improved(&job.id, Utc::now()).await.unwrap(),
            BarrierOutcome::NotReady { improved: 2, total: 3 }
        );
        assert_eq!(f.transform.metadata_calls(), 0);

        improve(&f.storage, &job.id, 1, "content1").await;
        let outcome = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap();
        let BarrierOutcome::Assembled { article, published } = outcome else {
            panic!("expected assembly, got {outcome:?}");
        };
        assert!(published);
        assert_eq!(article.content, "content0content1content2");
        assert_eq!(article.content_hash, content_hash("content0content1content2"));

        let stored = f
            .storage
            .get_article(&job.source_url, &job.target_language)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content, article.content);
        assert!(f.storage.list_chunks(&job.id).await.unwrap().is_empty());
        assert!(f.storage.get_job(&job.id).await.unwrap().is_none());
        assert_eq!(f.publisher.published().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_barrier_runs_publish_once() {
        let f = fixture().await;
        let job = seed_job(&f.storage, "https://example.com/race", "<h1>a</h1><h2>b</h2>").await;
        dispatch_all(&f.storage).await;
        improve(&f.storage, &job.id, 0, "uno").await;
        improve(&f.storage, &job.id, 1, "dos").await;

        let now = Utc::now();
        let (a, b) = tokio::join!(
            f.barrier.on_improved(&job.id, now),
            f.barrier.on_improved(&job.id, now)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let assembled = outcomes
            .iter()
            .filter(|o| matches!(o, BarrierOutcome::Assembled { published: true, .. }))
            .count();
        assert_eq!(assembled, 1, "outcomes: {outcomes:?}");
        assert!(outcomes.iter().any(|o| matches!(
            o,
            BarrierOutcome::AlreadyAssembled | BarrierOutcome::Orphaned
        )));

        assert_eq!(f.publisher.published().len(), 1);
        let articles = f.storage.list_articles().await.unwrap();
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].content, "unodos");
        assert!(f.storage.list_chunks(&job.id).await.unwrap().is_empty());
        assert!(f.storage.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let f = fixture().await;
        let job = seed_job(&f.storage, "https://example.com/twice", "<p>only</p>").await;
        dispatch_all(&f.storage).await;
        improve(&f.storage, &job.id, 0, "done").await;

        let first = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap();
        assert!(matches!(first, BarrierOutcome::Assembled { .. }));
        let second = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap();
        assert_eq!(second, BarrierOutcome::AlreadyAssembled);

        assert_eq!(f.transform.metadata_calls(), 1);
        assert_eq!(f.publisher.published().len(), 1);
        assert_eq!(f.storage.list_articles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversized_article_gets_local_metadata() {
        let f = fixture().await;
        f.transform
            .fail_metadata(TransformError::ContextTooLarge("too long".into()));
        let job = seed_job(&f.storage, "https://example.com/long", "<p>x</p>").await;
        dispatch_all(&f.storage).await;
        improve(&f.storage, &job.id, 0, "<h1>Título largo</h1><p>Cuerpo del texto.</p>").await;

        let outcome = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap();
        let BarrierOutcome::Assembled { article, .. } = outcome else {
            panic!("expected assembly, got {outcome:?}");
        };
        assert_eq!(article.metadata.title, "Título largo");
        assert_eq!(article.metadata.description, "Cuerpo del texto.");
    }

    #[tokio::test]
    async fn transient_metadata_failure_keeps_chunks_for_redelivery() {
        let f = fixture().await;
        f.transform
            .fail_metadata(TransformError::RateLimited("HTTP 429".into()));
        let job = seed_job(&f.storage, "https://example.com/later", "<p>x</p>").await;
        dispatch_all(&f.storage).await;
        improve(&f.storage, &job.id, 0, "done").await;

        let err = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, RelingoError::Transform(_)));
        assert!(f.storage.job_has_chunks(&job.id).await.unwrap());
        assert!(f.storage.get_article(&job.source_url, &job.target_language).await.unwrap().is_none());
        assert!(f.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn failed_publish_keeps_article() {
        let f = fixture().await;
        f.publisher.fail();
        let job = seed_job(&f.storage, "https://example.com/pub", "<p>x</p>").await;
        dispatch_all(&f.storage).await;
        improve(&f.storage, &job.id, 0, "done").await;

        let outcome = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, BarrierOutcome::Assembled { published: false, .. }));
        assert!(f
            .storage
            .get_article(&job.source_url, &job.target_language)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn inconsistent_chunk_counts_escalate() {
        let f = fixture().await;
        let job = seed_job(&f.storage, "https://example.com/bad-shape", "x").await;
        f.storage
            .insert_chunks(&[
                ChunkRecord::initial(job.id.clone(), 0, 2, "a".into()),
                ChunkRecord::initial(job.id.clone(), 1, 3, "b".into()),
            ])
            .await
            .unwrap();

        let outcome = f.barrier.on_improved(&job.id, Utc::now()).await.unwrap();
        assert_eq!(outcome, BarrierOutcome::Escalated);
        let failure = f
            .storage
            .get_failure(&job.source_url, &job.target_language)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.kind, FailureKind::Invariant);
        assert!(!f.storage.job_has_chunks(&job.id).await.unwrap());
    }

    #[test]
    fn shape_rejects_out_of_range_index() {
        let job_id = JobId::new();
        let chunks = vec![
            ChunkRecord::initial(job_id.clone(), 0, 2, "a".into()),
            ChunkRecord::initial(job_id.clone(), 2, 2, "c".into()),
        ];
        assert!(matches!(check_shape(&chunks), Err(RelingoError::Invariant { .. })));

        let ok = vec![ChunkRecord::initial(job_id, 1, 2, "b".into())];
        assert_eq!(check_shape(&ok).unwrap(), 2);
    }
}
