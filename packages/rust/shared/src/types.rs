//! Core domain types for the relingo rewrite pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Where and as whom the finished article gets published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Base URL of the destination CMS.
    pub blog_url: String,
    /// CMS account name.
    pub username: String,
    /// CMS password or application token.
    pub password: String,
}

/// One translation/rewrite request for one source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// URL the content was scraped from. Also the key into the raw content store.
    pub source_url: String,
    /// Language the article is rewritten into (free-form, e.g. `"Spanish"`).
    pub target_language: String,
    pub destination: Destination,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Position of a chunk in the fixed transformation sequence.
///
/// Variants are declared in rank order, so the derived `Ord` is the
/// monotonic order the store enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Initial,
    Cleaned,
    Translated,
    Improved,
}

impl Stage {
    /// All stages in rank order.
    pub const ALL: [Stage; 4] = [
        Stage::Initial,
        Stage::Cleaned,
        Stage::Translated,
        Stage::Improved,
    ];

    /// Small integer rank persisted in the store.
    pub fn rank(self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::Cleaned => 1,
            Self::Translated => 2,
            Self::Improved => 3,
        }
    }

    /// Inverse of [`Stage::rank`].
    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::Initial),
            1 => Some(Self::Cleaned),
            2 => Some(Self::Translated),
            3 => Some(Self::Improved),
            _ => None,
        }
    }

    /// The stage a successful transform moves this one to. `None` for the terminal stage.
    pub fn next(self) -> Option<Self> {
        Self::from_rank(self.rank() + 1)
    }

    /// Whether no further transition is valid.
    pub fn is_terminal(self) -> bool {
        self == Self::Improved
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Cleaned => "CLEANED",
            Self::Translated => "TRANSLATED",
            Self::Improved => "IMPROVED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ChunkRecord
// ---------------------------------------------------------------------------

/// Primary key of a chunk record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub job_id: JobId,
    pub chunk_index: u32,
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.job_id, self.chunk_index)
    }
}

/// One unit of pipeline work: an ordered slice of a job's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub job_id: JobId,
    pub chunk_index: u32,
    /// Fixed at creation and identical across all chunks of a job.
    pub total_chunks: u32,
    pub stage: Stage,
    /// Current text payload, overwritten at each stage.
    pub content: String,
    /// Consecutive failures at the current stage.
    pub retry_count: u32,
    /// Earliest time the orchestrator may work on this chunk again.
    pub next_attempt_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkRecord {
    /// A freshly partitioned chunk at [`Stage::Initial`].
    pub fn initial(job_id: JobId, chunk_index: u32, total_chunks: u32, content: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            chunk_index,
            total_chunks,
            stage: Stage::Initial,
            content,
            retry_count: 0,
            next_attempt_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            job_id: self.job_id.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

// ---------------------------------------------------------------------------
// Change feed & queue messages
// ---------------------------------------------------------------------------

/// What kind of chunk write produced a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A chunk record was created by partitioning.
    Insert,
    /// A chunk moved to a higher stage.
    Advance,
    /// A failed chunk was rescheduled with backoff.
    Retry,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Advance => "advance",
            Self::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "advance" => Some(Self::Advance),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

/// One change-feed notification, as claimed by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Feed sequence number; used to acknowledge the event.
    pub seq: i64,
    pub job_id: JobId,
    pub chunk_index: u32,
    /// Stage of the chunk as written by the triggering write.
    pub stage: Stage,
    pub kind: ChangeKind,
    /// How many times this event has been handed to a consumer, including this one.
    pub deliveries: u32,
}

impl ChangeEvent {
    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            job_id: self.job_id.clone(),
            chunk_index: self.chunk_index,
        }
    }
}

/// A leased message from the job dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchMessage {
    pub id: i64,
    pub job_id: JobId,
    /// Receive count, including this delivery.
    pub receives: u32,
}

// ---------------------------------------------------------------------------
// Finished output & failures
// ---------------------------------------------------------------------------

/// Derived metadata for a finished article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleMetadata {
    pub title: String,
    #[serde(rename = "metaDescription", alias = "description")]
    pub description: String,
    pub slug: String,
}

/// Terminal output of a job, keyed by `(source_url, target_language)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedArticle {
    pub source_url: String,
    pub target_language: String,
    /// Job that produced the latest revision.
    pub job_id: JobId,
    pub metadata: ArticleMetadata,
    /// Concatenated chunk contents, in chunk order.
    pub content: String,
    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Failure classes with distinct retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network blips, timeouts, 5xx. Retried with backoff.
    Transient,
    /// Provider throttling. Retried with a longer base delay.
    RateLimited,
    /// Retrying identical input cannot succeed. Escalated immediately.
    InvalidInput,
    /// Redelivered past the delivery budget (unexpected errors).
    DeliveryExhausted,
    /// A pipeline invariant did not hold.
    Invariant,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::InvalidInput => "invalid_input",
            Self::DeliveryExhausted => "delivery_exhausted",
            Self::Invariant => "invariant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "rate_limited" => Some(Self::RateLimited),
            "invalid_input" => Some(Self::InvalidInput),
            "delivery_exhausted" => Some(Self::DeliveryExhausted),
            "invariant" => Some(Self::Invariant),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permanent-failure ledger entry, keyed by `(source_url, target_language)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub source_url: String,
    pub target_language: String,
    pub job_id: JobId,
    /// The chunk that exhausted its budget, if the failure was chunk-level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    pub kind: FailureKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
