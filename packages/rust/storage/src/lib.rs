//! Turso Embedded / libSQL storage layer for the relingo pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding every piece of
//! pipeline state: submitted jobs and their dispatch queue, scraped source
//! content, per-chunk records and their change feed, finished articles,
//! failure records, and rate-limit signals.
//!
//! **Access rules:**
//! - The pipeline worker and intake commands: read-write via [`Storage::open`]
//! - Operator queries (`status`, `failures`, `articles`): read-only via
//!   [`Storage::open_readonly`]
//!
//! Every chunk write emits its change event through a trigger, in the same
//! statement as the write itself, so a committed transition is never lost
//! from the feed.

mod chunks;
mod migrations;
mod queue;
mod records;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use relingo_shared::{Destination, Job, JobId, RelingoError, Result, Stage};

/// Primary storage handle wrapping a libSQL database.
///
/// The connection is shared by all concurrent orchestrator and barrier
/// invocations; every correctness-relevant write is a single conditional
/// statement. Clones share the same connection.
#[derive(Clone)]
pub struct Storage {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
    readonly: bool,
}

/// Per-job progress row for the `status` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobProgress {
    pub job_id: JobId,
    /// `None` when the job row is already gone (orphaned chunks).
    pub source_url: Option<String>,
    pub target_language: Option<String>,
    pub total_chunks: u32,
    /// Chunk counts indexed by [`Stage::rank`].
    pub stage_counts: [u32; 4],
    /// Largest retry count among the job's chunks.
    pub max_retry_count: u32,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RelingoError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db: Arc::new(db),
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RelingoError::NotFound(format!(
                "database {} (run `relingo submit` or `relingo run` first)",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    RelingoError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(RelingoError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Run a single-value `COUNT(*)`-style query.
    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64> {
        let mut rows = self.conn.query(sql, params).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    // -----------------------------------------------------------------------
    // Job operations
    // -----------------------------------------------------------------------

    /// Insert a new job. The `jobs_enqueue` trigger puts its dispatch message
    /// on the queue in the same statement.
    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, source_url, target_language, blog_url, username, password, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    job.source_url.as_str(),
                    job.target_language.as_str(),
                    job.destination.blog_url.as_str(),
                    job.destination.username.as_str(),
                    job.destination.password.as_str(),
                    job.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, source_url, target_language, blog_url, username, password, created_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Delete a job row and any dispatch messages still referencing it.
    ///
    /// Returns `true` if the job row existed.
    pub async fn delete_job(&self, id: &JobId) -> Result<bool> {
        self.check_writable()?;
        let job_id = id.to_string();
        self.conn
            .execute(
                "DELETE FROM job_queue WHERE job_id = ?1",
                params![job_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        let deleted = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![job_id.as_str()])
            .await
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    /// Remove every trace of an in-flight job: chunks, pending change
    /// events, dispatch messages and the job row.
    ///
    /// Returns `true` if anything was removed.
    pub async fn cancel_job(&self, id: &JobId) -> Result<bool> {
        self.check_writable()?;
        let chunks = self.delete_chunks(id).await?;
        let job = self.delete_job(id).await?;
        tracing::info!(job_id = %id, chunks, job, "job cancelled");
        Ok(chunks > 0 || job)
    }

    /// Progress of every job that still has chunk records, oldest first.
    pub async fn in_flight_jobs(&self) -> Result<Vec<JobProgress>> {
        let mut rows = self
            .conn
            .query(
                "SELECT c.job_id, j.source_url, j.target_language, MAX(c.total_chunks),
                        SUM(CASE WHEN c.stage = 0 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN c.stage = 1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN c.stage = 2 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN c.stage = 3 THEN 1 ELSE 0 END),
                        MAX(c.retry_count)
                 FROM chunk_records c
                 LEFT JOIN jobs j ON j.id = c.job_id
                 GROUP BY c.job_id
                 ORDER BY c.job_id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let mut stage_counts = [0u32; 4];
            for (i, count) in stage_counts.iter_mut().enumerate() {
                *count = row.get::<i64>(4 + i as i32).map_err(db_err)? as u32;
            }
            results.push(JobProgress {
                job_id: parse_job_id(&row.get::<String>(0).map_err(db_err)?)?,
                source_url: row.get::<String>(1).ok(),
                target_language: row.get::<String>(2).ok(),
                total_chunks: row.get::<i64>(3).map_err(db_err)? as u32,
                stage_counts,
                max_retry_count: row.get::<i64>(8).map_err(db_err)? as u32,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Raw content (scrape store)
    // -----------------------------------------------------------------------

    /// Store scraped content for a URL, replacing any previous scrape.
    pub async fn put_raw_content(&self, source_url: &str, content: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO raw_content (source_url, content, fetched_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_url) DO UPDATE SET
                   content = excluded.content,
                   fetched_at = excluded.fetched_at",
                params![source_url, content, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get scraped content for a URL.
    pub async fn get_raw_content(&self, source_url: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content FROM raw_content WHERE source_url = ?1",
                params![source_url],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> RelingoError {
    RelingoError::Storage(e.to_string())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RelingoError::Storage(format!("invalid timestamp: {ms}")))
}

pub(crate) fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelingoError::Storage(format!("invalid date: {e}")))
}

pub(crate) fn parse_job_id(s: &str) -> Result<JobId> {
    s.parse()
        .map_err(|e| RelingoError::Storage(format!("invalid job id {s:?}: {e}")))
}

pub(crate) fn parse_stage(rank: i64) -> Result<Stage> {
    u8::try_from(rank)
        .ok()
        .and_then(Stage::from_rank)
        .ok_or_else(|| RelingoError::Storage(format!("invalid stage rank: {rank}")))
}

fn row_to_job(row: &libsql::Row) -> Result<Job> {
    Ok(Job {
        id: parse_job_id(&row.get::<String>(0).map_err(db_err)?)?,
        source_url: row.get::<String>(1).map_err(db_err)?,
        target_language: row.get::<String>(2).map_err(db_err)?,
        destination: Destination {
            blog_url: row.get::<String>(3).map_err(db_err)?,
            username: row.get::<String>(4).map_err(db_err)?,
            password: row.get::<String>(5).map_err(db_err)?,
        },
        created_at: parse_rfc3339(&row.get::<String>(6).map_err(db_err)?)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("relingo_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    pub fn sample_job(source_url: &str) -> Job {
        Job {
            id: JobId::new(),
            source_url: source_url.to_string(),
            target_language: "Spanish".to_string(),
            destination: Destination {
                blog_url: "https://blog.example.com".to_string(),
                username: "editor".to_string(),
                password: "secret".to_string(),
            },
            created_at: Utc::now(),
        }
    }
}
