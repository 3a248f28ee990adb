//! Chunk records and their change feed.
//!
//! Stage transitions are conditional single-statement updates: the write
//! only lands if the stored stage is strictly lower than the new one, so
//! racing or redelivered invocations can never regress a chunk.

use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::params;
use relingo_shared::{ChangeEvent, ChangeKind, ChunkKey, ChunkRecord, JobId, Result, Stage};

use crate::{Storage, db_err, from_millis, parse_job_id, parse_rfc3339, parse_stage, to_millis};

const CHUNK_COLUMNS: &str = "job_id, chunk_index, total_chunks, stage, content, retry_count, next_attempt_at, updated_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Chunk operations
    // -----------------------------------------------------------------------

    /// Insert freshly partitioned chunks. Rows that already exist are left
    /// untouched, so a redelivered dispatch cannot reset progress.
    ///
    /// Returns the number of rows actually inserted.
    pub async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<u64> {
        self.check_writable()?;
        let mut inserted = 0;
        for chunk in chunks {
            inserted += self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO chunk_records
                       (job_id, chunk_index, total_chunks, stage, content, retry_count, next_attempt_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        chunk.job_id.to_string(),
                        i64::from(chunk.chunk_index),
                        i64::from(chunk.total_chunks),
                        i64::from(chunk.stage.rank()),
                        chunk.content.as_str(),
                        i64::from(chunk.retry_count),
                        to_millis(chunk.next_attempt_at),
                        chunk.updated_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(db_err)?;
        }
        Ok(inserted)
    }

    /// Get a single chunk by key.
    pub async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<ChunkRecord>> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunk_records WHERE job_id = ?1 AND chunk_index = ?2"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![key.job_id.to_string(), i64::from(key.chunk_index)],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_chunk(&row)?)),
            None => Ok(None),
        }
    }

    /// All chunks of a job, in chunk order.
    pub async fn list_chunks(&self, job_id: &JobId) -> Result<Vec<ChunkRecord>> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunk_records WHERE job_id = ?1 ORDER BY chunk_index"
        );
        let mut rows = self
            .conn
            .query(&sql, params![job_id.to_string()])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_chunk(&row)?);
        }
        Ok(results)
    }

    /// Move a chunk to `stage` with new content, only if its stored stage is
    /// strictly lower. Resets the retry budget.
    ///
    /// Returns `true` if the write was accepted.
    pub async fn advance_chunk(
        &self,
        key: &ChunkKey,
        stage: Stage,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let rank = i64::from(stage.rank());
        let changed = self
            .conn
            .execute(
                "UPDATE chunk_records
                 SET stage = ?1, content = ?2, retry_count = 0, next_attempt_at = ?3, updated_at = ?4
                 WHERE job_id = ?5 AND chunk_index = ?6 AND stage < ?1",
                params![
                    rank,
                    content,
                    to_millis(now),
                    now.to_rfc3339(),
                    key.job_id.to_string(),
                    i64::from(key.chunk_index),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Record a failed attempt and defer the chunk until `next_attempt_at`.
    ///
    /// Conditional on the chunk still being at `stage` with `retry_count`
    /// unchanged, so two failing duplicates of the same event only consume
    /// one unit of budget. Returns `true` if the write was accepted.
    pub async fn schedule_retry(
        &self,
        key: &ChunkKey,
        stage: Stage,
        retry_count: u32,
        now: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "UPDATE chunk_records
                 SET retry_count = retry_count + 1, next_attempt_at = ?1, updated_at = ?2
                 WHERE job_id = ?3 AND chunk_index = ?4 AND stage = ?5 AND retry_count = ?6",
                params![
                    to_millis(next_attempt_at),
                    now.to_rfc3339(),
                    key.job_id.to_string(),
                    i64::from(key.chunk_index),
                    i64::from(stage.rank()),
                    i64::from(retry_count),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Delete all chunks of a job and their pending change events.
    ///
    /// Returns the number of chunk rows removed. Of several concurrent
    /// callers, at most one observes a non-zero count.
    pub async fn delete_chunks(&self, job_id: &JobId) -> Result<u64> {
        self.check_writable()?;
        let id = job_id.to_string();
        let deleted = self
            .conn
            .execute(
                "DELETE FROM chunk_records WHERE job_id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;
        self.conn
            .execute(
                "DELETE FROM chunk_events WHERE job_id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(deleted)
    }

    /// Number of distinct jobs with at least one chunk short of the terminal stage.
    pub async fn count_in_flight_jobs(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(DISTINCT job_id) FROM chunk_records WHERE stage < ?1",
            params![i64::from(Stage::Improved.rank())],
        )
        .await
    }

    /// Whether any chunk record exists for the job.
    pub async fn job_has_chunks(&self, job_id: &JobId) -> Result<bool> {
        let n = self
            .count(
                "SELECT COUNT(*) FROM chunk_records WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    /// Lease up to `limit` visible change events in feed order.
    ///
    /// Claimed events become invisible for `lease` and their delivery count
    /// is incremented. An event that is neither acked nor released within
    /// the lease is handed out again.
    pub async fn claim_events(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<ChangeEvent>> {
        self.check_writable()?;
        let lease_until = to_millis(now + lease);
        let mut rows = self
            .conn
            .query(
                "UPDATE chunk_events
                 SET visible_at = ?1, deliveries = deliveries + 1
                 WHERE seq IN (
                     SELECT seq FROM chunk_events
                     WHERE visible_at <= ?2
                     ORDER BY seq
                     LIMIT ?3
                 )
                 RETURNING seq, job_id, chunk_index, stage, kind, deliveries",
                params![lease_until, to_millis(now), i64::from(limit)],
            )
            .await
            .map_err(db_err)?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let kind: String = row.get(4).map_err(db_err)?;
            events.push(ChangeEvent {
                seq: row.get::<i64>(0).map_err(db_err)?,
                job_id: parse_job_id(&row.get::<String>(1).map_err(db_err)?)?,
                chunk_index: row.get::<i64>(2).map_err(db_err)? as u32,
                stage: parse_stage(row.get::<i64>(3).map_err(db_err)?)?,
                kind: ChangeKind::parse(&kind).ok_or_else(|| {
                    relingo_shared::RelingoError::Storage(format!("invalid event kind: {kind}"))
                })?,
                deliveries: row.get::<i64>(5).map_err(db_err)? as u32,
            });
        }
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    /// Acknowledge a processed event, removing it from the feed.
    pub async fn ack_event(&self, seq: i64) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM chunk_events WHERE seq = ?1", params![seq])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Return a claimed event to the feed, visible again at `visible_at`.
    pub async fn release_event(&self, seq: i64, visible_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE chunk_events SET visible_at = ?1 WHERE seq = ?2",
                params![to_millis(visible_at), seq],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Events still in the feed, leased or not.
    pub async fn count_pending_events(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM chunk_events", params![]).await
    }
}

fn row_to_chunk(row: &libsql::Row) -> Result<ChunkRecord> {
    Ok(ChunkRecord {
        job_id: parse_job_id(&row.get::<String>(0).map_err(db_err)?)?,
        chunk_index: row.get::<i64>(1).map_err(db_err)? as u32,
        total_chunks: row.get::<i64>(2).map_err(db_err)? as u32,
        stage: parse_stage(row.get::<i64>(3).map_err(db_err)?)?,
        content: row.get::<String>(4).map_err(db_err)?,
        retry_count: row.get::<i64>(5).map_err(db_err)? as u32,
        next_attempt_at: from_millis(row.get::<i64>(6).map_err(db_err)?)?,
        updated_at: parse_rfc3339(&row.get::<String>(7).map_err(db_err)?)?,
    })
}
