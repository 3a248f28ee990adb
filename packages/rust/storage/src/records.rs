//! Terminal outputs: finished articles, failure records, and the
//! rate-limit signals that feed the admission circuit breaker.

use chrono::{DateTime, Utc};
use libsql::params;
use relingo_shared::{
    ArticleMetadata, FailureKind, FailureRecord, FinishedArticle, JobId, RelingoError, Result,
};

use crate::{Storage, db_err, parse_job_id, parse_rfc3339, to_millis};

const ARTICLE_COLUMNS: &str = "source_url, target_language, job_id, title, description, slug, content, content_hash, created_at, updated_at";
const FAILURE_COLUMNS: &str =
    "source_url, target_language, job_id, chunk_index, kind, reason, created_at, updated_at";

impl Storage {
    // -----------------------------------------------------------------------
    // Finished articles
    // -----------------------------------------------------------------------

    /// Insert or overwrite the finished article for `(source_url, target_language)`.
    ///
    /// The first `created_at` is kept; everything else is replaced.
    pub async fn upsert_article(&self, article: &FinishedArticle) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO finished_articles
                   (source_url, target_language, job_id, title, description, slug, content, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(source_url, target_language) DO UPDATE SET
                   job_id = excluded.job_id,
                   title = excluded.title,
                   description = excluded.description,
                   slug = excluded.slug,
                   content = excluded.content,
                   content_hash = excluded.content_hash,
                   updated_at = excluded.updated_at",
                params![
                    article.source_url.as_str(),
                    article.target_language.as_str(),
                    article.job_id.to_string(),
                    article.metadata.title.as_str(),
                    article.metadata.description.as_str(),
                    article.metadata.slug.as_str(),
                    article.content.as_str(),
                    article.content_hash.as_str(),
                    article.created_at.to_rfc3339(),
                    article.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get the finished article for a source URL and language.
    pub async fn get_article(
        &self,
        source_url: &str,
        target_language: &str,
    ) -> Result<Option<FinishedArticle>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM finished_articles
             WHERE source_url = ?1 AND target_language = ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![source_url, target_language])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_article(&row)?)),
            None => Ok(None),
        }
    }

    /// All finished articles, most recently updated first.
    pub async fn list_articles(&self) -> Result<Vec<FinishedArticle>> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM finished_articles ORDER BY updated_at DESC");
        let mut rows = self.conn.query(&sql, params![]).await.map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_article(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Failure records
    // -----------------------------------------------------------------------

    /// Insert or overwrite the failure record for `(source_url, target_language)`.
    pub async fn upsert_failure(&self, failure: &FailureRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO failure_records
                   (source_url, target_language, job_id, chunk_index, kind, reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(source_url, target_language) DO UPDATE SET
                   job_id = excluded.job_id,
                   chunk_index = excluded.chunk_index,
                   kind = excluded.kind,
                   reason = excluded.reason,
                   updated_at = excluded.updated_at",
                params![
                    failure.source_url.as_str(),
                    failure.target_language.as_str(),
                    failure.job_id.to_string(),
                    failure.chunk_index.map(i64::from),
                    failure.kind.as_str(),
                    failure.reason.as_str(),
                    failure.created_at.to_rfc3339(),
                    failure.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get the failure record for a source URL and language.
    pub async fn get_failure(
        &self,
        source_url: &str,
        target_language: &str,
    ) -> Result<Option<FailureRecord>> {
        let sql = format!(
            "SELECT {FAILURE_COLUMNS} FROM failure_records
             WHERE source_url = ?1 AND target_language = ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![source_url, target_language])
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_failure(&row)?)),
            None => Ok(None),
        }
    }

    /// All failure records, most recently updated first.
    pub async fn list_failures(&self) -> Result<Vec<FailureRecord>> {
        let sql = format!("SELECT {FAILURE_COLUMNS} FROM failure_records ORDER BY updated_at DESC");
        let mut rows = self.conn.query(&sql, params![]).await.map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_failure(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Rate-limit signals
    // -----------------------------------------------------------------------

    /// Record that the transform provider throttled a request.
    pub async fn record_rate_limit(&self, job_id: &JobId, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO rate_limit_signals (job_id, observed_at) VALUES (?1, ?2)",
                params![job_id.to_string(), to_millis(at)],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Signals observed at or after `since`.
    pub async fn count_rate_limits_since(&self, since: DateTime<Utc>) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM rate_limit_signals WHERE observed_at >= ?1",
            params![to_millis(since)],
        )
        .await
    }

    /// Drop signals older than `before`. Returns the number removed.
    pub async fn prune_rate_limits(&self, before: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM rate_limit_signals WHERE observed_at < ?1",
                params![to_millis(before)],
            )
            .await
            .map_err(db_err)
    }
}

fn row_to_article(row: &libsql::Row) -> Result<FinishedArticle> {
    Ok(FinishedArticle {
        source_url: row.get::<String>(0).map_err(db_err)?,
        target_language: row.get::<String>(1).map_err(db_err)?,
        job_id: parse_job_id(&row.get::<String>(2).map_err(db_err)?)?,
        metadata: ArticleMetadata {
            title: row.get::<String>(3).map_err(db_err)?,
            description: row.get::<String>(4).map_err(db_err)?,
            slug: row.get::<String>(5).map_err(db_err)?,
        },
        content: row.get::<String>(6).map_err(db_err)?,
        content_hash: row.get::<String>(7).map_err(db_err)?,
        created_at: parse_rfc3339(&row.get::<String>(8).map_err(db_err)?)?,
        updated_at: parse_rfc3339(&row.get::<String>(9).map_err(db_err)?)?,
    })
}

fn row_to_failure(row: &libsql::Row) -> Result<FailureRecord> {
    let kind: String = row.get(4).map_err(db_err)?;
    Ok(FailureRecord {
        source_url: row.get::<String>(0).map_err(db_err)?,
        target_language: row.get::<String>(1).map_err(db_err)?,
        job_id: parse_job_id(&row.get::<String>(2).map_err(db_err)?)?,
        chunk_index: row.get::<i64>(3).ok().map(|v| v as u32),
        kind: FailureKind::parse(&kind)
            .ok_or_else(|| RelingoError::Storage(format!("invalid failure kind: {kind}")))?,
        reason: row.get::<String>(5).map_err(db_err)?,
        created_at: parse_rfc3339(&row.get::<String>(6).map_err(db_err)?)?,
        updated_at: parse_rfc3339(&row.get::<String>(7).map_err(db_err)?)?,
    })
}
