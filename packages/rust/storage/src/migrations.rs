//! SQL migration definitions for the relingo database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.
//!
//! Scheduling columns (`visible_at`, `next_attempt_at`, `observed_at`) are
//! integer unix milliseconds so they can be compared in SQL. Audit timestamps
//! are RFC 3339 text.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: jobs, dispatch queue, raw content, chunks, change feed, outputs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Submitted jobs
CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    source_url      TEXT NOT NULL,
    target_language TEXT NOT NULL,
    blog_url        TEXT NOT NULL,
    username        TEXT NOT NULL,
    password        TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

-- Dispatch queue: one message per submitted job
CREATE TABLE IF NOT EXISTS job_queue (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     TEXT NOT NULL,
    visible_at INTEGER NOT NULL,
    receives   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_job_queue_visible ON job_queue(visible_at);

CREATE TRIGGER IF NOT EXISTS jobs_enqueue AFTER INSERT ON jobs BEGIN
    INSERT INTO job_queue (job_id, visible_at, receives)
    VALUES (new.id, 0, 0);
END;

-- Scraped source content, keyed by URL
CREATE TABLE IF NOT EXISTS raw_content (
    source_url TEXT PRIMARY KEY,
    content    TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);

-- Per-chunk pipeline state
CREATE TABLE IF NOT EXISTS chunk_records (
    job_id          TEXT NOT NULL,
    chunk_index     INTEGER NOT NULL,
    total_chunks    INTEGER NOT NULL,
    stage           INTEGER NOT NULL,
    content         TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (job_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunk_records_stage ON chunk_records(stage);

-- Change feed outbox, written by triggers in the same statement as the chunk write
CREATE TABLE IF NOT EXISTS chunk_events (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    stage       INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    visible_at  INTEGER NOT NULL,
    deliveries  INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_chunk_events_visible ON chunk_events(visible_at);
CREATE INDEX IF NOT EXISTS idx_chunk_events_job ON chunk_events(job_id);

CREATE TRIGGER IF NOT EXISTS chunk_records_feed_insert AFTER INSERT ON chunk_records BEGIN
    INSERT INTO chunk_events (job_id, chunk_index, stage, kind, visible_at)
    VALUES (new.job_id, new.chunk_index, new.stage, 'insert', new.next_attempt_at);
END;

CREATE TRIGGER IF NOT EXISTS chunk_records_feed_update AFTER UPDATE ON chunk_records BEGIN
    INSERT INTO chunk_events (job_id, chunk_index, stage, kind, visible_at)
    VALUES (
        new.job_id,
        new.chunk_index,
        new.stage,
        CASE WHEN new.stage > old.stage THEN 'advance' ELSE 'retry' END,
        new.next_attempt_at
    );
END;

-- Assembled output, one row per (source_url, target_language)
CREATE TABLE IF NOT EXISTS finished_articles (
    source_url      TEXT NOT NULL,
    target_language TEXT NOT NULL,
    job_id          TEXT NOT NULL,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    slug            TEXT NOT NULL,
    content         TEXT NOT NULL,
    content_hash    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (source_url, target_language)
);

-- Permanent failures, one row per (source_url, target_language)
CREATE TABLE IF NOT EXISTS failure_records (
    source_url      TEXT NOT NULL,
    target_language TEXT NOT NULL,
    job_id          TEXT NOT NULL,
    chunk_index     INTEGER,
    kind            TEXT NOT NULL,
    reason          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (source_url, target_language)
);

-- Provider throttling observations, read by the admission circuit breaker
CREATE TABLE IF NOT EXISTS rate_limit_signals (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      TEXT NOT NULL,
    observed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rate_limit_signals_at ON rate_limit_signals(observed_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
