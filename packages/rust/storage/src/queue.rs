//! Job dispatch queue.
//!
//! Messages are produced by the `jobs_enqueue` trigger and consumed with
//! the same lease / ack / release pattern as the change feed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::params;
use relingo_shared::{DispatchMessage, Result};

use crate::{Storage, db_err, parse_job_id, to_millis};

impl Storage {
    /// Lease the oldest visible dispatch message, if any.
    pub async fn claim_dispatch(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<DispatchMessage>> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "UPDATE job_queue
                 SET visible_at = ?1, receives = receives + 1
                 WHERE id = (
                     SELECT id FROM job_queue
                     WHERE visible_at <= ?2
                     ORDER BY id
                     LIMIT 1
                 )
                 RETURNING id, job_id, receives",
                params![to_millis(now + lease), to_millis(now)],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(DispatchMessage {
                id: row.get::<i64>(0).map_err(db_err)?,
                job_id: parse_job_id(&row.get::<String>(1).map_err(db_err)?)?,
                receives: row.get::<i64>(2).map_err(db_err)? as u32,
            })),
            None => Ok(None),
        }
    }

    /// Acknowledge a dispatch message, removing it from the queue.
    pub async fn ack_dispatch(&self, id: i64) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM job_queue WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Return a dispatch message to the queue, visible again at `visible_at`.
    pub async fn release_dispatch(&self, id: i64, visible_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE job_queue SET visible_at = ?1 WHERE id = ?2",
                params![to_millis(visible_at), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Like [`Storage::release_dispatch`], but refunds the receive: used when
    /// the message was handled correctly and only postponed (admission).
    pub async fn defer_dispatch(&self, id: i64, visible_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE job_queue SET visible_at = ?1, receives = MAX(receives - 1, 0) WHERE id = ?2",
                params![to_millis(visible_at), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Messages still on the queue, leased or deferred included.
    pub async fn count_pending_dispatch(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM job_queue", params![]).await
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;

    use super::*;

    #[tokio::test]
    async fn claim_leases_in_submission_order() {
        let storage = test_storage().await;
        let first = sample_job("https://example.com/1");
        let second = sample_job("https://example.com/2");
        storage.insert_job(&first).await.unwrap();
        storage.insert_job(&second).await.unwrap();

        let now = Utc::now();
        let lease = Duration::from_secs(60);
        let m1 = storage.claim_dispatch(now, lease).await.unwrap().unwrap();
        assert_eq!(m1.job_id, first.id);
        assert_eq!(m1.receives, 1);

        let m2 = storage.claim_dispatch(now, lease).await.unwrap().unwrap();
        assert_eq!(m2.job_id, second.id);

        // Both leased.
        assert!(storage.claim_dispatch(now, lease).await.unwrap().is_none());

        storage.ack_dispatch(m1.id).await.unwrap();
        assert_eq!(storage.count_pending_dispatch().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn release_defers_and_counts_receives() {
        let storage = test_storage().await;
        let job = sample_job("https://example.com/deferred");
        storage.insert_job(&job).await.unwrap();

        let now = Utc::now();
        let lease = Duration::from_secs(60);
        let msg = storage.claim_dispatch(now, lease).await.unwrap().unwrap();

        let retry_at = now + chrono::Duration::seconds(5);
        storage.release_dispatch(msg.id, retry_at).await.unwrap();
        assert!(storage.claim_dispatch(now, lease).await.unwrap().is_none());

        let again = storage.claim_dispatch(retry_at, lease).await.unwrap().unwrap();
        assert_eq!(again.id, msg.id);
        assert_eq!(again.receives, 2);
    }

    #[tokio::test]
    async fn defer_refunds_the_receive() {
        let storage = test_storage().await;
        let job = sample_job("https://example.com/admission");
        storage.insert_job(&job).await.unwrap();

        let now = Utc::now();
        let lease = Duration::from_secs(60);
        for _ in 0..3 {
            let msg = storage.claim_dispatch(now, lease).await.unwrap().unwrap();
            assert_eq!(msg.receives, 1);
            storage.defer_dispatch(msg.id, now).await.unwrap();
        }
    }
}
