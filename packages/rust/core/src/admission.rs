//! Job admission control with a rate-limit circuit breaker.
//!
//! The in-flight count is derived from chunk state on every call, never
//! kept as a separate counter.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use relingo_shared::{CircuitConfig, JobId, Result};
use relingo_storage::Storage;

/// Result of [`AdmissionController::try_admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new slot was granted.
    Admitted,
    /// The job already has chunk records (redelivered dispatch); it keeps its slot.
    AlreadyInFlight,
    /// No slot available; the caller must retry later.
    Deferred {
        in_flight: u64,
        limit: u32,
        circuit_open: bool,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Deferred { .. })
    }
}

/// Gates job dispatch on the number of jobs with a non-terminal chunk.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    limit: u32,
    circuit: CircuitConfig,
}

impl AdmissionController {
    pub fn new(limit: u32, circuit: CircuitConfig) -> Self {
        Self { limit, circuit }
    }

    /// Decide whether `job_id` may start.
    ///
    /// Callers must serialize admissions: two concurrent checks could both
    /// see the last free slot.
    pub async fn try_admit(
        &self,
        storage: &Storage,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        if storage.job_has_chunks(job_id).await? {
            debug!(%job_id, "job already in flight");
            return Ok(Admission::AlreadyInFlight);
        }

        let circuit_open = self.circuit_open(storage, now).await?;
        let limit = effective_limit(self.limit, circuit_open);
        let in_flight = storage.count_in_flight_jobs().await?;

        if admits(in_flight, limit) {
            info!(%job_id, in_flight, limit, "job admitted");
            Ok(Admission::Admitted)
        } else {
            debug!(%job_id, in_flight, limit, circuit_open, "job deferred");
            Ok(Admission::Deferred {
                in_flight,
                limit,
                circuit_open,
            })
        }
    }

    /// Whether enough rate-limit signals fell inside the window to stop
    /// admitting new work. A `trip_after` of 0 disables the breaker.
    pub async fn circuit_open(&self, storage: &Storage, now: DateTime<Utc>) -> Result<bool> {
        if self.circuit.trip_after == 0 {
            return Ok(false);
        }
        let since = now - self.circuit.window;
        let signals = storage.count_rate_limits_since(since).await?;
        Ok(signals >= u64::from(self.circuit.trip_after))
    }
}

fn effective_limit(limit: u32, circuit_open: bool) -> u32 {
    if circuit_open { 0 } else { limit }
}

fn admits(in_flight: u64, limit: u32) -> bool {
    in_flight < u64::from(limit)
}
