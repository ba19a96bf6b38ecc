//! Reaper/Pruner (X): the periodic janitor. Grounded on
//! `prunner/core/cleanup.py`: three independent checks run every sweep —
//! worker-side reconciliation (ask each backend what it actually has running
//! and tear down anything stopped or timed out), job-side `lost` detection (a
//! DB row says `running` but no backend can find the worker), and the gap
//! rule (a queued job sitting behind jobs the system has already moved past,
//! old enough that it will never be reached).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::db::Database;
use crate::instancer::backend::{WorkerBackend, WorkerState};

#[derive(Debug, Error)]
pub enum PrunnerError {
    #[error("backend error: {0}")]
    Backend(#[from] crate::instancer::backend::BackendError),
    #[error("database error: {0}")]
    Database(#[from] crate::error::DatabaseError),
}

pub struct PrunnerConfig {
    /// Worker-side timeout: a container/namespace running longer than this
    /// since start is considered timed out.
    pub max_worker_age: Duration,
    /// Job-side `lost` threshold: a DB row `running` longer than this with no
    /// confirmed worker anywhere is failed outright.
    pub lost_after: Duration,
}

impl Default for PrunnerConfig {
    fn default() -> Self {
        Self { max_worker_age: Duration::minutes(30), lost_after: Duration::minutes(5) }
    }
}

pub struct Prunner {
    db: Arc<dyn Database>,
    backends: Vec<Arc<dyn WorkerBackend>>,
    config: PrunnerConfig,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub workers_reaped: usize,
    pub jobs_marked_lost: usize,
    pub jobs_marked_gapped: usize,
}

impl Prunner {
    pub fn new(db: Arc<dyn Database>, backends: Vec<Arc<dyn WorkerBackend>>, config: PrunnerConfig) -> Self {
        Self { db, backends, config }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, PrunnerError> {
        let mut report = SweepReport::default();

        let mut all_running_job_ids = std::collections::HashSet::new();
        for backend in &self.backends {
            let swept = backend.sweep(self.config.max_worker_age).await?;
            for worker in &swept {
                match worker.state {
                    WorkerState::Active => {
                        all_running_job_ids.insert(worker.job_id);
                    }
                    WorkerState::Stopped => {
                        self.db.fail_job(worker.job_id, "crashed", Utc::now()).await?;
                        report.workers_reaped += 1;
                    }
                    WorkerState::TimedOut => {
                        self.db.fail_job(worker.job_id, "timeout", Utc::now()).await?;
                        report.workers_reaped += 1;
                    }
                    WorkerState::Lost => {
                        self.db.fail_job(worker.job_id, "lost", Utc::now()).await?;
                        report.workers_reaped += 1;
                    }
                    WorkerState::Completed => {
                        report.workers_reaped += 1;
                    }
                }
            }
        }

        report.jobs_marked_lost = self.reap_lost_jobs(&all_running_job_ids).await?;
        report.jobs_marked_gapped = self.reap_gapped_jobs().await?;

        Ok(report)
    }

    /// A job row stuck `running` past `lost_after` with no backend reporting
    /// an active worker for it is presumed lost — the worker crashed or was
    /// killed out-of-band and will never call back into Result Service.
    async fn reap_lost_jobs(
        &self,
        active_job_ids: &std::collections::HashSet<uuid::Uuid>,
    ) -> Result<usize, PrunnerError> {
        let cutoff = Utc::now() - self.config.lost_after;
        let running = self.db.running_jobs_older_than(cutoff).await?;

        let mut reaped = 0;
        for (job_id, _started_at) in running {
            if active_job_ids.contains(&job_id) {
                continue;
            }
            if self.db.fail_job(job_id, "lost", Utc::now()).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// A queued job is "gapped" when both (a) it is lexically older than the
    /// most recent non-queued job (meaning the system has already moved past
    /// its position) and (b) it is older than three times the worker timeout
    /// in absolute terms — two independent signals, because lex order alone
    /// can trip on a burst of near-simultaneous submissions.
    async fn reap_gapped_jobs(&self) -> Result<usize, PrunnerError> {
        let Some((anchor_created_at, anchor_id)) = self.db.newest_non_queued().await? else {
            return Ok(0);
        };
        let cutoff: DateTime<Utc> = Utc::now() - self.config.max_worker_age * 3;
        let gapped = self.db.gapped_queued_jobs(anchor_created_at, anchor_id, cutoff).await?;

        let mut reaped = 0;
        for job_id in gapped {
            if self.db.fail_job(job_id, "found in gap", Utc::now()).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    pub async fn run_forever(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(report) => tracing::info!(
                    workers_reaped = report.workers_reaped,
                    jobs_marked_lost = report.jobs_marked_lost,
                    jobs_marked_gapped = report.jobs_marked_gapped,
                    "sweep complete"
                ),
                Err(err) => tracing::error!(error = %err, "sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_thresholds() {
        let config = PrunnerConfig::default();
        assert_eq!(config.lost_after, Duration::minutes(5));
        assert_eq!(config.max_worker_age, Duration::minutes(30));
    }
}
