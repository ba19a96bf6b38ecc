//! Database abstraction layer for the Job entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::job::{Job, JobStatus};

/// Database abstraction over the Job entity. All status transitions are
/// compare-and-swap: the `WHERE status IN (...)` guard is what keeps the
/// global "a job is in exactly one status at a time" invariant true under
/// concurrent writers (Result Service vs. Reaper racing on the same job).
#[async_trait]
pub trait Database: Send + Sync {
    async fn insert_queued_job(
        &self,
        id: Uuid,
        user_id: &str,
        model: &str,
        file_name: &str,
        secret_ref: &str,
        result_token: &str,
    ) -> Result<Job>;

    async fn delete_job(&self, id: Uuid) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    async fn list_history(&self, user_id: &str, limit: i64) -> Result<Vec<Job>>;

    async fn set_public(&self, id: Uuid, user_id: &str, public: bool) -> Result<bool>;

    async fn has_active_job(&self, user_id: &str) -> Result<bool>;

    /// `1 + count of queued jobs strictly older than `id` by `(created_at, id)` lex order`.
    async fn queue_position(&self, id: Uuid) -> Result<Option<i64>>;

    /// CAS: `queued -> running`, stamping `started_at`. Returns true if applied.
    async fn transition_to_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// CAS: `{queued, running} -> failed`, stamping `finished_at` and `result_error`.
    async fn fail_job(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<bool>;

    /// CAS: requires current status to be `running`. Used by Result Service,
    /// which is the only writer allowed to record a `result`/`succeeded` outcome.
    async fn finalize_job(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        result_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn clear_secret_ref(&self, id: Uuid) -> Result<()>;

    /// Job ids with `status=running` whose `started_at` predates `cutoff`.
    async fn running_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Uuid, Option<DateTime<Utc>>)>>;

    /// The newest job with `status != queued`, used as the gap-rule anchor.
    async fn newest_non_queued(&self) -> Result<Option<(DateTime<Utc>, Uuid)>>;

    /// Queued jobs strictly older than `(anchor_created_at, anchor_id)` (lex order)
    /// and older than `cutoff`.
    async fn gapped_queued_jobs(
        &self,
        anchor_created_at: DateTime<Utc>,
        anchor_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;
}

/// Postgres-backed implementation via `deadpool_postgres`.
pub struct PgStore {
    pool: deadpool_postgres::Pool,
}

impl PgStore {
    pub async fn connect(dsn: &str, pool_size: usize) -> Result<Self> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(dsn.to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            ..Default::default()
        });
        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        // fail fast if the DSN is unreachable
        pool.get().await.map_err(DatabaseError::Pool)?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.map_err(DatabaseError::Pool)
    }

    fn row_to_job(row: &tokio_postgres::Row) -> Result<Job> {
        let status_str: String = row.get("status");
        let status: JobStatus = status_str
            .parse()
            .map_err(|reason| DatabaseError::Invalid { reason })?;
        Ok(Job {
            id: row.get("id"),
            status,
            user_id: row.get("user_id"),
            model: row.get("model"),
            file_name: row.get("file_name"),
            secret_ref: row.get("secret_ref"),
            result_token: row.get("result_token"),
            result: row.get("result"),
            result_error: row.get("result_error"),
            result_received_at: row.get("result_received_at"),
            public: row.get("public"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
    }
}

#[async_trait]
impl Database for PgStore {
    async fn insert_queued_job(
        &self,
        id: Uuid,
        user_id: &str,
        model: &str,
        file_name: &str,
        secret_ref: &str,
        result_token: &str,
    ) -> Result<Job> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "INSERT INTO jobs (id, status, user_id, model, file_name, secret_ref, result_token)
                 VALUES ($1, 'queued', $2, $3, $4, $5, $6)
                 RETURNING *",
                &[&id, &user_id, &model, &file_name, &secret_ref, &result_token],
            )
            .await?;
        Self::row_to_job(&row)
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM jobs WHERE id = $1", &[&id]).await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn().await?;
        let row = conn.query_opt("SELECT * FROM jobs WHERE id = $1", &[&id]).await?;
        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_history(&self, user_id: &str, limit: i64) -> Result<Vec<Job>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM jobs WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
                &[&user_id, &limit],
            )
            .await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn set_public(&self, id: Uuid, user_id: &str, public: bool) -> Result<bool> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE jobs SET public = $3 WHERE id = $1 AND user_id = $2",
                &[&id, &user_id, &public],
            )
            .await?;
        Ok(n > 0)
    }

    async fn has_active_job(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM jobs WHERE user_id = $1 AND status IN ('queued', 'running'))",
                &[&user_id],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn queue_position(&self, id: Uuid) -> Result<Option<i64>> {
        let conn = self.conn().await?;
        let job = match conn.query_opt("SELECT created_at, status FROM jobs WHERE id = $1", &[&id]).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        let status: String = job.get("status");
        if status != "queued" {
            return Ok(None);
        }
        let created_at: DateTime<Utc> = job.get("created_at");
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM jobs
                 WHERE status = 'queued'
                   AND (created_at < $2 OR (created_at = $2 AND id < $1))",
                &[&id, &created_at],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(Some(count + 1))
    }

    async fn transition_to_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE jobs SET status = 'running', started_at = $2
                 WHERE id = $1 AND status = 'queued'",
                &[&id, &now],
            )
            .await?;
        Ok(n > 0)
    }

    async fn fail_job(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE jobs SET status = 'failed', finished_at = $2, result_error = $3
                 WHERE id = $1 AND status IN ('queued', 'running')",
                &[&id, &now, &reason],
            )
            .await?;
        Ok(n > 0)
    }

    async fn finalize_job(
        &self,
        id: Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        result_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE jobs
                 SET status = $2, finished_at = $3, result = $4, result_error = $5, result_received_at = $3
                 WHERE id = $1 AND status = 'running'",
                &[&id, &status.as_str(), &now, &result, &result_error],
            )
            .await?;
        Ok(n > 0)
    }

    async fn clear_secret_ref(&self, id: Uuid) -> Result<()> {
        let conn = self.conn().await?;
        conn.execute("UPDATE jobs SET secret_ref = NULL WHERE id = $1", &[&id]).await?;
        Ok(())
    }

    async fn running_jobs_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<(Uuid, Option<DateTime<Utc>>)>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, started_at FROM jobs WHERE status = 'running' AND started_at < $1",
                &[&cutoff],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get("id"), r.get("started_at"))).collect())
    }

    async fn newest_non_queued(&self) -> Result<Option<(DateTime<Utc>, Uuid)>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT created_at, id FROM jobs WHERE status != 'queued' AND created_at IS NOT NULL
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.map(|r| (r.get("created_at"), r.get("id"))))
    }

    async fn gapped_queued_jobs(
        &self,
        anchor_created_at: DateTime<Utc>,
        anchor_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id FROM jobs
                 WHERE status = 'queued'
                   AND (created_at < $1 OR (created_at = $1 AND id < $2))
                   AND created_at < $3",
                &[&anchor_created_at, &anchor_id, &cutoff],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}
