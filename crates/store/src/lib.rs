mod error;
mod row;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crawlhub_core::{
    Artifact, ArtifactKind, BlockingEvidence, CrawlerStrategy, EventLevel, FailureReason, Job,
    JobEvent, JobState, LastError, SiteStatus,
};

pub use error::StoreError;
use row::{crawler_strategy_str, failure_reason_str, job_state_str, site_status_str, JobRow};

/// Fields required to create a new job (§4.3 admission feeds this).
pub struct NewJob {
    pub id: String,
    pub token_hash: String,
    pub ip_hash: String,
    pub start_url: String,
    pub allowed_host: String,
    pub max_pages: u32,
    pub timeout_seconds: u64,
    pub ignore_path_prefixes: Vec<String>,
    pub use_js: bool,
    pub expiry_hours: u64,
}

/// A conditional update applied by `transition`. Absent fields are left
/// unchanged; this is the store's equivalent of a partial patch without
/// building SQL dynamically.
#[derive(Default)]
pub struct JobPatch {
    pub pages_fetched: Option<u64>,
    pub pages_exported: Option<u64>,
    pub errors_count: Option<u64>,
    pub restart_count: Option<u32>,
    pub fallback_retry_count: Option<u32>,
    pub site_status: Option<SiteStatus>,
    pub crawler_strategy: Option<CrawlerStrategy>,
    pub last_error: Option<LastError>,
    pub block_evidence: Option<BlockingEvidence>,
    pub set_started_at: bool,
    pub set_finished_at: bool,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        info!("migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `create_job(fields)` — job with QUEUED state plus an event row in
    /// the same transaction (§4.2).
    pub async fn create_job(&self, fields: NewJob) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let expires_at = now + ChronoDuration::hours(fields.expiry_hours as i64);
        let prefixes = serde_json::to_value(&fields.ignore_path_prefixes)?;

        let row: JobRow = sqlx::query_as(
            r#"INSERT INTO jobs (
                id, token_hash, ip_hash, start_url, allowed_host, max_pages,
                timeout_seconds, ignore_path_prefixes, use_js, state,
                created_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'QUEUED', $10, $11)
            RETURNING *"#,
        )
        .bind(&fields.id)
        .bind(&fields.token_hash)
        .bind(&fields.ip_hash)
        .bind(&fields.start_url)
        .bind(&fields.allowed_host)
        .bind(fields.max_pages as i32)
        .bind(fields.timeout_seconds as i64)
        .bind(&prefixes)
        .bind(fields.use_js)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO job_events (job_id, at, level, event_type, payload)
             VALUES ($1, $2, 'info', 'job_created', '{}')",
        )
        .bind(&fields.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn get_job_by_token(&self, id: &str, token_hash: &str) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE id = $1 AND token_hash = $2")
                .bind(id)
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// `lease_next_queued()` — returns at most one job, atomically moving
    /// it to RUNNING and setting `started_at` on first entry. Safe under N
    /// concurrent workers via `FOR UPDATE SKIP LOCKED`.
    pub async fn lease_next_queued(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let row: Option<JobRow> = sqlx::query_as(
            r#"UPDATE jobs SET
                state = 'RUNNING',
                started_at = COALESCE(started_at, $2),
                runner_heartbeat_at = $2,
                last_progress_at = COALESCE(last_progress_at, $2)
               WHERE id = (
                   SELECT id FROM jobs
                   WHERE state = 'QUEUED'
                   ORDER BY created_at
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING *"#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref r) = row {
            self.record_event(&JobEvent {
                job_id: r.id.clone(),
                at: now,
                level: EventLevel::Info,
                event_type: "state_change".to_string(),
                payload: serde_json::json!({"to": "RUNNING"}),
            })
            .await?;
        }
        row.map(TryInto::try_into).transpose()
    }

    /// `heartbeat(job_id, pages_fetched?)` — updates `runner_heartbeat_at`
    /// and, if `pages_fetched` rises, `last_progress_at`.
    pub async fn heartbeat(&self, job_id: &str, pages_fetched: Option<u64>) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE jobs SET
                runner_heartbeat_at = $2,
                pages_fetched = COALESCE($3, pages_fetched),
                last_progress_at = CASE
                    WHEN $3 IS NOT NULL AND $3 > pages_fetched THEN $2
                    ELSE last_progress_at
                END
               WHERE id = $1"#,
        )
        .bind(job_id)
        .bind(now)
        .bind(pages_fetched.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `transition(job_id, new_state, patch, expected_state_set?)` —
    /// conditional update; rejects transitions out of the terminal set.
    /// Returns `None` if the expected-state guard didn't match (optimistic
    /// concurrency: the caller lost the race or the state already moved).
    pub async fn transition(
        &self,
        job_id: &str,
        new_state: JobState,
        patch: JobPatch,
        expected_states: &[JobState],
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let expected: Vec<&'static str> = expected_states.iter().copied().map(job_state_str).collect();

        let row: Option<JobRow> = sqlx::query_as(
            r#"UPDATE jobs SET
                state = $2,
                pages_fetched = COALESCE($3, pages_fetched),
                pages_exported = COALESCE($4, pages_exported),
                errors_count = COALESCE($5, errors_count),
                restart_count = COALESCE($6, restart_count),
                fallback_retry_count = COALESCE($7, fallback_retry_count),
                site_status = COALESCE($8, site_status),
                crawler_strategy = COALESCE($9, crawler_strategy),
                last_error_reason = COALESCE($10, last_error_reason),
                last_error_message = COALESCE($11, last_error_message),
                block_evidence = COALESCE($12, block_evidence),
                started_at = CASE WHEN $13 THEN COALESCE(started_at, $14) ELSE started_at END,
                finished_at = CASE WHEN $15 THEN $14 ELSE finished_at END
               WHERE id = $1
                 AND state != ALL(ARRAY['DONE', 'FAILED', 'EXPIRED'])
                 AND ($16::text[] IS NULL OR state = ANY($16))
               RETURNING *"#,
        )
        .bind(job_id)
        .bind(job_state_str(new_state))
        .bind(patch.pages_fetched.map(|v| v as i64))
        .bind(patch.pages_exported.map(|v| v as i64))
        .bind(patch.errors_count.map(|v| v as i64))
        .bind(patch.restart_count.map(|v| v as i32))
        .bind(patch.fallback_retry_count.map(|v| v as i32))
        .bind(patch.site_status.map(site_status_str))
        .bind(patch.crawler_strategy.map(crawler_strategy_str))
        .bind(patch.last_error.as_ref().map(|e| failure_reason_str(e.reason)))
        .bind(patch.last_error.as_ref().map(|e| e.message.clone()))
        .bind(patch.block_evidence.as_ref().map(serde_json::to_value).transpose()?)
        .bind(patch.set_started_at)
        .bind(now)
        .bind(patch.set_finished_at)
        .bind(if expected.is_empty() { None } else { Some(expected) })
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref r) = row {
            self.record_event(&JobEvent {
                job_id: r.id.clone(),
                at: now,
                level: EventLevel::Info,
                event_type: "state_change".to_string(),
                payload: serde_json::json!({"to": job_state_str(new_state)}),
            })
            .await?;
        }
        row.map(TryInto::try_into).transpose()
    }

    /// `incr_ip_if_below(ip_hash, limit)` — atomic check-and-increment: the
    /// `ON CONFLICT ... WHERE` clause takes the row's lock and evaluates
    /// the limit in the same statement, so two concurrent admissions for
    /// the same IP can't both observe room under the limit (§4.3 admission
    /// must increment within the admission transaction). Returns the new
    /// count when admitted, `None` when the IP is already at its limit.
    pub async fn incr_ip_if_below(&self, ip_hash: &str, limit: i64) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO ip_usage (ip_hash, concurrent_count) VALUES ($1, 1)
             ON CONFLICT (ip_hash) DO UPDATE SET concurrent_count = ip_usage.concurrent_count + 1
             WHERE ip_usage.concurrent_count < $2
             RETURNING concurrent_count",
        )
        .bind(ip_hash)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// `decr_ip(ip_hash)` — decrement clamped at 0.
    pub async fn decr_ip(&self, ip_hash: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE ip_usage SET concurrent_count = GREATEST(concurrent_count - 1, 0) WHERE ip_hash = $1",
        )
        .bind(ip_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn concurrent_count(&self, ip_hash: &str) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT concurrent_count FROM ip_usage WHERE ip_hash = $1",
        )
        .bind(ip_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    /// Orphaned (§4.10): RUNNING/FINALIZING, heartbeat older than threshold.
    pub async fn find_orphaned(&self, threshold_seconds: i64) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(threshold_seconds);
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE state IN ('RUNNING', 'FINALIZING') AND runner_heartbeat_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Stalled: RUNNING, progress made, but not recently.
    pub async fn find_stalled(&self, threshold_seconds: i64) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(threshold_seconds);
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE state = 'RUNNING' AND pages_fetched > 0 AND last_progress_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Hard-stalled: RUNNING, zero pages, started long ago.
    pub async fn find_hard_stalled(&self, threshold_seconds: i64) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(threshold_seconds);
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE state = 'RUNNING' AND pages_fetched = 0 AND started_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Jobs cancelled but awaiting finalize (§4.10).
    pub async fn find_cancelled_awaiting_finalize(&self) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE state = 'CANCELLED' AND pages_fetched > 0 AND pages_exported = 0",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Non-terminal jobs past their retention window (expiry sweep).
    pub async fn find_expirable(&self) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE state NOT IN ('DONE', 'FAILED', 'EXPIRED', 'CANCELLED') AND expires_at < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn record_event(&self, event: &JobEvent) -> Result<(), StoreError> {
        let level = match event.level {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        };
        sqlx::query(
            "INSERT INTO job_events (job_id, at, level, event_type, payload) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.job_id)
        .bind(event.at)
        .bind(level)
        .bind(&event.event_type)
        .bind(&event.payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn register_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let kind = match artifact.kind {
            ArtifactKind::RawJsonl => "raw_jsonl",
            ArtifactKind::FinalJsonl => "final_jsonl",
            ArtifactKind::SummaryJson => "summary_json",
            ArtifactKind::RunnerLog => "runner_log",
            ArtifactKind::CrawlerLog => "crawler_log",
        };
        sqlx::query(
            "INSERT INTO artifacts (job_id, kind, path, byte_size, sha256) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&artifact.job_id)
        .bind(kind)
        .bind(&artifact.path)
        .bind(artifact.byte_size as i64)
        .bind(&artifact.sha256)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_artifacts(&self, job_id: &str) -> Result<Vec<Artifact>, StoreError> {
        let rows: Vec<(String, String, i64, Option<String>)> = sqlx::query_as(
            "SELECT kind, path, byte_size, sha256 FROM artifacts WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, path, byte_size, sha256)| {
                let kind = match kind.as_str() {
                    "raw_jsonl" => ArtifactKind::RawJsonl,
                    "final_jsonl" => ArtifactKind::FinalJsonl,
                    "summary_json" => ArtifactKind::SummaryJson,
                    "runner_log" => ArtifactKind::RunnerLog,
                    "crawler_log" => ArtifactKind::CrawlerLog,
                    other => return Err(StoreError::InvalidRow(format!("unknown artifact kind {other}"))),
                };
                Ok(Artifact {
                    job_id: job_id.to_string(),
                    kind,
                    path,
                    byte_size: byte_size as u64,
                    sha256,
                })
            })
            .collect()
    }

    /// Upserts a document for a job's content-hash identity layer (§3
    /// Document), returning `(document_id, created)`.
    pub async fn upsert_document(
        &self,
        job_id: &str,
        document_id: &str,
        content_hash: &str,
        primary_url: &str,
    ) -> Result<bool, StoreError> {
        let row: (bool,) = sqlx::query_as(
            r#"INSERT INTO documents (id, job_id, content_hash, primary_url)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (job_id, content_hash) DO NOTHING
               RETURNING true"#,
        )
        .bind(document_id)
        .bind(job_id)
        .bind(content_hash)
        .bind(primary_url)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or((false,));
        Ok(row.0)
    }

    pub async fn add_document_alias(
        &self,
        document_id: &str,
        url: &str,
        match_reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO document_aliases (document_id, url, match_reason) VALUES ($1, $2, $3)",
        )
        .bind(document_id)
        .bind(url)
        .bind(match_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn check_connectivity(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
