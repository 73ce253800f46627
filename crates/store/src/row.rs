use chrono::{DateTime, Utc};
use crawlhub_core::{
    BlockingEvidence, CrawlerStrategy, FailureReason, Job, JobState, LastError, SiteStatus,
};
use sqlx::FromRow;

use crate::error::StoreError;

/// Raw column shape returned by `SELECT * FROM jobs`. Enum/JSON columns are
/// kept as their wire representation here and parsed in `TryFrom`.
#[derive(FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub token_hash: String,
    pub ip_hash: String,

    pub start_url: String,
    pub allowed_host: String,
    pub max_pages: i32,
    pub timeout_seconds: i64,
    pub ignore_path_prefixes: serde_json::Value,
    pub use_js: bool,

    pub state: String,

    pub pages_fetched: i64,
    pub pages_exported: i64,
    pub errors_count: i64,

    pub restart_count: i32,
    pub fallback_retry_count: i32,
    pub runner_heartbeat_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,

    pub site_status: Option<String>,
    pub crawler_strategy: Option<String>,
    pub last_error_reason: Option<String>,
    pub last_error_message: Option<String>,
    pub block_evidence: Option<serde_json::Value>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = parse_job_state(&row.state)?;
        let site_status = row.site_status.as_deref().map(parse_site_status).transpose()?;
        let crawler_strategy = row
            .crawler_strategy
            .as_deref()
            .map(parse_crawler_strategy)
            .transpose()?;
        let last_error = match (row.last_error_reason, row.last_error_message) {
            (Some(reason), Some(message)) => Some(LastError {
                reason: parse_failure_reason(&reason)?,
                message,
            }),
            _ => None,
        };
        let block_evidence = row
            .block_evidence
            .map(serde_json::from_value::<BlockingEvidence>)
            .transpose()?;
        let ignore_path_prefixes: Vec<String> = serde_json::from_value(row.ignore_path_prefixes)?;

        Ok(Job {
            id: row.id,
            token_hash: row.token_hash,
            ip_hash: row.ip_hash,
            start_url: row.start_url,
            allowed_host: row.allowed_host,
            max_pages: row.max_pages as u32,
            timeout_seconds: row.timeout_seconds as u64,
            ignore_path_prefixes,
            use_js: row.use_js,
            state,
            pages_fetched: row.pages_fetched as u64,
            pages_exported: row.pages_exported as u64,
            errors_count: row.errors_count as u64,
            restart_count: row.restart_count as u32,
            fallback_retry_count: row.fallback_retry_count as u32,
            runner_heartbeat_at: row.runner_heartbeat_at,
            last_progress_at: row.last_progress_at,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            expires_at: row.expires_at,
            site_status,
            crawler_strategy,
            last_error,
            block_evidence,
        })
    }
}

pub(crate) fn job_state_str(s: JobState) -> &'static str {
    match s {
        JobState::Queued => "QUEUED",
        JobState::Running => "RUNNING",
        JobState::Finalizing => "FINALIZING",
        JobState::Done => "DONE",
        JobState::Failed => "FAILED",
        JobState::Expired => "EXPIRED",
        JobState::Cancelled => "CANCELLED",
    }
}

fn parse_job_state(s: &str) -> Result<JobState, StoreError> {
    Ok(match s {
        "QUEUED" => JobState::Queued,
        "RUNNING" => JobState::Running,
        "FINALIZING" => JobState::Finalizing,
        "DONE" => JobState::Done,
        "FAILED" => JobState::Failed,
        "EXPIRED" => JobState::Expired,
        "CANCELLED" => JobState::Cancelled,
        other => return Err(StoreError::InvalidRow(format!("unknown job state {other}"))),
    })
}

pub(crate) fn site_status_str(s: SiteStatus) -> &'static str {
    match s {
        SiteStatus::Normal => "NORMAL",
        SiteStatus::Blocked => "BLOCKED",
        SiteStatus::LoginRequired => "LOGIN_REQUIRED",
        SiteStatus::Throttled => "THROTTLED",
    }
}

fn parse_site_status(s: &str) -> Result<SiteStatus, StoreError> {
    Ok(match s {
        "NORMAL" => SiteStatus::Normal,
        "BLOCKED" => SiteStatus::Blocked,
        "LOGIN_REQUIRED" => SiteStatus::LoginRequired,
        "THROTTLED" => SiteStatus::Throttled,
        other => return Err(StoreError::InvalidRow(format!("unknown site status {other}"))),
    })
}

pub(crate) fn crawler_strategy_str(s: CrawlerStrategy) -> &'static str {
    match s {
        CrawlerStrategy::Static => "static",
        CrawlerStrategy::JsPreemptive => "playwright_preemptive",
        CrawlerStrategy::StaticFallbackJs => "static_fallback_js",
    }
}

fn parse_crawler_strategy(s: &str) -> Result<CrawlerStrategy, StoreError> {
    Ok(match s {
        "static" => CrawlerStrategy::Static,
        "playwright_preemptive" => CrawlerStrategy::JsPreemptive,
        "static_fallback_js" => CrawlerStrategy::StaticFallbackJs,
        other => {
            return Err(StoreError::InvalidRow(format!(
                "unknown crawler strategy {other}"
            )))
        }
    })
}

pub(crate) fn failure_reason_str(r: FailureReason) -> &'static str {
    r.as_str()
}

fn parse_failure_reason(s: &str) -> Result<FailureReason, StoreError> {
    Ok(match s {
        "orphaned" => FailureReason::Orphaned,
        "stalled" => FailureReason::Stalled,
        "hard_stalled" => FailureReason::HardStalled,
        "rate_limited" => FailureReason::RateLimited,
        "blocked" => FailureReason::Blocked,
        "captcha_detected" => FailureReason::CaptchaDetected,
        "login_required" => FailureReason::LoginRequired,
        "robots_denied" => FailureReason::RobotsDenied,
        "dns_failure" => FailureReason::DnsFailure,
        "connection_error" => FailureReason::ConnectionError,
        "timeout" => FailureReason::Timeout,
        "disk_full" => FailureReason::DiskFull,
        "unknown" => FailureReason::Unknown,
        "finalization_failed" => FailureReason::FinalizationFailed,
        other => return Err(StoreError::InvalidRow(format!("unknown failure reason {other}"))),
    })
}
