use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{CrawlError, FailureReason};

/// One of the seven states a job can be in. Transitions are owned by the
/// store (`crawlhub-store`); this type only names the states and carries
/// them across process/JSON boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Finalizing,
    Done,
    Failed,
    Expired,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Failed | JobState::Expired | JobState::Cancelled
        )
    }
}

/// End-of-crawl classification produced by the blocking analyzer (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteStatus {
    Normal,
    Blocked,
    LoginRequired,
    Throttled,
}

/// Which fetcher actually produced (or is producing) a job's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlerStrategy {
    Static,
    JsPreemptive,
    StaticFallbackJs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub reason: FailureReason,
    pub message: String,
}

/// The primary aggregate (§3 Job). Field set matches the data model;
/// timestamps are `None` until the corresponding lifecycle event occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Job {
    pub id: String,
    pub token_hash: String,
    pub ip_hash: String,

    pub start_url: String,
    pub allowed_host: String,
    pub max_pages: u32,
    pub timeout_seconds: u64,
    pub ignore_path_prefixes: Vec<String>,
    pub use_js: bool,

    pub state: JobState,

    pub pages_fetched: u64,
    pub pages_exported: u64,
    pub errors_count: u64,

    pub restart_count: u32,
    pub fallback_retry_count: u32,
    pub runner_heartbeat_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,

    pub site_status: Option<SiteStatus>,
    pub crawler_strategy: Option<CrawlerStrategy>,
    pub last_error: Option<LastError>,
    pub block_evidence: Option<BlockingEvidence>,
}

/// Hashed-IP concurrency counter (§3 IPUsage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpUsage {
    pub ip_hash: String,
    pub concurrent_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Append-only audit trail row (§3 JobEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RawJsonl,
    FinalJsonl,
    SummaryJson,
    RunnerLog,
    CrawlerLog,
}

/// A file produced by the finalizer (or worker) and registered in the
/// store (§3 Artifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub job_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub byte_size: u64,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Primary,
    Secondary,
    Fallback,
}

/// An entry in a page's section outline (heading level, title, anchor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub level: u8,
    pub title: String,
    pub anchor: String,
}

/// One line in `pages.raw.jsonl` (§3 RawPageRecord). Produced once per
/// fetched URL by the extraction pipeline; never updated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RawPageRecord {
    pub url: String,
    pub canonical_url: String,
    pub fetched_at: DateTime<Utc>,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub markdown: String,
    pub text_hash: String,
    pub extraction_mode: ExtractionMode,
    pub depth: u32,
    pub outlinks_count: u32,
    pub sections: Vec<Section>,
    pub breadcrumbs: Vec<String>,
    pub last_modified: Option<String>,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub quality_reasons: Vec<String>,
    pub document_id: Option<String>,
    pub is_duplicate: bool,
    pub counts_toward_budget: bool,
    pub error: Option<String>,
}

/// Per-job aggregate written by the blocking tracker (§3 BlockingEvidence).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BlockingEvidence {
    pub total_responses: u64,
    pub status_code_histogram: HashMap<u16, u64>,
    pub captcha_hits: u64,
    pub waf_hits: u64,
    pub login_redirects: u64,
    pub duplicate_ratio: f64,
    pub sample_urls: Vec<String>,
    pub signature_matches: Vec<String>,
    pub signals_detected: Vec<String>,
}

/// A content-hash-identified page; one or more URLs may alias to it
/// (§3 Document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content_hash: String,
    pub primary_url: String,
    pub aliases: Vec<DocumentAlias>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentAlias {
    pub url: String,
    pub match_reason: String,
}

/// The input a `Fetcher` implementation needs to run one job's crawl.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub job_id: String,
    pub start_url: Url,
    pub allowed_host: String,
    pub ignore_path_prefixes: Vec<String>,
    pub max_pages: u32,
    pub timeout_seconds: u64,
    pub max_depth: u32,
}

/// What a `Fetcher` reports back once it stops (normally, on timeout, on
/// budget signal, or on cancellation).
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub pages_fetched: u64,
    pub errors_count: u64,
}

/// Contract shared by the static fetcher (C7) and the JS fetcher (C8).
/// Both take a job plus a per-job output directory and a cancellation
/// signal, and report failure as a value rather than by unwinding — the
/// orchestrator never relies on panics/exceptions for control flow.
///
/// Mirrors `NetworkDriver` in the teacher's core crate: a single
/// `run`-shaped entry point lets the caller treat subprocess and
/// in-process fetchers interchangeably.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn run(
        &self,
        job: &FetchJob,
        out_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, CrawlError>;
}
