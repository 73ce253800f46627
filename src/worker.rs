//! Job orchestrator: C4 state-machine glue, C9 strategy invocation, and
//! the C10 heartbeat/stuck-detector. Grounded on the teacher's
//! `run_crawl` in `crawl.rs` — a poll loop, a cooperative sidecar task,
//! and a `ctrl_c()`-driven graceful shutdown — generalized from
//! per-network worker pools to a single job-at-a-time lease loop, since
//! concurrency here lives inside the fetchers (C7/C8) rather than across
//! jobs. The teacher's `broadcast::channel` shutdown signal is
//! represented as a `CancellationToken` instead, so it composes directly
//! with the `Fetcher` trait's own cancellation parameter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crawlhub_blocking::ClassifierThresholds;
use crawlhub_core::{
    AppConfig, BlockingEvidence, CrawlError, CrawlerStrategy, FailureReason, FetchJob, Fetcher,
    Job, JobState, LastError, SiteStatus,
};
use crawlhub_fetch::{strategy, JsFetcher, JsFetcherConfig, StaticFetcher, StaticFetcherConfig};
use crawlhub_store::{JobPatch, Store, StoreError};

pub fn job_dir(data_dir: &Path, job_id: &str) -> PathBuf {
    Path::new(data_dir).join(job_id)
}

/// Runs until `shutdown` is cancelled: each tick sweeps for stuck/orphaned
/// jobs, then leases and fully processes at most one queued job before
/// looping again (§5: "a poll loop picking one job at a time").
pub async fn run(config: Arc<AppConfig>, store: Store, shutdown: CancellationToken) {
    info!("worker loop starting");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if let Err(e) = sweep_liveness(&store, &config).await {
            error!(error = %e, "liveness sweep failed");
        }

        match store.lease_next_queued().await {
            Ok(Some(job)) => {
                info!(job_id = %job.id, "leased job");
                run_job(&config, &store, job, shutdown.child_token()).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "lease_next_queued failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(config.liveness.worker_poll_interval_seconds)) => {}
        }
    }
    info!("worker loop stopped");
}

struct FetchPhaseResult {
    pages_fetched: u64,
    errors_count: u64,
    site_status: SiteStatus,
    crawler_strategy: CrawlerStrategy,
    fallback_retry_count: u32,
    block_evidence: BlockingEvidence,
}

async fn run_job(config: &AppConfig, store: &Store, job: Job, cancel: CancellationToken) {
    let out_dir = job_dir(Path::new(&config.general.data_dir), &job.id);
    if let Err(e) = tokio::fs::create_dir_all(&out_dir).await {
        fail_job(store, &job, FailureReason::Unknown, format!("could not create job directory: {e}")).await;
        return;
    }

    let heartbeat_stop = CancellationToken::new();
    let heartbeat_handle = spawn_heartbeat(
        store.clone(),
        job.id.clone(),
        out_dir.clone(),
        config.liveness.heartbeat_interval_seconds,
        heartbeat_stop.clone(),
    );

    let phase = run_fetch_phase(config, &job, &out_dir, cancel).await;

    heartbeat_stop.cancel();
    let _ = heartbeat_handle.await;

    let phase = match phase {
        Ok(p) => p,
        Err(e) => {
            fail_job(store, &job, FailureReason::from(&e), e.to_string()).await;
            return;
        }
    };

    if phase.pages_fetched == 0 && phase.fallback_retry_count >= 1 {
        // §8 scenario 3: both the static pass and its one fallback produced nothing.
        fail_job(store, &job, FailureReason::Blocked, "no pages fetched after fallback".to_string()).await;
        return;
    }

    let transitioned = store
        .transition(
            &job.id,
            JobState::Finalizing,
            JobPatch {
                pages_fetched: Some(phase.pages_fetched),
                errors_count: Some(phase.errors_count),
                site_status: Some(phase.site_status),
                crawler_strategy: Some(phase.crawler_strategy),
                fallback_retry_count: Some(phase.fallback_retry_count),
                block_evidence: Some(phase.block_evidence.clone()),
                ..Default::default()
            },
            &[JobState::Running],
        )
        .await;

    match transitioned {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(job_id = %job.id, "job left RUNNING before finalize transition (cancelled/restarted concurrently)");
            return;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "store transition to FINALIZING failed");
            return;
        }
    }

    finalize_job(config, store, &job, phase.fallback_retry_count > 0, phase.site_status).await;
}

async fn finalize_job(config: &AppConfig, store: &Store, job: &Job, fallback_occurred: bool, site_status: SiteStatus) {
    let out_dir = job_dir(Path::new(&config.general.data_dir), &job.id);
    let started_at = job.started_at.unwrap_or(job.created_at);

    match crawlhub_finalize::finalize(&job.id, &out_dir, started_at, chrono::Utc::now(), fallback_occurred, site_status).await {
        Ok(outcome) => {
            for artifact in &outcome.artifacts {
                if let Err(e) = store.register_artifact(artifact).await {
                    warn!(job_id = %job.id, error = %e, "failed to register artifact");
                }
            }
            let transitioned = store
                .transition(
                    &job.id,
                    JobState::Done,
                    JobPatch {
                        pages_exported: Some(outcome.pages_exported),
                        set_finished_at: true,
                        ..Default::default()
                    },
                    &[JobState::Finalizing, JobState::Cancelled],
                )
                .await;
            match transitioned {
                Ok(Some(_)) => {
                    let _ = store.decr_ip(&job.ip_hash).await;
                }
                Ok(None) => {
                    warn!(job_id = %job.id, "DONE transition did not apply (state moved concurrently); skipping decr_ip");
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "store transition to DONE failed; skipping decr_ip");
                }
            }
        }
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "finalize failed");
            fail_job(store, job, FailureReason::FinalizationFailed, e.to_string()).await;
        }
    }
}

async fn fail_job(store: &Store, job: &Job, reason: FailureReason, message: String) {
    let _ = store
        .transition(
            &job.id,
            JobState::Failed,
            JobPatch {
                last_error: Some(LastError { reason, message }),
                set_finished_at: true,
                ..Default::default()
            },
            &[],
        )
        .await;
    let _ = store.decr_ip(&job.ip_hash).await;
}

async fn run_fetch_phase(
    config: &AppConfig,
    job: &Job,
    out_dir: &Path,
    cancel: CancellationToken,
) -> Result<FetchPhaseResult, CrawlError> {
    let start_url: url::Url = job
        .start_url
        .parse()
        .map_err(|_| CrawlError::InvalidUrl(job.start_url.clone()))?;

    let fetch_job = FetchJob {
        job_id: job.id.clone(),
        start_url,
        allowed_host: job.allowed_host.clone(),
        ignore_path_prefixes: job.ignore_path_prefixes.clone(),
        max_pages: job.max_pages,
        timeout_seconds: job.timeout_seconds,
        max_depth: config.fetch.max_depth,
    };

    let preflight = strategy::select_preflight(job.use_js, &job.allowed_host, &config.fetch.js_heavy_host_patterns);
    info!(job_id = %job.id, strategy = ?preflight.strategy, reason = ?preflight.reason, "preflight strategy selected");

    let thresholds = ClassifierThresholds {
        rate_429_threshold: config.blocking.rate_429_threshold,
        rate_403_threshold: config.blocking.rate_403_threshold,
        duplicate_hash_threshold: config.blocking.duplicate_hash_threshold,
    };

    if preflight.strategy == CrawlerStrategy::JsPreemptive {
        let fetcher = build_js_fetcher(config)?;
        let outcome = fetcher.run(&fetch_job, out_dir, cancel).await?;
        let mut evidence = read_blocking_evidence(out_dir).await;
        let (site_status, _) = crawlhub_blocking::classify(&evidence, &thresholds);
        crawlhub_blocking::annotate_signals(&mut evidence, &thresholds);
        return Ok(FetchPhaseResult {
            pages_fetched: outcome.pages_fetched,
            errors_count: outcome.errors_count,
            site_status,
            crawler_strategy: CrawlerStrategy::JsPreemptive,
            fallback_retry_count: 0,
            block_evidence: evidence,
        });
    }

    let static_fetcher = build_static_fetcher(config)?;
    let outcome = static_fetcher.run(&fetch_job, out_dir, cancel.clone()).await?;
    let mut evidence = read_blocking_evidence(out_dir).await;
    let (site_status, _) = crawlhub_blocking::classify(&evidence, &thresholds);

    let decision = strategy::should_fallback(outcome.pages_fetched, site_status, job.fallback_retry_count);
    if !decision.should_fallback {
        crawlhub_blocking::annotate_signals(&mut evidence, &thresholds);
        return Ok(FetchPhaseResult {
            pages_fetched: outcome.pages_fetched,
            errors_count: outcome.errors_count,
            site_status,
            crawler_strategy: CrawlerStrategy::Static,
            fallback_retry_count: job.fallback_retry_count,
            block_evidence: evidence,
        });
    }

    info!(job_id = %job.id, reason = ?decision.reason, "fallback triggered");

    let raw_path = out_dir.join("pages.raw.jsonl");
    let preserved_path = out_dir.join("pages.raw.static.jsonl");
    let _ = tokio::fs::rename(&raw_path, &preserved_path).await;

    let js_fetcher = build_js_fetcher(config)?;
    let js_outcome = js_fetcher.run(&fetch_job, out_dir, cancel).await?;

    if let Err(e) = combine_raw_logs(&preserved_path, &raw_path).await {
        warn!(job_id = %job.id, error = %e, "failed to splice static/js raw logs together");
    }

    crawlhub_blocking::annotate_signals(&mut evidence, &thresholds);

    Ok(FetchPhaseResult {
        pages_fetched: outcome.pages_fetched + js_outcome.pages_fetched,
        errors_count: outcome.errors_count + js_outcome.errors_count,
        site_status,
        crawler_strategy: CrawlerStrategy::StaticFallbackJs,
        fallback_retry_count: 1,
        block_evidence: evidence,
    })
}

/// Splices the preserved static-pass log ahead of the JS fetcher's own
/// `pages.raw.jsonl`, so the finalizer's last-occurrence-wins dedup rule
/// prefers the fallback pass's records for any URL both passes produced.
async fn combine_raw_logs(preserved: &Path, final_path: &Path) -> Result<(), CrawlError> {
    let js_content = tokio::fs::read(final_path).await.unwrap_or_default();
    let mut combined = tokio::fs::read(preserved).await.unwrap_or_default();
    combined.extend_from_slice(&js_content);
    tokio::fs::write(final_path, combined)
        .await
        .map_err(|e| CrawlError::Storage(e.to_string()))?;
    let _ = tokio::fs::remove_file(preserved).await;
    Ok(())
}

async fn read_blocking_evidence(out_dir: &Path) -> BlockingEvidence {
    let path = out_dir.join("blocking_evidence.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => BlockingEvidence::default(),
    }
}

fn build_static_fetcher(config: &AppConfig) -> Result<StaticFetcher, CrawlError> {
    StaticFetcher::new(StaticFetcherConfig {
        global_concurrency: config.fetch.global_concurrency,
        per_host_concurrency: config.fetch.per_host_concurrency,
        base_delay_ms: config.fetch.base_delay_ms,
        circuit_breaker_failures: config.fetch.circuit_breaker_failures,
        circuit_breaker_open_seconds: config.fetch.circuit_breaker_open_seconds,
        tracking_params: config.fetch.tracking_params.clone(),
        excluded_extensions: config.fetch.excluded_extensions.clone(),
        deny_patterns: config.fetch.deny_patterns.clone(),
    })
}

fn build_js_fetcher(config: &AppConfig) -> Result<JsFetcher, CrawlError> {
    JsFetcher::new(JsFetcherConfig {
        browserless_url: config.fetch.browserless_url.clone(),
        browserless_token: config.fetch.browserless_token.clone(),
        tracking_params: config.fetch.tracking_params.clone(),
        excluded_extensions: config.fetch.excluded_extensions.clone(),
        deny_patterns: config.fetch.deny_patterns.clone(),
    })
}

fn spawn_heartbeat(
    store: Store,
    job_id: String,
    out_dir: PathBuf,
    interval_seconds: u64,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(interval_seconds)) => {}
            }
            let pages = count_lines(&out_dir.join("pages.raw.jsonl")).await;
            if let Err(e) = store.heartbeat(&job_id, Some(pages)).await {
                warn!(job_id = %job_id, error = %e, "heartbeat write failed");
            }
        }
    })
}

async fn count_lines(path: &Path) -> u64 {
    let Ok(file) = tokio::fs::File::open(path).await else {
        return 0;
    };
    let mut lines = BufReader::new(file).lines();
    let mut n = 0u64;
    while let Ok(Some(_)) = lines.next_line().await {
        n += 1;
    }
    n
}

/// C10: one liveness sweep. Restarts orphaned/stalled jobs within the
/// restart budget, fails those past it, fails hard-stalled jobs outright,
/// finalizes cancelled-but-unexported jobs, and expires anything past its
/// retention window.
async fn sweep_liveness(store: &Store, config: &AppConfig) -> Result<(), StoreError> {
    for job in store.find_orphaned(config.liveness.orphan_threshold_seconds as i64).await? {
        if job.restart_count < config.liveness.max_restarts {
            let _ = store
                .transition(
                    &job.id,
                    JobState::Queued,
                    JobPatch { restart_count: Some(job.restart_count + 1), ..Default::default() },
                    &[JobState::Running, JobState::Finalizing],
                )
                .await;
            info!(job_id = %job.id, "restarted orphaned job");
        } else {
            fail_job(store, &job, FailureReason::Orphaned, "exceeded restart budget while orphaned".to_string()).await;
        }
    }

    for job in store.find_stalled(config.liveness.stall_threshold_seconds as i64).await? {
        if job.restart_count < config.liveness.max_restarts {
            let _ = store
                .transition(
                    &job.id,
                    JobState::Queued,
                    JobPatch { restart_count: Some(job.restart_count + 1), ..Default::default() },
                    &[JobState::Running],
                )
                .await;
            info!(job_id = %job.id, "restarted stalled job");
        } else {
            fail_job(store, &job, FailureReason::Stalled, "exceeded restart budget while stalled".to_string()).await;
        }
    }

    for job in store.find_hard_stalled(config.liveness.hard_stall_threshold_seconds as i64).await? {
        fail_job(store, &job, FailureReason::HardStalled, "zero pages fetched within the hard-stall window".to_string()).await;
    }

    for job in store.find_cancelled_awaiting_finalize().await? {
        info!(job_id = %job.id, "finalizing cancelled job with partial output");
        finalize_job(config, store, &job, job.fallback_retry_count > 0, job.site_status.unwrap_or(SiteStatus::Normal)).await;
    }

    for job in store.find_expirable().await? {
        let _ = store
            .transition(&job.id, JobState::Expired, JobPatch { set_finished_at: true, ..Default::default() }, &[])
            .await;
        let _ = store.decr_ip(&job.ip_hash).await;
    }

    Ok(())
}
