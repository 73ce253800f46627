//! JS fetcher (C8): drives a headless-browser collaborator over HTTP for
//! SPA content. Depth-first by default; same canonicalization, scope,
//! and extraction pipeline as the static fetcher.
//!
//! Grounded on `browserless-client`'s `BrowserlessClient::content` (a
//! thin `POST {base_url}/content` wrapper); reimplemented here directly
//! against `reqwest` rather than pulling the crate in, since the job's
//! per-request shape (single URL, plain JSON body) doesn't need the
//! collaborator's full surface.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crawlhub_blocking::BlockingTracker;
use crawlhub_canon::{Canonicalizer, ScopeFilter};
use crawlhub_core::{CrawlError, FetchJob, FetchOutcome, Fetcher};
use crawlhub_extract::{FetchedPage, IdentityTracker};
use crawlhub_frontier::Frontier;

const JS_LINK_CAP: usize = 50;
const SETTLE_DELAY: Duration = Duration::from_millis(500);

pub struct JsFetcherConfig {
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub tracking_params: Vec<String>,
    pub excluded_extensions: Vec<String>,
    pub deny_patterns: Vec<String>,
}

pub struct JsFetcher {
    client: Client,
    config: JsFetcherConfig,
}

impl JsFetcher {
    pub fn new(config: JsFetcherConfig) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CrawlError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn render(&self, url: &url::Url) -> Result<String, CrawlError> {
        let mut endpoint = format!("{}/content", self.config.browserless_url.trim_end_matches('/'));
        if let Some(ref token) = self.config.browserless_token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let resp = self
            .client
            .post(&endpoint)
            .json(&serde_json::json!({ "url": url.as_str() }))
            .send()
            .await
            .map_err(|e| CrawlError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CrawlError::Network(format!(
                "browserless returned {}",
                resp.status()
            )));
        }

        resp.text().await.map_err(|e| CrawlError::Network(e.to_string()))
    }
}

#[async_trait]
impl Fetcher for JsFetcher {
    async fn run(
        &self,
        job: &FetchJob,
        out_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, CrawlError> {
        let canon = Canonicalizer::new(&self.config.tracking_params);
        let scope = ScopeFilter::new(
            &job.allowed_host,
            &job.ignore_path_prefixes,
            &self.config.excluded_extensions,
            &self.config.deny_patterns,
        );
        let frontier = Arc::new(Frontier::new(job.max_depth, &self.config.tracking_params));
        frontier.seed(job.start_url.clone()).await;

        let raw_path = out_dir.join("pages.raw.jsonl");
        let raw_file = tokio::fs::File::create(&raw_path)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        let writer = Arc::new(tokio::sync::Mutex::new(tokio::io::BufWriter::new(raw_file)));

        let identity = Arc::new(tokio::sync::Mutex::new(IdentityTracker::new()));
        let blocking = Arc::new(tokio::sync::Mutex::new(BlockingTracker::new()));

        let mut pages_fetched: u64 = 0;
        let mut errors_count: u64 = 0;
        let quality_pages = AtomicU64::new(0);

        let deadline = Instant::now() + Duration::from_secs(job.timeout_seconds);

        while let Some(entry) = frontier.pop_dfs().await {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                break;
            }
            if quality_pages.load(Ordering::Relaxed) >= job.max_pages as u64 {
                break;
            }
            if !scope.in_scope(&entry.url) {
                continue;
            }

            tokio::time::sleep(SETTLE_DELAY).await;

            match self.render(&entry.url).await {
                Ok(html) => {
                    let canonical_url = canon.canonicalize(&entry.url);
                    let page = FetchedPage {
                        url: entry.url.clone(),
                        canonical_url,
                        fetched_at: chrono::Utc::now(),
                        status_code: 200,
                        content_type: Some("text/html".to_string()),
                        html: html.clone(),
                        depth: entry.depth,
                    };

                    let mut record = crawlhub_extract::extract(&page);

                    {
                        let mut tracker = blocking.lock().await;
                        tracker.record_response(entry.url.as_str(), 200, Some(&html), None, Some(&record.text_hash));
                    }

                    if record.quality_passed {
                        let mut id_tracker = identity.lock().await;
                        let outcome =
                            id_tracker.observe(&record.text_hash, entry.url.as_str(), "content_hash");
                        record.document_id = Some(outcome.document_id);
                        record.is_duplicate = outcome.is_duplicate;
                        record.counts_toward_budget = !outcome.is_duplicate;
                        if record.counts_toward_budget {
                            quality_pages.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    pages_fetched += 1;

                    let parts = crawlhub_extract::html::parse(&html, &entry.url);
                    let links: Vec<(url::Url, u32)> = parts
                        .links
                        .into_iter()
                        .filter(|u| scope.in_scope(u))
                        .take(JS_LINK_CAP)
                        .map(|u| (u, entry.depth + 1))
                        .collect();
                    frontier.push_batch(links).await;

                    let mut w = writer.lock().await;
                    if let Ok(mut line) = serde_json::to_vec(&record) {
                        line.push(b'\n');
                        let _ = w.write_all(&line).await;
                    }
                }
                Err(e) => {
                    warn!(url = %entry.url, error = %e, "js fetch failed");
                    errors_count += 1;
                }
            }
        }

        {
            let mut w = writer.lock().await;
            let _ = w.flush().await;
        }

        let evidence = blocking.lock().await.evidence();
        let evidence_path = out_dir.join("blocking_evidence.json");
        if let Ok(json) = serde_json::to_vec_pretty(&evidence) {
            let _ = tokio::fs::write(&evidence_path, json).await;
        }

        Ok(FetchOutcome {
            pages_fetched,
            errors_count,
        })
    }
}
