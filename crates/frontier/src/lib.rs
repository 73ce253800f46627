//! Per-job URL frontier: a depth-bounded BFS/DFS queue with a seen-set,
//! scoped to a single job's single allowed host.
//!
//! Adapted from the teacher's `CrawlFrontier` (growable-bloom seen-set +
//! per-network queues): a job here has exactly one "network" (its own
//! host), so the per-network `DashMap` partitioning collapses to a single
//! queue guarded by a `Mutex`, and the priority queue collapses to a
//! plain `VecDeque` ordered by discovery (front = next to pop).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use growable_bloom_filter::GrowableBloom;
use tokio::sync::Mutex;
use url::Url;

use crawlhub_canon::Canonicalizer;

#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub url: Url,
    pub depth: u32,
}

pub struct Frontier {
    seen: Mutex<GrowableBloom>,
    queue: Mutex<VecDeque<FrontierEntry>>,
    max_depth: u32,
    host_last_seen: DashMap<String, Instant>,
    canon: Canonicalizer,
}

impl Frontier {
    pub fn new(max_depth: u32, tracking_params: &[String]) -> Self {
        Self {
            seen: Mutex::new(GrowableBloom::new(0.001, 10_000)),
            queue: Mutex::new(VecDeque::new()),
            max_depth,
            host_last_seen: DashMap::new(),
            canon: Canonicalizer::new(tracking_params),
        }
    }

    /// Seeds the frontier with the job's start URL at depth 0. Always
    /// enqueued, even if (improbably) already marked seen.
    pub async fn seed(&self, url: Url) {
        let key = self.canon.canonicalize(&url);
        {
            let mut seen = self.seen.lock().await;
            seen.insert(&key);
        }
        self.queue.lock().await.push_back(FrontierEntry { url, depth: 0 });
    }

    /// Pushes a discovered link. Returns `false` if already seen, beyond
    /// `max_depth`, or already queued.
    pub async fn push(&self, url: Url, depth: u32) -> bool {
        if depth > self.max_depth {
            return false;
        }
        let key = self.canon.canonicalize(&url);
        {
            let mut seen = self.seen.lock().await;
            if seen.contains(&key) {
                return false;
            }
            seen.insert(&key);
        }
        self.queue.lock().await.push_back(FrontierEntry { url, depth });
        true
    }

    /// Pushes a batch of discovered links in one lock acquisition each for
    /// seen-check and enqueue. Returns the number actually enqueued.
    pub async fn push_batch(&self, links: Vec<(Url, u32)>) -> usize {
        let mut fresh = Vec::with_capacity(links.len());
        {
            let mut seen = self.seen.lock().await;
            for (url, depth) in links {
                if depth > self.max_depth {
                    continue;
                }
                let key = self.canon.canonicalize(&url);
                if seen.contains(&key) {
                    continue;
                }
                seen.insert(&key);
                fresh.push(FrontierEntry { url, depth });
            }
        }
        let added = fresh.len();
        if added > 0 {
            let mut queue = self.queue.lock().await;
            queue.extend(fresh);
        }
        added
    }

    /// BFS pop: oldest-discovered first. Used by the static fetcher (§4.7).
    pub async fn pop_bfs(&self) -> Option<FrontierEntry> {
        self.queue.lock().await.pop_front()
    }

    /// DFS pop: most-recently-discovered first. Used by the JS fetcher,
    /// which is depth-first by default (§4.8).
    pub async fn pop_dfs(&self) -> Option<FrontierEntry> {
        self.queue.lock().await.pop_back()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Records that we just issued a request to `host`, for politeness
    /// delay checks.
    pub fn record_host_visit(&self, host: &str) {
        self.host_last_seen.insert(host.to_string(), Instant::now());
    }

    /// Whether enough time has elapsed since the last visit to `host`.
    pub fn can_visit_host(&self, host: &str, min_delay: Duration) -> bool {
        match self.host_last_seen.get(host) {
            Some(last) => last.elapsed() >= min_delay,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlhub_canon::default_tracking_params;

    fn frontier(max_depth: u32) -> Frontier {
        Frontier::new(max_depth, &default_tracking_params())
    }

    #[tokio::test]
    async fn seed_then_bfs_pop_returns_seed() {
        let f = frontier(3);
        f.seed(Url::parse("https://example.org/").unwrap()).await;
        let entry = f.pop_bfs().await.unwrap();
        assert_eq!(entry.depth, 0);
    }

    #[tokio::test]
    async fn push_dedups_by_canonical_url() {
        let f = frontier(3);
        f.seed(Url::parse("https://example.org/").unwrap()).await;
        let added = f.push(Url::parse("https://example.org/").unwrap(), 1).await;
        assert!(!added);
    }

    #[tokio::test]
    async fn push_rejects_beyond_max_depth() {
        let f = frontier(1);
        let added = f.push(Url::parse("https://example.org/a/b").unwrap(), 2).await;
        assert!(!added);
        assert!(f.is_empty().await);
    }

    #[tokio::test]
    async fn bfs_pop_is_fifo() {
        let f = frontier(5);
        f.push(Url::parse("https://example.org/a").unwrap(), 1).await;
        f.push(Url::parse("https://example.org/b").unwrap(), 1).await;
        let first = f.pop_bfs().await.unwrap();
        assert_eq!(first.url.path(), "/a");
    }

    #[tokio::test]
    async fn dfs_pop_is_lifo() {
        let f = frontier(5);
        f.push(Url::parse("https://example.org/a").unwrap(), 1).await;
        f.push(Url::parse("https://example.org/b").unwrap(), 1).await;
        let first = f.pop_dfs().await.unwrap();
        assert_eq!(first.url.path(), "/b");
    }

    #[test]
    fn host_visit_politeness() {
        let f = frontier(5);
        assert!(f.can_visit_host("example.org", Duration::from_millis(50)));
        f.record_host_visit("example.org");
        assert!(!f.can_visit_host("example.org", Duration::from_secs(60)));
    }
}
