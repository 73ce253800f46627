//! Blocking signal tracker & analyzer (C6).
//!
//! Accumulates per-response signals into a `BlockingEvidence` as the
//! fetcher streams pages through, then classifies the job's `site_status`
//! at end-of-crawl. Regex signatures are grounded in the teacher's
//! `detect_captcha` (Cloudflare/reCAPTCHA/hCaptcha markers, "verification"/
//! "challenge" phrasing) in `darkscraper_parser::html`.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crawlhub_core::{BlockingEvidence, SiteStatus};

static CAPTCHA_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)g-recaptcha|grecaptcha|recaptcha",
        r"(?i)h-captcha|hcaptcha",
        r"(?i)cf-challenge|cf_challenge|challenge-platform|/cdn-cgi/challenge-platform",
        r"(?i)verify you are human|are you a human|human verification",
        r"(?i)checking your browser before accessing",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static captcha pattern"))
    .collect()
});

static WAF_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)mod_security|modsecurity",
        r"(?i)request blocked.*incapsula|incapsula incident",
        r"(?i)akamai.*reference #|access denied.*akamai",
        r"(?i)sucuri.*website firewall|sucuri/cloudproxy",
        r"(?i)blocked by imperva",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static waf pattern"))
    .collect()
});

static LOGIN_PATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)/(login|signin|sign-in|auth)(/|$|\?)"]
        .into_iter()
        .map(|p| Regex::new(p).expect("static login path pattern"))
        .collect()
});

static META_REFRESH_LOGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta[^>]+http-equiv=["']?refresh["']?[^>]*url=([^"'>\s]+)"#)
        .expect("static meta refresh pattern")
});

const MAX_SAMPLE_URLS: usize = 5;
const MAX_SIGNATURE_MATCHES: usize = 10;

pub struct BlockingTracker {
    total_responses: u64,
    status_code_histogram: HashMap<u16, u64>,
    captcha_hits: u64,
    waf_hits: u64,
    login_redirects: u64,
    sample_urls: Vec<String>,
    signature_matches: Vec<String>,
    seen_hashes: HashSet<String>,
    total_hashes: u64,
}

impl Default for BlockingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingTracker {
    pub fn new() -> Self {
        Self {
            total_responses: 0,
            status_code_histogram: HashMap::new(),
            captcha_hits: 0,
            waf_hits: 0,
            login_redirects: 0,
            sample_urls: Vec::new(),
            signature_matches: Vec::new(),
            seen_hashes: HashSet::new(),
            total_hashes: 0,
        }
    }

    /// Records one fetcher response. `body` is the rendered/raw HTML when
    /// available; `location` is the `Location` header on a redirect
    /// response; `text_hash` is the extracted page's content hash, used
    /// for the duplicate-ratio signal.
    pub fn record_response(
        &mut self,
        url: &str,
        status: u16,
        body: Option<&str>,
        location: Option<&str>,
        text_hash: Option<&str>,
    ) {
        self.total_responses += 1;
        *self.status_code_histogram.entry(status).or_insert(0) += 1;

        let mut flagged = false;

        if let Some(body) = body {
            for re in CAPTCHA_PATTERNS.iter() {
                if re.is_match(body) {
                    self.captcha_hits += 1;
                    self.push_signature(format!("captcha:{}", re.as_str()));
                    flagged = true;
                    break;
                }
            }
            for re in WAF_PATTERNS.iter() {
                if re.is_match(body) {
                    self.waf_hits += 1;
                    self.push_signature(format!("waf:{}", re.as_str()));
                    flagged = true;
                    break;
                }
            }
            if let Some(caps) = META_REFRESH_LOGIN.captures(body) {
                if let Some(target) = caps.get(1) {
                    if LOGIN_PATH_PATTERNS.iter().any(|re| re.is_match(target.as_str())) {
                        self.login_redirects += 1;
                        flagged = true;
                    }
                }
            }
        }

        if (300..400).contains(&status) {
            if let Some(location) = location {
                if LOGIN_PATH_PATTERNS.iter().any(|re| re.is_match(location)) {
                    self.login_redirects += 1;
                    flagged = true;
                }
            }
        }

        if flagged && self.sample_urls.len() < MAX_SAMPLE_URLS {
            self.sample_urls.push(url.to_string());
        }

        if let Some(hash) = text_hash {
            self.total_hashes += 1;
            self.seen_hashes.insert(hash.to_string());
        }
    }

    fn push_signature(&mut self, signature: String) {
        if self.signature_matches.len() < MAX_SIGNATURE_MATCHES {
            self.signature_matches.push(signature);
        }
    }

    fn duplicate_ratio(&self) -> f64 {
        if self.total_hashes == 0 {
            return 0.0;
        }
        1.0 - (self.seen_hashes.len() as f64 / self.total_hashes as f64)
    }

    /// Materializes the accumulated signals into the persisted
    /// `BlockingEvidence` shape.
    pub fn evidence(&self) -> BlockingEvidence {
        BlockingEvidence {
            total_responses: self.total_responses,
            status_code_histogram: self.status_code_histogram.clone(),
            captcha_hits: self.captcha_hits,
            waf_hits: self.waf_hits,
            login_redirects: self.login_redirects,
            duplicate_ratio: self.duplicate_ratio(),
            sample_urls: self.sample_urls.clone(),
            signature_matches: self.signature_matches.clone(),
            signals_detected: Vec::new(),
        }
    }
}

/// Thresholds the classifier compares against; mirrors
/// `crawlhub_core::config::BlockingConfig`.
pub struct ClassifierThresholds {
    pub rate_429_threshold: f64,
    pub rate_403_threshold: f64,
    pub duplicate_hash_threshold: f64,
}

/// End-of-crawl classification (§4.6). Deterministic: depends only on
/// `evidence` and `thresholds`, and checks conditions in table order so
/// the first match wins.
pub fn classify(evidence: &BlockingEvidence, thresholds: &ClassifierThresholds) -> (SiteStatus, bool) {
    let total = evidence.total_responses.max(1) as f64;
    let rate_429 = *evidence.status_code_histogram.get(&429).unwrap_or(&0) as f64 / total;
    let rate_403 = *evidence.status_code_histogram.get(&403).unwrap_or(&0) as f64 / total;

    if evidence.captcha_hits + evidence.waf_hits > 0 {
        return (SiteStatus::Blocked, true);
    }
    if evidence.total_responses > 0
        && evidence.login_redirects as f64 > 0.5 * evidence.total_responses as f64
    {
        return (SiteStatus::LoginRequired, false);
    }
    if rate_429 >= thresholds.rate_429_threshold {
        return (SiteStatus::Throttled, true);
    }
    if rate_403 >= thresholds.rate_403_threshold {
        return (SiteStatus::Blocked, true);
    }
    if evidence.duplicate_ratio >= thresholds.duplicate_hash_threshold {
        return (SiteStatus::Blocked, true);
    }
    (SiteStatus::Normal, false)
}

/// Annotates `signals_detected` on a finalized evidence record for
/// `summary.json`, matching the condition that actually fired.
pub fn annotate_signals(evidence: &mut BlockingEvidence, thresholds: &ClassifierThresholds) {
    let total = evidence.total_responses.max(1) as f64;
    let rate_429 = *evidence.status_code_histogram.get(&429).unwrap_or(&0) as f64 / total;
    let rate_403 = *evidence.status_code_histogram.get(&403).unwrap_or(&0) as f64 / total;

    if evidence.captcha_hits > 0 {
        evidence.signals_detected.push("captcha_detected".to_string());
    }
    if evidence.waf_hits > 0 {
        evidence.signals_detected.push("waf_detected".to_string());
    }
    if evidence.login_redirects as f64 > 0.5 * evidence.total_responses as f64
        && evidence.total_responses > 0
    {
        evidence.signals_detected.push("login_required".to_string());
    }
    if rate_429 >= thresholds.rate_429_threshold {
        evidence.signals_detected.push("excessive_429".to_string());
    }
    if rate_403 >= thresholds.rate_403_threshold {
        evidence.signals_detected.push("excessive_403".to_string());
    }
    if evidence.duplicate_ratio >= thresholds.duplicate_hash_threshold {
        evidence.signals_detected.push("duplicate_content".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> ClassifierThresholds {
        ClassifierThresholds {
            rate_429_threshold: 0.20,
            rate_403_threshold: 0.30,
            duplicate_hash_threshold: 0.50,
        }
    }

    #[test]
    fn classifier_is_deterministic_and_matches_table_order() {
        let mut t = BlockingTracker::new();
        t.record_response("https://example.org/a", 200, Some("g-recaptcha present"), None, None);
        let evidence = t.evidence();
        assert_eq!(classify(&evidence, &thresholds()).0, SiteStatus::Blocked);
    }

    #[test]
    fn throttled_on_429_rate() {
        let mut t = BlockingTracker::new();
        for _ in 0..8 {
            t.record_response("https://example.org/a", 200, None, None, None);
        }
        for _ in 0..2 {
            t.record_response("https://example.org/b", 429, None, None, None);
        }
        let evidence = t.evidence();
        let (status, fallback) = classify(&evidence, &thresholds());
        assert_eq!(status, SiteStatus::Throttled);
        assert!(fallback);
    }

    #[test]
    fn normal_when_no_signals() {
        let mut t = BlockingTracker::new();
        t.record_response("https://example.org/a", 200, None, None, Some("hash1"));
        t.record_response("https://example.org/b", 200, None, None, Some("hash2"));
        let evidence = t.evidence();
        assert_eq!(classify(&evidence, &thresholds()).0, SiteStatus::Normal);
    }

    #[test]
    fn duplicate_ratio_triggers_blocked() {
        let mut t = BlockingTracker::new();
        for _ in 0..4 {
            t.record_response("https://example.org/a", 200, None, None, Some("same-hash"));
        }
        let evidence = t.evidence();
        assert_eq!(classify(&evidence, &thresholds()).0, SiteStatus::Blocked);
    }
}
