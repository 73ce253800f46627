//! Strategy engine (C9): pre-flight fetcher selection and the single
//! post-flight fallback decision.

use regex::Regex;

use crawlhub_core::{CrawlerStrategy, SiteStatus};

pub struct PreflightDecision {
    pub strategy: CrawlerStrategy,
    pub reason: Option<String>,
}

/// Priority order: explicit `use_js` flag, then the JS-heavy host
/// pattern table, then static (§4.9).
pub fn select_preflight(use_js: bool, host: &str, js_heavy_host_patterns: &[String]) -> PreflightDecision {
    if use_js {
        return PreflightDecision {
            strategy: CrawlerStrategy::JsPreemptive,
            reason: Some("use_js_requested".to_string()),
        };
    }

    for pattern in js_heavy_host_patterns {
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(host) {
                return PreflightDecision {
                    strategy: CrawlerStrategy::JsPreemptive,
                    reason: Some(format!("js_heavy_host_pattern:{pattern}")),
                };
            }
        }
    }

    PreflightDecision {
        strategy: CrawlerStrategy::Static,
        reason: None,
    }
}

pub struct FallbackDecision {
    pub should_fallback: bool,
    pub reason: Option<String>,
}

/// Post-flight decision (static path only). Fallback iff zero pages were
/// fetched or the site was classified BLOCKED/THROTTLED, guarded by the
/// one-shot `fallback_retry_count < 1` budget.
pub fn should_fallback(
    pages_fetched: u64,
    site_status: SiteStatus,
    fallback_retry_count: u32,
) -> FallbackDecision {
    if fallback_retry_count >= 1 {
        return FallbackDecision {
            should_fallback: false,
            reason: None,
        };
    }

    if pages_fetched == 0 {
        return FallbackDecision {
            should_fallback: true,
            reason: Some("zero_pages".to_string()),
        };
    }

    if matches!(site_status, SiteStatus::Blocked | SiteStatus::Throttled) {
        return FallbackDecision {
            should_fallback: true,
            reason: Some("site_blocked_or_throttled".to_string()),
        };
    }

    FallbackDecision {
        should_fallback: false,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_use_js_wins_over_everything() {
        let d = select_preflight(true, "plain-site.org", &[]);
        assert_eq!(d.strategy, CrawlerStrategy::JsPreemptive);
    }

    #[test]
    fn js_heavy_pattern_selects_js_without_explicit_flag() {
        let patterns = vec![r"(?i)\.app$".to_string()];
        let d = select_preflight(false, "example.app", &patterns);
        assert_eq!(d.strategy, CrawlerStrategy::JsPreemptive);
    }

    #[test]
    fn defaults_to_static() {
        let d = select_preflight(false, "example.org", &[]);
        assert_eq!(d.strategy, CrawlerStrategy::Static);
    }

    #[test]
    fn zero_pages_triggers_fallback() {
        let d = should_fallback(0, SiteStatus::Normal, 0);
        assert!(d.should_fallback);
        assert_eq!(d.reason.as_deref(), Some("zero_pages"));
    }

    #[test]
    fn blocked_status_triggers_fallback() {
        let d = should_fallback(10, SiteStatus::Blocked, 0);
        assert!(d.should_fallback);
    }

    #[test]
    fn fallback_is_one_shot() {
        let d = should_fallback(0, SiteStatus::Normal, 1);
        assert!(!d.should_fallback);
    }

    #[test]
    fn normal_status_with_pages_does_not_fall_back() {
        let d = should_fallback(10, SiteStatus::Normal, 0);
        assert!(!d.should_fallback);
    }
}
