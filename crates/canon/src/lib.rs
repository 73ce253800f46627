//! URL canonicalization and scope filtering (C1).
//!
//! Canonicalization is deterministic and idempotent: `canon(canon(u)) ==
//! canon(u)` for all inputs, since every step operates on already-normal
//! forms without reintroducing what an earlier step removed.

use std::collections::HashSet;

use regex::Regex;
use url::Url;

/// Case-insensitive set of query-parameter keys stripped before anything
/// else touches the URL.
pub struct Canonicalizer {
    tracking_params: HashSet<String>,
}

impl Canonicalizer {
    pub fn new(tracking_params: &[String]) -> Self {
        Self {
            tracking_params: tracking_params.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Produces the canonical string form used as the dedup key.
    pub fn canonicalize(&self, url: &Url) -> String {
        let mut u = url.clone();

        // 1. Strip tracking query parameters.
        let kept: Vec<(String, String)> = u
            .query_pairs()
            .filter(|(k, _)| !self.tracking_params.contains(&k.to_lowercase()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            u.set_query(None);
        } else {
            let qs = kept
                .iter()
                .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                .collect::<Vec<_>>()
                .join("&");
            u.set_query(Some(&qs));
        }

        // 2. Lowercase scheme and host; drop default port.
        let scheme = u.scheme().to_lowercase();
        let _ = u.set_scheme(&scheme);
        if let Some(host) = u.host_str() {
            let host = host.to_lowercase();
            let _ = u.set_host(Some(&host));
        }
        let default_port = match scheme.as_str() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        if u.port() == default_port {
            let _ = u.set_port(None);
        }

        // 3. Collapse repeated slashes; map trailing index files to the
        // directory form; strip trailing slash from non-root paths.
        let collapsed = collapse_slashes(u.path());
        let mapped = map_index_file(&collapsed);
        let trimmed = if mapped.len() > 1 && mapped.ends_with('/') {
            mapped.trim_end_matches('/').to_string()
        } else {
            mapped
        };
        u.set_path(&trimmed);

        // 4. Drop fragment (query already settled above).
        u.set_fragment(None);

        u.to_string()
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(c);
    }
    out
}

fn map_index_file(path: &str) -> String {
    for suffix in ["/index.html", "/index.htm"] {
        if let Some(stripped) = path.strip_suffix(suffix) {
            return format!("{}/", stripped);
        }
    }
    path.to_string()
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Scope predicate (§4.1): host equality, ignore-prefix exclusion,
/// extension exclusion, deny-pattern exclusion. Exact-host match only —
/// no subdomain inclusion.
pub struct ScopeFilter {
    allowed_host: String,
    ignore_prefixes: Vec<String>,
    excluded_extensions: HashSet<String>,
    deny_patterns: Vec<Regex>,
}

impl ScopeFilter {
    pub fn new(
        allowed_host: &str,
        ignore_prefixes: &[String],
        excluded_extensions: &[String],
        deny_patterns: &[String],
    ) -> Self {
        Self {
            allowed_host: allowed_host.to_lowercase(),
            ignore_prefixes: ignore_prefixes.to_vec(),
            excluded_extensions: excluded_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            deny_patterns: deny_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    /// `in_scope(url, allowed_host, ignore_prefixes)` depends only on its
    /// arguments — no global state, so it is deterministic by construction.
    pub fn in_scope(&self, url: &Url) -> bool {
        if url.scheme() != "http" && url.scheme() != "https" {
            return false;
        }
        let host = match url.host_str() {
            Some(h) => h.to_lowercase(),
            None => return false,
        };
        if host != self.allowed_host {
            return false;
        }
        let path = url.path();
        if self.ignore_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return false;
        }
        if let Some(ext) = extension_of(path) {
            if self.excluded_extensions.contains(&ext) {
                return false;
            }
        }
        let full = url.as_str();
        if self.deny_patterns.iter().any(|re| re.is_match(full)) {
            return false;
        }
        true
    }
}

fn extension_of(path: &str) -> Option<String> {
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    last_segment.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

/// Default closed set of tracking-parameter keys.
pub fn default_tracking_params() -> Vec<String> {
    [
        "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content",
        "gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "ref", "ref_src",
        "igshid", "_ga", "yclid", "spm",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Default excluded file extensions (non-content assets).
pub fn default_excluded_extensions() -> Vec<String> {
    [
        "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "css", "js", "json",
        "woff", "woff2", "ttf", "eot", "mp4", "mp3", "pdf", "zip", "gz", "tar",
        "xml", "rss",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Default deny patterns: auth/search/share/print endpoints and common
/// social-share deep links.
pub fn default_deny_patterns() -> Vec<String> {
    [
        r"(?i)/(login|logout|signin|signup|register)(/|$|\?)",
        r"(?i)/(search|print)(/|$|\?)",
        r"(?i)[?&](share|utm_)",
        r"(?i)/(wp-admin|wp-login)",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(s: &str) -> String {
        let c = Canonicalizer::new(&default_tracking_params());
        c.canonicalize(&Url::parse(s).unwrap())
    }

    #[test]
    fn strips_tracking_params() {
        assert_eq!(
            canon("https://example.org/docs?utm_source=x&page=2"),
            "https://example.org/docs?page=2"
        );
    }

    #[test]
    fn drops_default_port_and_lowercases_host() {
        assert_eq!(canon("HTTP://Example.ORG:80/a"), "http://example.org/a");
    }

    #[test]
    fn collapses_slashes_and_strips_trailing_slash() {
        assert_eq!(canon("https://example.org/a//b/"), "https://example.org/a/b");
    }

    #[test]
    fn maps_index_html_to_directory_form() {
        assert_eq!(
            canon("https://example.org/docs/index.html"),
            "https://example.org/docs/"
        );
    }

    #[test]
    fn drops_fragment() {
        assert_eq!(canon("https://example.org/a#section"), "https://example.org/a");
    }

    #[test]
    fn idempotent() {
        let c = Canonicalizer::new(&default_tracking_params());
        let once = c.canonicalize(&Url::parse("https://Example.org:443/a//b/?utm_source=x#f").unwrap());
        let twice = c.canonicalize(&Url::parse(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn scope_rejects_other_host() {
        let f = ScopeFilter::new("example.org", &[], &default_excluded_extensions(), &default_deny_patterns());
        assert!(!f.in_scope(&Url::parse("https://other.org/a").unwrap()));
    }

    #[test]
    fn scope_rejects_ignored_prefix() {
        let f = ScopeFilter::new(
            "example.org",
            &["/blog".to_string()],
            &default_excluded_extensions(),
            &default_deny_patterns(),
        );
        assert!(!f.in_scope(&Url::parse("https://example.org/blog/post").unwrap()));
        assert!(f.in_scope(&Url::parse("https://example.org/docs").unwrap()));
    }

    #[test]
    fn scope_rejects_excluded_extension() {
        let f = ScopeFilter::new("example.org", &[], &default_excluded_extensions(), &[]);
        assert!(!f.in_scope(&Url::parse("https://example.org/logo.png").unwrap()));
    }

    #[test]
    fn scope_rejects_deny_pattern() {
        let f = ScopeFilter::new("example.org", &[], &[], &default_deny_patterns());
        assert!(!f.in_scope(&Url::parse("https://example.org/login").unwrap()));
    }
}
