//! Admission & identity (C3): opaque ids, token/IP hashing, and seed-URL
//! validation (§4.3). No equivalent module existed in the teacher (seed
//! URLs there were a hardcoded onion list); built directly against the
//! admission contract using the same `sha2`/hex-id idiom the teacher
//! already applies to response hashing elsewhere in the pack.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

const JOB_ID_BYTES: usize = 16;
const TOKEN_BYTES: usize = 32;

static LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").expect("static rfc1123 label pattern"));

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("seed url could not be parsed")]
    Unparseable,
    #[error("seed url must use http or https")]
    InvalidScheme,
    #[error("seed url has no host")]
    MissingHost,
    #[error("seed url host is not a routable public host")]
    DisallowedHost,
    #[error("seed url host is not a valid hostname")]
    InvalidHostLabel,
}

pub fn generate_job_id() -> String {
    format!("job_{}", random_hex(JOB_ID_BYTES))
}

pub fn generate_token() -> String {
    random_hex(TOKEN_BYTES)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn hash_ip(ip: &str) -> String {
    hex::encode(Sha256::digest(ip.as_bytes()))
}

/// First entry of `X-Forwarded-For` when present, else the connection's
/// own remote address.
pub fn client_ip(forwarded_for: Option<&str>, remote_addr: &str) -> String {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| remote_addr.to_string())
}

/// Validates a client-submitted seed URL per §4.3: http(s) scheme,
/// extractable host, host not localhost/loopback/private/link-local/
/// reserved, and each hostname label RFC1123-shaped.
pub fn validate_seed_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|_| ValidationError::Unparseable)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ValidationError::InvalidScheme);
    }
    let host = url.host_str().ok_or(ValidationError::MissingHost)?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        if !is_public_ip(&ip) {
            return Err(ValidationError::DisallowedHost);
        }
    } else {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(ValidationError::DisallowedHost);
        }
        for label in host.split('.') {
            if !LABEL_RE.is_match(label) {
                return Err(ValidationError::InvalidHostLabel);
            }
        }
    }

    Ok(url)
}

fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            let is_unique_local = (seg[0] & 0xfe00) == 0xfc00;
            let is_link_local = (seg[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || is_unique_local || is_link_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_public_https_host() {
        assert!(validate_seed_url("https://example.org/docs").is_ok());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(matches!(
            validate_seed_url("ftp://example.org/"),
            Err(ValidationError::InvalidScheme)
        ));
    }

    #[test]
    fn rejects_loopback_literal() {
        assert!(matches!(
            validate_seed_url("http://127.0.0.1/"),
            Err(ValidationError::DisallowedHost)
        ));
    }

    #[test]
    fn rejects_private_ipv4() {
        assert!(matches!(
            validate_seed_url("http://10.0.0.5/"),
            Err(ValidationError::DisallowedHost)
        ));
    }

    #[test]
    fn rejects_localhost_name() {
        assert!(matches!(
            validate_seed_url("http://localhost:8080/"),
            Err(ValidationError::DisallowedHost)
        ));
    }

    #[test]
    fn rejects_invalid_hostname_label() {
        assert!(matches!(
            validate_seed_url("http://-bad-.example.org/"),
            Err(ValidationError::InvalidHostLabel)
        ));
    }

    #[test]
    fn job_id_and_token_are_distinct_each_call() {
        assert_ne!(generate_job_id(), generate_job_id());
        assert_ne!(generate_token(), generate_token());
        assert!(generate_job_id().starts_with("job_"));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        assert_eq!(client_ip(Some("1.2.3.4, 5.6.7.8"), "9.9.9.9"), "1.2.3.4");
        assert_eq!(client_ip(None, "9.9.9.9"), "9.9.9.9");
    }
}
