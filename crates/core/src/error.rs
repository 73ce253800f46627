use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("dns failure: {0}")]
    DnsFailure(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("robots.txt denied: {0}")]
    RobotsDenied(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// The closed set of reasons a job's `last_error.reason` can take, per the
/// job-record error taxonomy. Stored as its snake_case serde form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Orphaned,
    Stalled,
    HardStalled,
    RateLimited,
    Blocked,
    CaptchaDetected,
    LoginRequired,
    RobotsDenied,
    DnsFailure,
    ConnectionError,
    Timeout,
    DiskFull,
    Unknown,
    FinalizationFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Orphaned => "orphaned",
            FailureReason::Stalled => "stalled",
            FailureReason::HardStalled => "hard_stalled",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Blocked => "blocked",
            FailureReason::CaptchaDetected => "captcha_detected",
            FailureReason::LoginRequired => "login_required",
            FailureReason::RobotsDenied => "robots_denied",
            FailureReason::DnsFailure => "dns_failure",
            FailureReason::ConnectionError => "connection_error",
            FailureReason::Timeout => "timeout",
            FailureReason::DiskFull => "disk_full",
            FailureReason::Unknown => "unknown",
            FailureReason::FinalizationFailed => "finalization_failed",
        }
    }
}

impl From<&CrawlError> for FailureReason {
    fn from(err: &CrawlError) -> Self {
        match err {
            CrawlError::DnsFailure(_) => FailureReason::DnsFailure,
            CrawlError::ConnectionError(_) => FailureReason::ConnectionError,
            CrawlError::Timeout(_) => FailureReason::Timeout,
            CrawlError::RobotsDenied(_) => FailureReason::RobotsDenied,
            CrawlError::DiskFull(_) => FailureReason::DiskFull,
            CrawlError::FinalizationFailed(_) => FailureReason::FinalizationFailed,
            _ => FailureReason::Unknown,
        }
    }
}
