use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub admission: AdmissionConfig,
    pub budget: BudgetConfig,
    pub extraction: ExtractionConfig,
    pub blocking: BlockingConfig,
    pub liveness: LivenessConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub data_dir: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_job_expiry_hours")]
    pub job_expiry_hours: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub postgres_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    #[serde(default = "default_concurrent_jobs_per_ip")]
    pub concurrent_jobs_per_ip: u32,
}

/// Budget bounds for the numeric fields a client may request on job
/// creation; out-of-range or non-numeric values clamp/fall back rather
/// than erroring (§4.3 of the design).
#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_max_pages")]
    pub default_max_pages: u32,
    #[serde(default = "default_min_pages")]
    pub min_pages: u32,
    #[serde(default = "default_max_pages_cap")]
    pub max_pages_cap: u32,

    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_min_timeout_seconds")]
    pub min_timeout_seconds: u64,
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_min_text_length")]
    pub min_text_length_success: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlockingConfig {
    #[serde(default = "default_429_threshold")]
    pub rate_429_threshold: f64,
    #[serde(default = "default_403_threshold")]
    pub rate_403_threshold: f64,
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_hash_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_worker_poll_interval")]
    pub worker_poll_interval_seconds: u64,
    #[serde(default = "default_orphan_threshold")]
    pub orphan_threshold_seconds: u64,
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_seconds: u64,
    #[serde(default = "default_hard_stall_threshold")]
    pub hard_stall_threshold_seconds: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    #[serde(default = "default_per_host_concurrency")]
    pub per_host_concurrency: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failures: u32,
    #[serde(default = "default_circuit_breaker_open_seconds")]
    pub circuit_breaker_open_seconds: u64,
    #[serde(default = "default_js_link_cap")]
    pub js_link_cap: usize,
    #[serde(default = "default_browserless_url")]
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    #[serde(default)]
    pub js_heavy_host_patterns: Vec<String>,
    #[serde(default)]
    pub tracking_params: Vec<String>,
    #[serde(default)]
    pub excluded_extensions: Vec<String>,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

fn default_bind_addr() -> String { "0.0.0.0:8080".to_string() }
fn default_job_expiry_hours() -> u64 { 24 }
fn default_max_connections() -> u32 { 10 }
fn default_concurrent_jobs_per_ip() -> u32 { 5 }
fn default_max_pages() -> u32 { 20 }
fn default_min_pages() -> u32 { 1 }
fn default_max_pages_cap() -> u32 { 100 }
fn default_timeout_seconds() -> u64 { 1800 }
fn default_min_timeout_seconds() -> u64 { 60 }
fn default_max_timeout_seconds() -> u64 { 1800 }
fn default_min_text_length() -> usize { 200 }
fn default_429_threshold() -> f64 { 0.20 }
fn default_403_threshold() -> f64 { 0.30 }
fn default_duplicate_threshold() -> f64 { 0.50 }
fn default_heartbeat_interval() -> u64 { 30 }
fn default_worker_poll_interval() -> u64 { 3 }
fn default_orphan_threshold() -> u64 { 120 }
fn default_stall_threshold() -> u64 { 300 }
fn default_hard_stall_threshold() -> u64 { 900 }
fn default_max_restarts() -> u32 { 2 }
fn default_global_concurrency() -> usize { 16 }
fn default_per_host_concurrency() -> usize { 4 }
fn default_base_delay_ms() -> u64 { 250 }
fn default_max_depth() -> u32 { 10 }
fn default_circuit_breaker_failures() -> u32 { 5 }
fn default_circuit_breaker_open_seconds() -> u64 { 300 }
fn default_js_link_cap() -> usize { 50 }
fn default_browserless_url() -> String { "http://localhost:3000".to_string() }

impl AppConfig {
    /// Applies the `CRAWLHUB_*` environment overrides, following the
    /// override idiom the teacher's `main.rs` used for its per-network
    /// settings.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CRAWLHUB_CONCURRENT_JOBS_PER_IP") {
            if let Ok(n) = v.parse() {
                self.admission.concurrent_jobs_per_ip = n;
            }
        }
        if let Ok(v) = std::env::var("CRAWLHUB_DEFAULT_MAX_PAGES") {
            if let Ok(n) = v.parse() {
                self.budget.default_max_pages = n;
            }
        }
        if let Ok(v) = std::env::var("CRAWLHUB_DEFAULT_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                self.budget.default_timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("CRAWLHUB_JOB_EXPIRY_HOURS") {
            if let Ok(n) = v.parse() {
                self.general.job_expiry_hours = n;
            }
        }
        if let Ok(v) = std::env::var("CRAWLHUB_DATABASE_URL") {
            self.database.postgres_url = v;
        }
        if let Ok(v) = std::env::var("CRAWLHUB_BIND_ADDR") {
            self.general.bind_addr = v;
        }
        if let Ok(v) = std::env::var("CRAWLHUB_BROWSERLESS_URL") {
            self.fetch.browserless_url = v;
        }
        if let Ok(v) = std::env::var("CRAWLHUB_BROWSERLESS_TOKEN") {
            self.fetch.browserless_token = Some(v);
        }
    }

    /// Clamps a client-requested `max_pages` into `[min_pages, max_pages_cap]`,
    /// falling back to the default on anything absent (§4.3: invalid types
    /// fall to default, not error).
    pub fn clamp_max_pages(&self, requested: Option<u32>) -> u32 {
        requested
            .map(|v| v.clamp(self.budget.min_pages, self.budget.max_pages_cap))
            .unwrap_or(self.budget.default_max_pages)
    }

    /// Clamps a client-requested `timeout_seconds` the same way.
    pub fn clamp_timeout_seconds(&self, requested: Option<u64>) -> u64 {
        requested
            .map(|v| v.clamp(self.budget.min_timeout_seconds, self.budget.max_timeout_seconds))
            .unwrap_or(self.budget.default_timeout_seconds)
    }
}
