use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub crawler: CrawlerConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub mailer: MailerConfig,
    pub worker: WorkerConfig,
}

/// Crawler / fetcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Timeout for the direct request.
    #[serde(default = "default_direct_timeout_secs")]
    pub direct_timeout_secs: u64,

    /// Timeout for each per-proxy attempt. Longer than the direct one:
    /// free proxies are slow but a hit here still beats no data.
    #[serde(default = "default_proxy_timeout_secs")]
    pub proxy_timeout_secs: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Rotating-proxy supplier configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Refresh the pool from `source_url` at the start of each cycle.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_proxy_source_url")]
    pub source_url: String,

    #[serde(default = "default_max_proxies")]
    pub max_proxies: usize,

    #[serde(default = "default_proxy_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_proxy_fetch_retries")]
    pub fetch_retries: usize,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// SMTP mailer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailerConfig {
    /// When false, digests are logged instead of sent.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_sender")]
    pub sender: String,
}

/// Cycle / fan-out configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Upper bound on concurrent per-keyword crawl tasks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Tick interval for `watch` mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Cap on listings reported per keyword when the watermark is not found
    /// in the fresh snapshot.
    #[serde(default = "default_max_new_per_keyword")]
    pub max_new_per_keyword: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://www.algumon.com".to_string()
}
fn default_direct_timeout_secs() -> u64 {
    10
}
fn default_proxy_timeout_secs() -> u64 {
    20
}
fn default_request_delay_ms() -> u64 {
    250
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_user_agent() -> String {
    "dealwatch/0.1 (keyword deal alerts)".to_string()
}
fn default_proxy_source_url() -> String {
    "https://www.sslproxies.org/".to_string()
}
fn default_max_proxies() -> usize {
    15
}
fn default_proxy_fetch_timeout_secs() -> u64 {
    30
}
fn default_proxy_fetch_retries() -> usize {
    3
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/dealwatch.duckdb")
}
fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}
fn default_smtp_port() -> u16 {
    465
}
fn default_sender() -> String {
    "dealwatch@localhost".to_string()
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    8
}
fn default_interval_secs() -> u64 {
    1800
}
fn default_max_new_per_keyword() -> usize {
    10
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("DEALWATCH").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|_| AppConfig::default());
        Ok(app_cfg)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerConfig {
                base_url: default_base_url(),
                direct_timeout_secs: default_direct_timeout_secs(),
                proxy_timeout_secs: default_proxy_timeout_secs(),
                request_delay_ms: default_request_delay_ms(),
                jitter_ms: default_jitter_ms(),
                user_agent: default_user_agent(),
            },
            proxy: ProxyConfig {
                enabled: true,
                source_url: default_proxy_source_url(),
                max_proxies: default_max_proxies(),
                fetch_timeout_secs: default_proxy_fetch_timeout_secs(),
                fetch_retries: default_proxy_fetch_retries(),
            },
            storage: StorageConfig {
                db_path: default_db_path(),
                run_migrations: true,
            },
            mailer: MailerConfig {
                enabled: false,
                smtp_host: default_smtp_host(),
                smtp_port: default_smtp_port(),
                username: String::new(),
                password: String::new(),
                sender: default_sender(),
            },
            worker: WorkerConfig {
                concurrency: default_concurrency(),
                interval_secs: default_interval_secs(),
                max_new_per_keyword: default_max_new_per_keyword(),
            },
        }
    }
}
