//! HTTP fetcher with block-signal proxy fallback.
//!
//! Policy: transport errors (DNS, timeout, refused) on the direct attempt are
//! a plain fetch failure. Only an explicit block-signal status switches to the
//! shared proxy pool. A proxy that blocks or errors is evicted from the pool;
//! the first proxy returning 2xx wins.

use rand::Rng;
use reqwest::{Client, Proxy};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::CrawlerConfig;
use crate::proxy::ProxyPool;

/// Statuses the source uses to refuse or rate-limit a request.
const BLOCK_STATUSES: [u16; 2] = [403, 430];

pub fn is_block_signal(status: u16) -> bool {
    BLOCK_STATUSES.contains(&status)
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("blocked by source (HTTP {status})")]
    Blocked { status: u16 },

    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("all {tried} proxies exhausted")]
    ProxiesExhausted { tried: usize },
}

/// Outcome of a single per-proxy attempt.
pub enum ProxyAttempt {
    Success(String),
    /// Block-signal through this proxy — evict it.
    Blocked(u16),
    /// Transport error through this proxy — evict it.
    Failed(String),
    /// Some other non-2xx status. The proxy itself works; keep it pooled.
    Skipped(u16),
}

pub struct Fetcher {
    client: Client,
    pool: Arc<ProxyPool>,
    config: CrawlerConfig,
}

impl Fetcher {
    pub fn new(config: CrawlerConfig, pool: Arc<ProxyPool>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.direct_timeout_secs))
            .gzip(true)
            .cookie_store(true)
            .build()?;

        Ok(Self { client, pool, config })
    }

    /// Fetch a URL as text. Block-signals fall back to the proxy pool;
    /// anything else fails here.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.polite_delay().await;
        debug!("GET {}", url);

        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("GET {} failed: {}", url, e);
                return Err(FetchError::Transport(e.to_string()));
            }
        };

        let status = resp.status().as_u16();
        if is_block_signal(status) {
            if status == 430 {
                error!("HTTP 430 from {}: rate-limited by source", url);
            }
            warn!("GET {} blocked ({}), retrying through proxy pool", url, status);
            return self.fetch_via_proxies(url).await;
        }

        if !resp.status().is_success() {
            return Err(FetchError::Status { status });
        }

        resp.text().await.map_err(|e| FetchError::Transport(e.to_string()))
    }

    async fn fetch_via_proxies(&self, url: &str) -> Result<String, FetchError> {
        try_proxies(&self.pool, |proxy| {
            let url = url.to_string();
            async move { self.proxy_get(&proxy, &url).await }
        })
        .await
    }

    /// One attempt through one proxy, with the longer proxy timeout.
    async fn proxy_get(&self, proxy: &str, url: &str) -> ProxyAttempt {
        let proxied = match Proxy::all(proxy) {
            Ok(p) => p,
            Err(e) => return ProxyAttempt::Failed(e.to_string()),
        };
        let client = match Client::builder()
            .user_agent(&self.config.user_agent)
            .proxy(proxied)
            .timeout(Duration::from_secs(self.config.proxy_timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => return ProxyAttempt::Failed(e.to_string()),
        };

        match client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if is_block_signal(status) {
                    ProxyAttempt::Blocked(status)
                } else if resp.status().is_success() {
                    match resp.text().await {
                        Ok(body) => ProxyAttempt::Success(body),
                        Err(e) => ProxyAttempt::Failed(e.to_string()),
                    }
                } else {
                    ProxyAttempt::Skipped(status)
                }
            }
            Err(e) => ProxyAttempt::Failed(e.to_string()),
        }
    }

    /// Sleep for the configured delay + random jitter before a direct hit.
    async fn polite_delay(&self) {
        let jitter = rand::rng().random_range(0..=self.config.jitter_ms);
        sleep(Duration::from_millis(self.config.request_delay_ms + jitter)).await;
    }
}

/// Iterate a snapshot of the pool, evicting proxies that block or error,
/// until one attempt returns a body. Factored out of `Fetcher` so the
/// fallback policy is testable without a network.
pub async fn try_proxies<F, Fut>(pool: &ProxyPool, mut attempt: F) -> Result<String, FetchError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ProxyAttempt>,
{
    let candidates = pool.snapshot();
    if candidates.is_empty() {
        warn!("no proxies available");
        return Err(FetchError::ProxiesExhausted { tried: 0 });
    }

    let tried = candidates.len();
    for proxy in candidates {
        match attempt(proxy.clone()).await {
            ProxyAttempt::Success(body) => {
                debug!("proxy {} succeeded", proxy);
                return Ok(body);
            }
            ProxyAttempt::Blocked(status) => {
                warn!("proxy {} blocked ({}), evicting", proxy, status);
                pool.remove(&proxy);
            }
            ProxyAttempt::Failed(e) => {
                warn!("proxy {} failed: {}, evicting", proxy, e);
                pool.remove(&proxy);
            }
            ProxyAttempt::Skipped(status) => {
                debug!("proxy {} returned {}, trying next", proxy, status);
            }
        }
    }

    warn!("all {} proxies exhausted", tried);
    Err(FetchError::ProxiesExhausted { tried })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
