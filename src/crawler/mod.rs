pub mod fetcher;
pub mod parser;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::CrawlerConfig;
use crate::models::Listing;
use crate::proxy::ProxyPool;
use std::sync::Arc;

use self::fetcher::Fetcher;
use self::parser::parse_search_page;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable deal-feed abstraction: one ranked snapshot per keyword.
#[async_trait]
pub trait DealSource: Send + Sync {
    async fn fetch_listings(&self, keyword: &str) -> Result<Vec<Listing>>;
}

// ── algumon crawler ───────────────────────────────────────────────────────────

pub struct AlgumonSource {
    fetcher: Fetcher,
    base_url: String,
}

impl AlgumonSource {
    pub fn new(config: &CrawlerConfig, pool: Arc<ProxyPool>) -> Result<Self> {
        Ok(Self {
            fetcher: Fetcher::new(config.clone(), pool).context("Failed to build HTTP client")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Search-results URL for a keyword, newest-first.
    pub fn search_url(&self, keyword: &str) -> String {
        format!("{}/search/{}", self.base_url, keyword)
    }
}

#[async_trait]
impl DealSource for AlgumonSource {
    async fn fetch_listings(&self, keyword: &str) -> Result<Vec<Listing>> {
        let url = self.search_url(keyword);
        debug!("crawling {}", url);

        let html = self
            .fetcher
            .fetch(&url)
            .await
            .with_context(|| format!("fetch failed for keyword '{}'", keyword))?;

        let listings = parse_search_page(&html, &url);
        if listings.is_empty() && !html.contains("product-list") {
            // A markup change would otherwise look like an endlessly quiet keyword.
            bail!("no listing markup found for keyword '{}'", keyword);
        }

        info!("{}: {} listings", keyword, listings.len());
        Ok(listings)
    }
}

/// Build a digest-friendly search link for a keyword without needing the
/// crawler itself.
pub fn search_link(base_url: &str, keyword: &str) -> String {
    format!("{}/search/{}", base_url.trim_end_matches('/'), keyword)
}
