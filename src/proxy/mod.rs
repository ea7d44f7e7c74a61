//! Shared rotating-proxy pool.
//!
//! The pool is an explicit resource injected into the cycle, refreshed once
//! per cycle from a free-proxy listing and cleared at cycle end. All crawl
//! tasks share it; a proxy that misbehaves for one task is evicted for all.

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;

// ── Pool ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ProxyPool {
    inner: Mutex<Vec<String>>,
}

impl ProxyPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // A panicked holder cannot leave the Vec half-written; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap in a fresh candidate list.
    pub fn replace(&self, proxies: Vec<String>) {
        *self.lock() = proxies;
    }

    /// Evict a dead proxy. Concurrent tasks may race to remove the same
    /// entry; removing an absent one is a no-op.
    pub fn remove(&self, proxy: &str) {
        let mut pool = self.lock();
        if let Some(pos) = pool.iter().position(|p| p == proxy) {
            pool.remove(pos);
            debug!("proxy evicted: {} ({} left)", proxy, pool.len());
        }
    }

    /// Copy of the current candidates, in pool order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ── Supplier ─────────────────────────────────────────────────────────────────

/// Refresh the pool from the configured free-proxy listing. Retried with
/// backoff; a total failure leaves the pool as-is and is non-fatal — the
/// cycle then runs direct-only.
pub async fn refresh_pool(client: &reqwest::Client, pool: &ProxyPool, config: &ProxyConfig) -> Result<usize> {
    let strategy = FixedInterval::from_millis(500).take(config.fetch_retries);

    let source_url = config.source_url.clone();
    let timeout = Duration::from_secs(config.fetch_timeout_secs);
    let html = Retry::spawn(strategy, || async {
        client
            .get(&source_url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    })
    .await
    .with_context(|| format!("proxy source fetch failed: {}", config.source_url))?;

    let candidates = parse_proxy_list(&html, config.max_proxies);
    if candidates.is_empty() {
        warn!("proxy source returned no usable candidates");
    } else {
        info!("proxy pool refreshed: {} candidates", candidates.len());
    }

    let n = candidates.len();
    pool.replace(candidates);
    Ok(n)
}

/// Extract `http://ip:port` candidates from the sslproxies table. Only rows
/// marked https=yes and anonymity=anonymous are kept, capped at `max`.
pub fn parse_proxy_list(html: &str, max: usize) -> Vec<String> {
    let doc = Html::parse_document(html);

    let Ok(row_sel) = Selector::parse("table.table-striped tbody tr") else {
        return Vec::new();
    };
    let Ok(td_sel) = Selector::parse("td") else {
        return Vec::new();
    };

    let mut proxies = Vec::new();
    for tr in doc.select(&row_sel) {
        let cells: Vec<String> = tr
            .select(&td_sel)
            .map(|td| td.text().collect::<String>().trim().to_string())
            .collect();

        // ip | port | code | country | anonymity | google | https | last checked
        if cells.len() < 7 {
            continue;
        }
        let anonymous = cells[4].eq_ignore_ascii_case("anonymous");
        let https = cells[6].eq_ignore_ascii_case("yes");
        if !(anonymous && https) {
            continue;
        }

        proxies.push(format!("http://{}:{}", cells[0], cells[1]));
        if proxies.len() >= max {
            break;
        }
    }

    proxies
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_row(ip: &str, port: &str, anonymity: &str, https: &str) -> String {
        format!(
            "<tr><td>{ip}</td><td>{port}</td><td>KR</td><td>Korea</td>\
             <td>{anonymity}</td><td>no</td><td>{https}</td><td>1 min ago</td></tr>"
        )
    }

    fn proxy_table(rows: &[String]) -> String {
        format!(
            "<html><body><table class=\"table table-striped table-bordered\">\
             <tbody>{}</tbody></table></body></html>",
            rows.join("")
        )
    }

    #[test]
    fn parse_keeps_only_anonymous_https_rows() {
        let html = proxy_table(&[
            proxy_row("10.0.0.1", "8080", "anonymous", "yes"),
            proxy_row("10.0.0.2", "3128", "transparent", "yes"),
            proxy_row("10.0.0.3", "8080", "anonymous", "no"),
            proxy_row("10.0.0.4", "80", "Anonymous", "Yes"),
        ]);

        let proxies = parse_proxy_list(&html, 15);
        assert_eq!(
            proxies,
            vec!["http://10.0.0.1:8080".to_string(), "http://10.0.0.4:80".to_string()]
        );
    }

    #[test]
    fn parse_respects_cap() {
        let rows: Vec<String> = (0..30)
            .map(|i| proxy_row(&format!("10.0.1.{i}"), "8080", "anonymous", "yes"))
            .collect();
        let proxies = parse_proxy_list(&proxy_table(&rows), 15);
        assert_eq!(proxies.len(), 15);
    }

    #[test]
    fn remove_is_idempotent() {
        let pool = ProxyPool::new();
        pool.replace(vec!["http://a:1".into(), "http://b:2".into()]);

        pool.remove("http://a:1");
        assert_eq!(pool.len(), 1);

        // Already gone — another task lost the race, not an error.
        pool.remove("http://a:1");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.snapshot(), vec!["http://b:2".to_string()]);
    }

    #[test]
    fn clear_empties_pool() {
        let pool = ProxyPool::new();
        pool.replace(vec!["http://a:1".into()]);
        assert!(!pool.is_empty());
        pool.clear();
        assert!(pool.is_empty());
    }
}
