//! The cycle: keyword fan-out, diff, aggregation, dispatch.
//!
//! One cycle crawls every keyword that has at least one subscriber, each in
//! its own task, and mails each affected subscriber one consolidated digest.
//! Failures are absorbed at the task (per keyword) and the dispatch (per
//! subscriber) level; the only cycle-fatal step is loading the keyword list.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::crawler::DealSource;
use crate::diff::{DiffKind, diff_listings};
use crate::mailer::{Mailer, render_digest};
use crate::models::{Keyword, Listing, Site};
use crate::proxy::{self, ProxyPool};
use crate::storage::Repository;

/// New listings found for one keyword within one cycle.
pub struct KeywordHits {
    pub keyword: Keyword,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Default)]
pub struct CycleStats {
    /// True when the tick was dropped because the previous cycle still ran.
    pub skipped: bool,
    pub keywords: usize,
    pub new_listings: usize,
    pub emails_sent: usize,
    pub errors: usize,
}

impl CycleStats {
    fn skipped_tick() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

pub struct Worker {
    config: AppConfig,
    site: Site,
    repo: Arc<Mutex<Repository>>,
    source: Arc<dyn DealSource>,
    mailer: Arc<dyn Mailer>,
    pool: Arc<ProxyPool>,
    client: reqwest::Client,
    /// Held for the duration of a cycle so ticks cannot overlap.
    cycle_guard: Mutex<()>,
}

impl Worker {
    pub fn new(
        config: AppConfig,
        repo: Arc<Mutex<Repository>>,
        source: Arc<dyn DealSource>,
        mailer: Arc<dyn Mailer>,
        pool: Arc<ProxyPool>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.crawler.user_agent)
            .timeout(Duration::from_secs(config.proxy.fetch_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            site: Site::Algumon,
            repo,
            source,
            mailer,
            pool,
            client,
            cycle_guard: Mutex::new(()),
        })
    }

    /// One full cycle. Fire-and-forget from the scheduler's point of view;
    /// the returned stats are for logging and the CLI.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let Ok(_guard) = self.cycle_guard.try_lock() else {
            warn!("previous cycle still running — skipping this tick");
            return Ok(CycleStats::skipped_tick());
        };

        let run_id = self.repo.lock().await.begin_cycle_run().unwrap_or(0);

        // The only cycle-fatal failure: no keyword list, no work to fan out.
        let keywords = match self.repo.lock().await.keywords_with_subscribers() {
            Ok(keywords) => keywords,
            Err(e) => {
                error!("keyword list load failed: {:#}", e);
                self.repo
                    .lock()
                    .await
                    .finish_cycle_run(run_id, 0, 0, 0, Some("keyword list load failed"))
                    .ok();
                return Err(e).context("keyword list load failed");
            }
        };

        if keywords.is_empty() {
            info!("no keywords with subscribers — nothing to do");
            self.repo.lock().await.finish_cycle_run(run_id, 0, 0, 0, None).ok();
            return Ok(CycleStats::default());
        }

        // Proxies are a cycle-scoped shared resource: refreshed once here,
        // cleared at the end. A failed refresh just means a direct-only cycle.
        if self.config.proxy.enabled {
            if let Err(e) = proxy::refresh_pool(&self.client, &self.pool, &self.config.proxy).await {
                warn!("proxy refresh failed: {:#} — running direct-only", e);
            }
        }

        info!("cycle {}: {} keywords", run_id, keywords.len());

        let sem = Arc::new(Semaphore::new(self.config.worker.concurrency.max(1)));
        let mut handles = Vec::new();

        for keyword in keywords {
            let source = Arc::clone(&self.source);
            let repo = Arc::clone(&self.repo);
            let sem = Arc::clone(&sem);
            let site = self.site;
            let cap = self.config.worker.max_new_per_keyword;
            let task_keyword = keyword.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await?;
                crawl_keyword(source, repo, task_keyword, site, cap).await
            });

            handles.push((keyword, handle));
        }

        // Wait-for-all: one keyword's failure never cancels its siblings.
        let total = handles.len();
        let mut results: HashMap<i64, KeywordHits> = HashMap::new();
        let mut new_total = 0usize;
        let mut errors = 0usize;

        for (keyword, handle) in handles {
            match handle.await {
                Ok(Ok(new)) if !new.is_empty() => {
                    new_total += new.len();
                    results.insert(keyword.id, KeywordHits { keyword, listings: new });
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("{}: {:#}", keyword.title, e);
                    errors += 1;
                }
                Err(e) => {
                    error!("Task panic for {}: {}", keyword.title, e);
                    errors += 1;
                }
            }
        }

        let (emails_sent, notify_errors) = if results.is_empty() {
            debug!("no new listings this cycle");
            (0, 0)
        } else {
            self.notify_subscribers(&results).await
        };
        errors += notify_errors;

        // Cycle-scoped state goes away regardless of per-task outcomes.
        drop(results);
        self.pool.clear();

        let stats = CycleStats {
            skipped: false,
            keywords: total,
            new_listings: new_total,
            emails_sent,
            errors,
        };

        let error_msg = (errors > 0).then(|| format!("{} errors", errors));
        self.repo
            .lock()
            .await
            .finish_cycle_run(run_id, stats.keywords, stats.new_listings, stats.emails_sent, error_msg.as_deref())
            .ok();

        info!(
            "cycle {} done: {} keywords | {} new listings | {} digests | {} errors",
            run_id, stats.keywords, stats.new_listings, stats.emails_sent, stats.errors
        );
        Ok(stats)
    }

    /// Map each subscriber to the union of new listings across their
    /// keywords and send one digest each. Per-subscriber failures are
    /// logged and never block the rest.
    async fn notify_subscribers(&self, results: &HashMap<i64, KeywordHits>) -> (usize, usize) {
        let subscribers = match self.repo.lock().await.subscribers_with_keywords() {
            Ok(subscribers) => subscribers,
            Err(e) => {
                error!("subscriber load failed: {:#}", e);
                return (0, 1);
            }
        };

        let mut sent = 0usize;
        let mut errors = 0usize;

        for subscriber in subscribers {
            let sections: Vec<(&Keyword, &[Listing])> = subscriber
                .keyword_ids
                .iter()
                .filter_map(|id| results.get(id))
                .map(|hits| (&hits.keyword, hits.listings.as_slice()))
                .collect();

            if sections.is_empty() {
                continue;
            }

            let (subject, body) = render_digest(&self.config.crawler.base_url, &sections);
            let listing_count: usize = sections.iter().map(|(_, listings)| listings.len()).sum();

            match self.mailer.send(&subscriber.email, &subject, &body).await {
                Ok(()) => {
                    sent += 1;
                    self.repo
                        .lock()
                        .await
                        .record_mail(&subscriber.email, &subject, listing_count)
                        .ok();
                }
                Err(e) => {
                    warn!("digest to {} failed: {:#}", subscriber.email, e);
                    errors += 1;
                }
            }
        }

        (sent, errors)
    }
}

/// Crawl one keyword and commit its watermark move. The watermark write
/// lands before the new listings are handed back, so a crash after this
/// point drops a digest instead of duplicating one next cycle.
async fn crawl_keyword(
    source: Arc<dyn DealSource>,
    repo: Arc<Mutex<Repository>>,
    keyword: Keyword,
    site: Site,
    cap: usize,
) -> Result<Vec<Listing>> {
    let fresh = source
        .fetch_listings(&keyword.title)
        .await
        .with_context(|| format!("crawl failed for '{}'", keyword.title))?;

    let watermark = repo.lock().await.load_watermark(keyword.id, site.as_str())?;
    let outcome = diff_listings(&fresh, watermark.as_ref(), cap);

    if let Some(update) = &outcome.update {
        repo.lock()
            .await
            .save_watermark(keyword.id, site.as_str(), update)
            .with_context(|| format!("watermark save failed for '{}'", keyword.title))?;
    }

    match outcome.kind {
        DiffKind::ColdStart => info!("{}: first crawl, watermark seeded", keyword.title),
        DiffKind::NewListings => info!("{}: {} new listings", keyword.title, outcome.new.len()),
        DiffKind::WatermarkLost => {
            warn!("{}: watermark lost, rebased ({} reported)", keyword.title, outcome.new.len())
        }
        DiffKind::NoChange | DiffKind::EmptyFeed => debug!("{}: no new listings", keyword.title),
    }

    Ok(outcome.new)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
