use anyhow::{Context, Result, bail};
use chrono::Utc;
use duckdb::{Connection, params};
use std::path::Path;
use tracing::info;

use crate::diff::WatermarkUpdate;
use crate::models::{Keyword, Subscriber, Watermark};
use crate::utils::normalize_keyword;

/// A subscriber may track at most this many keywords.
const MAX_KEYWORDS_PER_SUBSCRIBER: i64 = 10;

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS keywords (
    id          BIGINT PRIMARY KEY,
    title       VARCHAR NOT NULL UNIQUE,
    created_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS subscribers (
    id          BIGINT PRIMARY KEY,
    email       VARCHAR NOT NULL UNIQUE,
    created_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriber_keywords (
    subscriber_id BIGINT NOT NULL,
    keyword_id    BIGINT NOT NULL,
    linked_at     TIMESTAMP NOT NULL,
    PRIMARY KEY (subscriber_id, keyword_id)
);

-- One row per (keyword, site): the most-recently-seen top listing.
CREATE TABLE IF NOT EXISTS watermarks (
    keyword_id  BIGINT  NOT NULL,
    site        VARCHAR NOT NULL,
    external_id VARCHAR NOT NULL,
    link        VARCHAR,
    price       VARCHAR,
    metadata    VARCHAR,
    updated_at  TIMESTAMP NOT NULL,
    PRIMARY KEY (keyword_id, site)
);

CREATE TABLE IF NOT EXISTS cycle_runs (
    id                  BIGINT PRIMARY KEY,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    keywords_processed  INTEGER DEFAULT 0,
    new_listings        INTEGER DEFAULT 0,
    emails_sent         INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS mail_log (
    id            BIGINT PRIMARY KEY,
    email         VARCHAR NOT NULL,
    subject       VARCHAR NOT NULL,
    listing_count INTEGER NOT NULL,
    sent_at       TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_links_keyword ON subscriber_keywords (keyword_id);
CREATE INDEX IF NOT EXISTS idx_mail_log_email ON mail_log (email);
"#;

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    /// Link a subscriber to a keyword, creating either as needed. The title
    /// is normalized before storage so "RTX 4070" and "rtx4070" collide.
    pub fn subscribe(&self, email: &str, title: &str) -> Result<Keyword> {
        let title = normalize_keyword(title);
        if title.is_empty() {
            bail!("keyword is empty after normalization");
        }

        let now = Utc::now().naive_utc();
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM subscribers WHERE email = ?")?;
            let mut rows = stmt.query_map(params![email], |r| r.get(0))?;
            rows.next().transpose()?
        };
        let subscriber_id: i64 = match existing {
            Some(id) => id,
            None => tx.query_row(
                "INSERT INTO subscribers (id, email, created_at)
                 SELECT COALESCE(MAX(id), 0) + 1, ?, ? FROM subscribers
                 RETURNING id",
                params![email, now],
                |r| r.get(0),
            )?,
        };

        let tracked: i64 = tx.query_row(
            "SELECT COUNT(*) FROM subscriber_keywords WHERE subscriber_id = ?",
            params![subscriber_id],
            |r| r.get(0),
        )?;
        if tracked >= MAX_KEYWORDS_PER_SUBSCRIBER {
            bail!("{} already tracks {} keywords (limit {})", email, tracked, MAX_KEYWORDS_PER_SUBSCRIBER);
        }

        let existing = {
            let mut stmt = tx.prepare("SELECT id, title, created_at FROM keywords WHERE title = ?")?;
            let mut rows = stmt.query_map(params![title], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get(2)?))
            })?;
            rows.next().transpose()?
        };
        let keyword = match existing {
            Some((id, title, created_at)) => Keyword { id, title, created_at },
            None => {
                let id: i64 = tx.query_row(
                    "INSERT INTO keywords (id, title, created_at)
                     SELECT COALESCE(MAX(id), 0) + 1, ?, ? FROM keywords
                     RETURNING id",
                    params![title, now],
                    |r| r.get(0),
                )?;
                Keyword { id, title: title.clone(), created_at: now }
            }
        };

        let linked = tx.execute(
            "INSERT OR IGNORE INTO subscriber_keywords (subscriber_id, keyword_id, linked_at)
             VALUES (?, ?, ?)",
            params![subscriber_id, keyword.id, now],
        )?;
        if linked == 0 {
            bail!("{} is already subscribed to '{}'", email, keyword.title);
        }

        tx.commit()?;
        Ok(keyword)
    }

    /// Unlink a subscriber from a keyword. A keyword that loses its last
    /// subscriber is deleted together with its watermarks. Returns true when
    /// the keyword itself was removed.
    pub fn unsubscribe(&self, email: &str, title: &str) -> Result<bool> {
        let title = normalize_keyword(title);
        let tx = self.conn.unchecked_transaction()?;

        let subscriber_id: i64 = tx
            .query_row("SELECT id FROM subscribers WHERE email = ?", params![email], |r| r.get(0))
            .with_context(|| format!("no subscriber {}", email))?;
        let keyword_id: i64 = tx
            .query_row("SELECT id FROM keywords WHERE title = ?", params![title], |r| r.get(0))
            .with_context(|| format!("no keyword '{}'", title))?;

        let unlinked = tx.execute(
            "DELETE FROM subscriber_keywords WHERE subscriber_id = ? AND keyword_id = ?",
            params![subscriber_id, keyword_id],
        )?;
        if unlinked == 0 {
            bail!("{} is not subscribed to '{}'", email, title);
        }

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM subscriber_keywords WHERE keyword_id = ?",
            params![keyword_id],
            |r| r.get(0),
        )?;

        let orphaned = remaining == 0;
        if orphaned {
            tx.execute("DELETE FROM watermarks WHERE keyword_id = ?", params![keyword_id])?;
            tx.execute("DELETE FROM keywords WHERE id = ?", params![keyword_id])?;
        }

        tx.commit()?;
        Ok(orphaned)
    }

    /// Keywords with at least one subscriber — the fan-out working set.
    pub fn keywords_with_subscribers(&self) -> Result<Vec<Keyword>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT k.id, k.title, k.created_at
             FROM keywords k
             JOIN subscriber_keywords sk ON sk.keyword_id = k.id
             ORDER BY k.id",
        )?;
        let keywords = stmt
            .query_map([], |r| {
                Ok(Keyword { id: r.get(0)?, title: r.get(1)?, created_at: r.get(2)? })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keywords)
    }

    /// All subscribers with their keyword ids, one join, link order preserved.
    pub fn subscribers_with_keywords(&self) -> Result<Vec<Subscriber>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.email, sk.keyword_id
             FROM subscribers s
             JOIN subscriber_keywords sk ON sk.subscriber_id = s.id
             ORDER BY s.id, sk.linked_at, sk.keyword_id",
        )?;

        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut subscribers: Vec<Subscriber> = Vec::new();
        for (id, email, keyword_id) in rows {
            match subscribers.last_mut() {
                Some(last) if last.id == id => last.keyword_ids.push(keyword_id),
                _ => subscribers.push(Subscriber { id, email, keyword_ids: vec![keyword_id] }),
            }
        }
        Ok(subscribers)
    }

    // ── Watermarks ────────────────────────────────────────────────────────────

    pub fn load_watermark(&self, keyword_id: i64, site: &str) -> Result<Option<Watermark>> {
        let mut stmt = self.conn.prepare(
            "SELECT keyword_id, site, external_id, link, price, metadata, updated_at
             FROM watermarks WHERE keyword_id = ? AND site = ?",
        )?;
        let mut rows = stmt.query_map(params![keyword_id, site], |r| {
            Ok(Watermark {
                keyword_id: r.get(0)?,
                site: r.get(1)?,
                external_id: r.get(2)?,
                link: r.get(3)?,
                price: r.get(4)?,
                metadata: r.get(5)?,
                updated_at: r.get(6)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Upsert the watermark row — idempotent, safe to re-run on same data.
    pub fn save_watermark(&self, keyword_id: i64, site: &str, update: &WatermarkUpdate) -> Result<()> {
        self.conn
            .execute(
                r#"INSERT INTO watermarks (keyword_id, site, external_id, link, price, metadata, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT (keyword_id, site) DO UPDATE SET
                       external_id = excluded.external_id,
                       link        = excluded.link,
                       price       = excluded.price,
                       metadata    = excluded.metadata,
                       updated_at  = excluded.updated_at"#,
                params![
                    keyword_id,
                    site,
                    update.external_id,
                    update.link,
                    update.price,
                    update.metadata,
                    Utc::now().naive_utc(),
                ],
            )
            .with_context(|| format!("upsert watermark for keyword {} on {}", keyword_id, site))?;
        Ok(())
    }

    // ── Mail log ──────────────────────────────────────────────────────────────

    pub fn record_mail(&self, email: &str, subject: &str, listing_count: usize) -> Result<()> {
        self.conn.execute(
            "INSERT INTO mail_log (id, email, subject, listing_count, sent_at)
             SELECT COALESCE(MAX(id), 0) + 1, ?, ?, ?, ? FROM mail_log",
            params![email, subject, listing_count as i64, Utc::now().naive_utc()],
        )?;
        Ok(())
    }

    // ── Cycle run log ─────────────────────────────────────────────────────────

    pub fn begin_cycle_run(&self) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO cycle_runs (id, started_at, status)
             SELECT COALESCE(MAX(id), 0) + 1, ?, 'running' FROM cycle_runs
             RETURNING id",
            params![Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_cycle_run(
        &self,
        run_id: i64,
        keywords: usize,
        new_listings: usize,
        emails_sent: usize,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE cycle_runs SET
               finished_at = ?, status = ?,
               keywords_processed = ?, new_listings = ?, emails_sent = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                keywords as i64,
                new_listings as i64,
                emails_sent as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn keyword_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM keywords")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn subscriber_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM subscribers")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn watermark_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM watermarks")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn mail_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM mail_log")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    /// Keywords with their subscriber counts, for the CLI listing.
    pub fn list_keywords(&self) -> Result<Vec<(Keyword, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT k.id, k.title, k.created_at, COUNT(sk.subscriber_id)
             FROM keywords k
             LEFT JOIN subscriber_keywords sk ON sk.keyword_id = k.id
             GROUP BY k.id, k.title, k.created_at
             ORDER BY k.id",
        )?;
        let keywords = stmt
            .query_map([], |r| {
                Ok((
                    Keyword { id: r.get(0)?, title: r.get(1)?, created_at: r.get(2)? },
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keywords)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn update(id: &str) -> WatermarkUpdate {
        WatermarkUpdate {
            external_id: id.to_string(),
            link: Some(format!("https://example.com/deal/{id}")),
            price: Some("9,900원".to_string()),
            metadata: None,
        }
    }

    #[test]
    fn subscribe_normalizes_and_links() {
        let repo = repo();
        let keyword = repo.subscribe("a@example.com", "RTX 4070").unwrap();
        assert_eq!(keyword.title, "rtx4070");

        let active = repo.keywords_with_subscribers().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "rtx4070");
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let repo = repo();
        repo.subscribe("a@example.com", "ssd").unwrap();
        assert!(repo.subscribe("a@example.com", "SSD").is_err());
    }

    #[test]
    fn keyword_cap_is_enforced() {
        let repo = repo();
        for i in 0..10 {
            repo.subscribe("a@example.com", &format!("kw{i}")).unwrap();
        }
        assert!(repo.subscribe("a@example.com", "kw10").is_err());
    }

    #[test]
    fn orphaned_keyword_is_deleted_with_watermark() {
        let repo = repo();
        let kw = repo.subscribe("a@example.com", "ssd").unwrap();
        repo.subscribe("b@example.com", "ssd").unwrap();
        repo.save_watermark(kw.id, "algumon", &update("101")).unwrap();

        // First unlink: keyword still has a subscriber.
        assert!(!repo.unsubscribe("a@example.com", "ssd").unwrap());
        assert_eq!(repo.keyword_count().unwrap(), 1);

        // Last unlink: keyword and its watermark go away.
        assert!(repo.unsubscribe("b@example.com", "ssd").unwrap());
        assert_eq!(repo.keyword_count().unwrap(), 0);
        assert_eq!(repo.watermark_count().unwrap(), 0);
        assert!(repo.keywords_with_subscribers().unwrap().is_empty());
    }

    #[test]
    fn watermark_upsert_round_trip() {
        let repo = repo();
        let kw = repo.subscribe("a@example.com", "ssd").unwrap();

        assert!(repo.load_watermark(kw.id, "algumon").unwrap().is_none());

        repo.save_watermark(kw.id, "algumon", &update("101")).unwrap();
        let stored = repo.load_watermark(kw.id, "algumon").unwrap().unwrap();
        assert_eq!(stored.external_id, "101");
        assert_eq!(stored.price.as_deref(), Some("9,900원"));

        repo.save_watermark(kw.id, "algumon", &update("205")).unwrap();
        let stored = repo.load_watermark(kw.id, "algumon").unwrap().unwrap();
        assert_eq!(stored.external_id, "205");
        assert_eq!(repo.watermark_count().unwrap(), 1);
    }

    #[test]
    fn subscribers_with_keywords_groups_links() {
        let repo = repo();
        repo.subscribe("a@example.com", "ssd").unwrap();
        repo.subscribe("a@example.com", "monitor").unwrap();
        repo.subscribe("b@example.com", "ssd").unwrap();

        let subs = repo.subscribers_with_keywords().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].email, "a@example.com");
        assert_eq!(subs[0].keyword_ids.len(), 2);
        assert_eq!(subs[1].email, "b@example.com");
        assert_eq!(subs[1].keyword_ids.len(), 1);
    }

    #[test]
    fn cycle_run_bookkeeping() {
        let repo = repo();
        let run_id = repo.begin_cycle_run().unwrap();
        repo.finish_cycle_run(run_id, 3, 7, 2, None).unwrap();

        let second = repo.begin_cycle_run().unwrap();
        assert!(second > run_id);
    }

    #[test]
    fn mail_log_records_sends() {
        let repo = repo();
        repo.record_mail("a@example.com", "New deals: ssd", 2).unwrap();
        repo.record_mail("b@example.com", "New deals: ssd", 2).unwrap();
        assert_eq!(repo.mail_count().unwrap(), 2);
    }
}
