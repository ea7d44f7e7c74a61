//! Digest building and delivery.
//!
//! One consolidated email per subscriber per cycle, at-most-once: a failed
//! send is logged and dropped, never retried.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::collections::HashSet;
use tracing::info;

use crate::config::MailerConfig;
use crate::crawler::search_link;
use crate::models::{Keyword, Listing};

// ── Mailer trait ──────────────────────────────────────────────────────────────

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()>;
}

// ── SMTP mailer ───────────────────────────────────────────────────────────────

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: lettre::message::Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &MailerConfig) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
            .context("Failed to build SMTP transport")?
            .port(config.smtp_port)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .build();

        let sender = config
            .sender
            .parse()
            .with_context(|| format!("invalid sender address '{}'", config.sender))?;

        Ok(Self { transport, sender })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.sender.clone())
            .to(to.parse().with_context(|| format!("invalid recipient '{}'", to))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .context("Failed to build message")?;

        self.transport
            .send(message)
            .await
            .with_context(|| format!("SMTP send to {} failed", to))?;
        info!("digest sent to {}", to);
        Ok(())
    }
}

// ── Log mailer ────────────────────────────────────────────────────────────────

/// Dry-run stand-in used when mail is disabled: digests land in the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<()> {
        info!("mail disabled — would send to {}: {} ({} bytes)", to, subject, html_body.len());
        Ok(())
    }
}

// ── Digest rendering ──────────────────────────────────────────────────────────

/// Subject titles shown before collapsing into "+N more".
const SUBJECT_TITLE_LIMIT: usize = 3;

/// Render one subscriber's digest: (subject, html body). Sections arrive in
/// the subscriber's link order; listings within a section are newest-first.
pub fn render_digest(base_url: &str, sections: &[(&Keyword, &[Listing])]) -> (String, String) {
    let titles: Vec<&str> = sections.iter().map(|(k, _)| k.title.as_str()).collect();
    (render_subject(&titles), render_body(base_url, sections))
}

pub fn render_subject(titles: &[&str]) -> String {
    let mut seen = HashSet::new();
    let unique: Vec<&str> = titles.iter().copied().filter(|t| seen.insert(*t)).collect();

    let shown = unique.iter().take(SUBJECT_TITLE_LIMIT).copied().collect::<Vec<_>>().join(", ");
    if unique.len() > SUBJECT_TITLE_LIMIT {
        format!("New deals: {} +{} more", shown, unique.len() - SUBJECT_TITLE_LIMIT)
    } else {
        format!("New deals: {}", shown)
    }
}

fn render_body(base_url: &str, sections: &[(&Keyword, &[Listing])]) -> String {
    let mut body = String::new();
    for (keyword, listings) in sections {
        body.push_str(&format!(
            "<h2><a href=\"{}\">{}</a></h2>\n",
            search_link(base_url, &keyword.title),
            keyword.title
        ));
        for listing in listings.iter() {
            body.push_str(&render_listing(listing));
        }
    }
    body
}

fn render_listing(listing: &Listing) -> String {
    let title = match listing.link.as_deref() {
        Some(link) => format!("<a href=\"{}\">{}</a>", link, listing.title),
        None => listing.title.clone(),
    };
    match listing.price.as_deref() {
        Some(price) => format!("<p>{} - {}</p>\n", title, price),
        None => format!("<p>{}</p>\n", title),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn keyword(id: i64, title: &str) -> Keyword {
        Keyword { id, title: title.to_string(), created_at: Utc::now().naive_utc() }
    }

    fn listing(id: &str, title: &str, price: Option<&str>) -> Listing {
        Listing {
            external_id: id.to_string(),
            title: title.to_string(),
            link: Some(format!("https://www.algumon.com/deal/{id}")),
            price: price.map(str::to_string),
            metadata: None,
            observed_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn body_renders_sections_in_order() {
        let ssd = keyword(1, "ssd");
        let ssd_hits = vec![listing("101", "990 PRO", Some("189,000원"))];
        let monitor = keyword(2, "monitor");
        let monitor_hits = vec![
            listing("55", "OLED G8", Some("890,000원")),
            listing("54", "M7", None),
        ];

        let sections: Vec<(&Keyword, &[Listing])> =
            vec![(&ssd, &ssd_hits), (&monitor, &monitor_hits)];
        let (subject, body) = render_digest("https://www.algumon.com", &sections);

        assert_eq!(subject, "New deals: ssd, monitor");
        assert!(body.contains("<h2><a href=\"https://www.algumon.com/search/ssd\">ssd</a></h2>"));
        assert!(body.contains("<a href=\"https://www.algumon.com/deal/101\">990 PRO</a> - 189,000원"));
        // Priceless listing still renders its link line.
        assert!(body.contains("<a href=\"https://www.algumon.com/deal/54\">M7</a></p>"));

        let ssd_at = body.find("search/ssd").unwrap();
        let monitor_at = body.find("search/monitor").unwrap();
        assert!(ssd_at < monitor_at);
    }

    #[test]
    fn subject_dedupes_and_truncates() {
        assert_eq!(render_subject(&["ssd"]), "New deals: ssd");
        assert_eq!(render_subject(&["ssd", "ssd", "tv"]), "New deals: ssd, tv");
        assert_eq!(
            render_subject(&["a", "b", "c", "d", "e"]),
            "New deals: a, b, c +2 more"
        );
    }

    #[test]
    fn log_mailer_accepts_anything() {
        tokio_test::block_on(async {
            LogMailer.send("a@example.com", "subject", "<p>body</p>").await.unwrap();
        });
    }
}
