mod config;
mod crawler;
mod diff;
mod mailer;
mod models;
mod proxy;
mod storage;
mod utils;
mod worker;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::crawler::AlgumonSource;
use crate::mailer::{LogMailer, Mailer, SmtpMailer};
use crate::proxy::ProxyPool;
use crate::storage::Repository;
use crate::worker::Worker;

#[derive(Parser)]
#[command(name = "dealwatch", about = "Keyword deal alerts: crawl, diff, digest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run one crawl-diff-notify cycle (cron mode)
    Run,

    /// Run cycles on a fixed interval until interrupted
    Watch,

    /// Subscribe an email address to a keyword
    Subscribe {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        keyword: String,
    },

    /// Remove a subscription; orphaned keywords are retired
    Unsubscribe {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        keyword: String,
    },

    /// List keywords with their subscriber counts
    Keywords,

    /// Show database statistics
    Stats,

    /// Apply schema migrations without running a cycle
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "dealwatch=info,warn",
        1 => "dealwatch=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Run => {
            let _t = utils::Timer::start("Cycle");
            let worker = build_worker(config)?;
            let stats = worker.run_cycle().await?;
            info!(
                "Done: {} keywords, {} new listings, {} digests, {} errors",
                stats.keywords, stats.new_listings, stats.emails_sent, stats.errors
            );
        }

        Command::Watch => {
            let interval_secs = config.worker.interval_secs;
            let worker = Arc::new(build_worker(config)?);

            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("watch mode: one cycle every {}s", interval_secs);

            loop {
                interval.tick().await;
                let worker = Arc::clone(&worker);
                // Fire-and-forget per tick; the worker's own guard drops a
                // tick that lands while the previous cycle still runs.
                tokio::spawn(async move {
                    let _t = utils::Timer::start("Cycle");
                    if let Err(e) = worker.run_cycle().await {
                        error!("cycle failed: {:#}", e);
                    }
                });
            }
        }

        Command::Subscribe { email, keyword } => {
            let repo = open_repo(&config)?;
            let kw = repo.subscribe(&email, &keyword)?;
            println!("{} now tracks '{}'", email, kw.title);
        }

        Command::Unsubscribe { email, keyword } => {
            let repo = open_repo(&config)?;
            let retired = repo.unsubscribe(&email, &keyword)?;
            println!("{} stopped tracking '{}'", email, keyword);
            if retired {
                println!("Keyword retired — no subscribers left.");
            }
        }

        Command::Keywords => {
            let repo = open_repo(&config)?;
            let keywords = repo.list_keywords()?;
            if keywords.is_empty() {
                println!("No keywords — run `dealwatch subscribe` first.");
            } else {
                println!("{} keywords:", keywords.len());
                for (kw, subscribers) in &keywords {
                    println!("  {:>4}  {}  ({} subscribers)", kw.id, kw.title, subscribers);
                }
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            println!("─────────────────────────────────");
            println!("  dealwatch — Database Stats");
            println!("─────────────────────────────────");
            println!("  Keywords     : {}", repo.keyword_count()?);
            println!("  Subscribers  : {}", repo.subscriber_count()?);
            println!("  Watermarks   : {}", repo.watermark_count()?);
            println!("  Digests sent : {}", repo.mail_count()?);
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

fn build_worker(config: AppConfig) -> Result<Worker> {
    let repo = Arc::new(Mutex::new(open_repo(&config)?));

    let pool = Arc::new(ProxyPool::new());
    let source = Arc::new(AlgumonSource::new(&config.crawler, Arc::clone(&pool))?);

    let mailer: Arc<dyn Mailer> = if config.mailer.enabled {
        Arc::new(SmtpMailer::new(&config.mailer)?)
    } else {
        info!("mailer disabled — digests will be logged, not sent");
        Arc::new(LogMailer)
    };

    Worker::new(config, repo, source, mailer, pool)
}
