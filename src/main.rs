use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use notion_overdue::config;
use notion_overdue::notifier::Channels;
use notion_overdue::notion::NotionClient;
use notion_overdue::sweep::{self, SweepOptions};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Send staged overdue notices for a Notion loans database and exit"
)]
struct Args {
    /// Path to YAML config file; environment variables override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reference date (YYYY-MM-DD) instead of today's local date
    #[arg(long)]
    today: Option<NaiveDate>,

    /// Log due transitions without sending mail or updating Notion
    #[arg(long)]
    dry_run: bool,

    /// Print an example config file and exit
    #[arg(long)]
    print_example_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(args.config.as_deref()).context("invalid configuration")?;
    let notion = NotionClient::from_config(&cfg)?;
    let channels = Channels::from_config(&cfg)?;
    let ids = notion.resolve_property_ids(&cfg).await?;

    let opts = SweepOptions {
        today: args
            .today
            .unwrap_or_else(|| chrono::Local::now().date_naive()),
        dry_run: args.dry_run,
        admin_email: cfg.smtp.admin_address().map(str::to_string),
    };
    info!(
        today = %opts.today,
        mail = channels.mail_enabled(),
        broadcast = channels.broadcast_enabled(),
        contacts = ids.contacts_db.is_some(),
        "starting sweep"
    );

    let report = sweep::run(&ids, &notion, &notion, &channels, &opts).await?;
    println!("{}", report.describe());
    Ok(())
}
