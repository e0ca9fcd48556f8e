use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use notion_overdue::config;
use notion_overdue::notion::NotionClient;

/// Print a database's properties, to fill in the field mapping of the config file.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config; NOTION_TOKEN from the environment also works
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database ID to inspect (defaults to the configured loans database)
    #[arg(long)]
    db_id: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(args.config.as_deref())?;
    let client = NotionClient::from_config(&cfg)?;
    let db_id = args
        .db_id
        .unwrap_or_else(|| cfg.notion.databases.loans.id.clone());

    let db = client.retrieve_database(&db_id).await?;
    let title: String = db
        .title
        .iter()
        .filter_map(|t| t.get("plain_text").and_then(|v| v.as_str()))
        .collect();
    println!("Database: {} ({})", title, db.id);
    println!("Properties:");
    let mut props: Vec<_> = db.properties.iter().collect();
    props.sort_by(|a, b| a.0.cmp(b.0));
    for (name, prop) in props {
        println!("  {} -> {{ id: {}, type: {} }}", name, prop.id, prop.typ);
    }
    Ok(())
}
