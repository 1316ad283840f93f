use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dealcycle_core::{LinkStore, LinkTagger, LinksDocument, ProgressSnapshot};
use dealcycle_session::{Config, SessionDispatcher, LINKS_FILE, PROGRESS_FILE};
use dealcycle_storage::LocalStateStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Curated, verified marketplace identifiers used to seed the link cache.
const SEED_CATALOG: &[(&str, &str)] = &[
    ("B0863TXGM3", "Samsung Galaxy M31"),
    ("B08CF5PPM3", "OnePlus Nord CE 5G"),
    ("B08J5F3G18", "Apple iPad (9th Gen)"),
    ("B08N5M7S6K", "MacBook Air M1"),
    ("B07DJHXTLJ", "Echo Dot (3rd Gen)"),
    ("B0756CYWWD", "Fire TV Stick"),
    ("B08KFD42GJ", "Redmi 9A"),
    ("B07W6CP4W8", "Samsung 43\" Smart TV"),
    ("B08444CCPT", "boAt Airdopes 441"),
    ("B07VG5G6DV", "Mi Band 4"),
    ("B08Z74DZ4D", "HP 14 Laptop"),
    ("B08N5WRWNW", "iPhone 12"),
    ("B07HGJKJL2", "Samsung Galaxy A32"),
    ("B08CFSZLQ4", "OnePlus 9R 5G"),
    ("B08BHBQKP7", "iPad Air"),
    ("B07DJ2K9GS", "MacBook Pro"),
    ("B087LQZLV7", "Echo Show 8"),
    ("B08B4X6LZW", "Fire TV Stick 4K"),
    ("B084K9GKB8", "Redmi Note 10 Pro"),
    ("B0856J7TWL", "Sony WH-CH710N"),
];

const SUMMARY_FILE: &str = "products_summary.txt";

#[derive(Debug, Parser)]
#[command(name = "dealcycle")]
#[command(about = "Affiliate link rotation and scheduled posting pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one posting session (chat channel + website feed)
    Run {
        /// Session label; defaults to the configured SESSION_TYPE
        #[arg(long)]
        session: Option<String>,
    },
    /// Generate the link cache from the curated catalog
    Seed {
        /// Cap the number of generated links
        #[arg(long)]
        count: Option<usize>,
        /// Merge into the existing cache instead of replacing it
        #[arg(long)]
        merge: bool,
    },
    /// Print the local link and progress state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { session: None }) {
        Commands::Run { session } => {
            let config = Config::from_env()?;
            let label = session.unwrap_or_else(|| config.session_label.clone());
            let dispatcher = SessionDispatcher::from_config(config)?;
            let summary = dispatcher.run(&label).await?;
            println!(
                "session complete: run_id={} label={} chat_sent={} chat_failed={} website_posted={} feed_total={} index={}",
                summary.run_id,
                summary.session_label,
                summary.chat_sent,
                summary.chat_failed,
                summary.website_posted,
                summary.feed_total,
                summary.progress.current_index,
            );
        }
        Commands::Seed { count, merge } => seed(count, merge).await?,
        Commands::Status => status().await?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DEALCYCLE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn seed(count: Option<usize>, merge: bool) -> Result<()> {
    let config = Config::from_env()?;
    let tagger = LinkTagger::new(
        config.marketplace_domain.clone(),
        config.affiliate_tag.clone(),
    );
    let local = LocalStateStore::new(config.data_dir.clone());
    let now = Utc::now();

    let take = count.unwrap_or(SEED_CATALOG.len()).min(SEED_CATALOG.len());
    let generated: Vec<String> = SEED_CATALOG[..take]
        .iter()
        .map(|(asin, _)| {
            tagger.convert(&format!(
                "https://{}/dp/{}",
                config.marketplace_domain, asin
            ))
        })
        .collect();

    let links = if merge {
        let added =
            dealcycle_session::merge_into_link_cache(&local, &tagger, generated, now).await?;
        info!(added, "merged seed links into existing cache");
        local
            .read_json::<LinksDocument>(LINKS_FILE)
            .await?
            .map(|doc| doc.links)
            .unwrap_or_default()
    } else {
        let store = LinkStore::from_links(generated);
        let doc = LinksDocument {
            links: store.links().to_vec(),
            total_count: Some(store.len()),
            last_scraped: Some(now),
            affiliate_tag: Some(config.affiliate_tag.clone()),
        };
        local.write_json(LINKS_FILE, &doc).await?;
        doc.links
    };

    let mut summary = String::new();
    summary.push_str("Curated marketplace products\n");
    summary.push_str(&"=".repeat(50));
    summary.push('\n');
    summary.push_str(&format!("Generated: {}\n", now.format("%Y-%m-%d %H:%M:%S")));
    summary.push_str(&format!("Affiliate tag: {}\n", config.affiliate_tag));
    summary.push_str(&format!("Total links: {}\n\n", links.len()));
    for (i, link) in links.iter().enumerate() {
        let label = SEED_CATALOG
            .iter()
            .find(|(asin, _)| link.contains(asin))
            .map(|(_, label)| *label)
            .unwrap_or("(discovered)");
        summary.push_str(&format!("{:2}. {label}\n    {link}\n\n", i + 1));
    }
    local.write_bytes(SUMMARY_FILE, summary.as_bytes()).await?;

    println!(
        "seeded {} links into {}",
        links.len(),
        local.path_of(LINKS_FILE).display()
    );
    Ok(())
}

async fn status() -> Result<()> {
    let config = Config::from_env()?;
    let local = LocalStateStore::new(config.data_dir.clone());

    let links = local
        .read_json::<LinksDocument>(LINKS_FILE)
        .await?
        .map(|doc| doc.links.len())
        .unwrap_or(0);
    println!("links cached: {links}");

    match local.read_json::<ProgressSnapshot>(PROGRESS_FILE).await? {
        Some(progress) => println!(
            "cursor: index {} of {} (cycle {}, position {}), last session {} at {}",
            progress.current_index,
            progress.total_links,
            progress.cycle_number,
            progress.position_in_cycle,
            progress.session_type,
            progress.last_updated,
        ),
        None => println!("cursor: no progress recorded yet"),
    }
    Ok(())
}
