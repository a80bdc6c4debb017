use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use steam_catalog::cli::{crawl, db_counts};
use steam_catalog::ingest::CrawlOverrides;
use steam_catalog::tracing::{init_tracing, DEFAULT_FILTER};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "steam-catalog", version, about = "Steam store catalog crawler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the store listing and sync every game into the catalog
    Crawl(CrawlArgs),
    /// Print row counts of the catalog tables
    Counts {
        /// Postgres DSN (defaults to the environment)
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[derive(Debug, Args)]
struct CrawlArgs {
    /// Run against an in-memory store; nothing is written to Postgres
    #[arg(long)]
    dry_run: bool,
    #[command(flatten)]
    overrides: CrawlOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    steam_catalog::util::env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    match cli.command {
        Command::Crawl(args) => {
            let report = crawl::run(crawl::CrawlOptions {
                dry_run: args.dry_run,
                overrides: args.overrides,
            })
            .await
            .inspect_err(|e| error!(error = %format!("{e:#}"), "crawl aborted"))?;
            if let Some(err) = &report.finalization_error {
                error!(error = %err, "availability update failed");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("crawl complete");
        }
        Command::Counts { database_url } => {
            print!("{}", db_counts::run(database_url).await?);
        }
    }
    Ok(())
}
