use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use podcharts_core::Platform;
use podcharts_storage::ChartStore;
use podcharts_sync::{
    run_charts_once_from_env, run_details_once_from_env, run_publish_once_from_env,
    ChartRunSummary, DetailRunSummary, Pipeline, PipelineConfig, PublishSummary,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "podcharts")]
#[command(about = "Podcast chart snapshots, directory enrichment and sheet publishing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch today's charts into the store
    Charts {
        #[arg(long, value_enum, default_value_t = PlatformArg::All)]
        platform: PlatformArg,
    },
    /// Resolve charted titles and refresh podcast details
    Details,
    /// Push the reporting views to the spreadsheet
    Publish,
    /// Create tables and views only
    Migrate,
    /// Charts, details and publish in order
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlatformArg {
    Apple,
    Spotify,
    All,
}

impl PlatformArg {
    fn platforms(self) -> Vec<Platform> {
        match self {
            PlatformArg::Apple => vec![Platform::Apple],
            PlatformArg::Spotify => vec![Platform::Spotify],
            PlatformArg::All => Platform::ALL.to_vec(),
        }
    }
}

fn init_logging() {
    let log_format = std::env::var("PODCHARTS_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_target(false))
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), log_format = %log_format, "logging initialized");
}

fn print_charts(summary: &ChartRunSummary) {
    println!(
        "charts complete: run_id={} fetched={} inserted={} ignored={} failed={}",
        summary.run_id,
        summary.fetched(),
        summary.inserted(),
        summary.ignored(),
        summary.failed()
    );
}

fn print_details(summary: &DetailRunSummary) {
    println!(
        "details complete: run_id={} titles={} resolved={} unresolved={} updated={} detail_failures={} update_errors={} category_link_errors={}",
        summary.run_id,
        summary.titles,
        summary.resolved,
        summary.unresolved,
        summary.updated,
        summary.detail_failures,
        summary.update_errors,
        summary.category_link_errors
    );
}

fn print_publish(summary: &PublishSummary) {
    println!(
        "publish complete: updated={} skipped={} failed={}",
        summary.updated, summary.skipped, summary.failed
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the process environment still applies.
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Charts {
        platform: PlatformArg::All,
    }) {
        Commands::Charts { platform } => {
            print_charts(&run_charts_once_from_env(&platform.platforms()).await?);
        }
        Commands::Details => print_details(&run_details_once_from_env().await?),
        Commands::Publish => print_publish(&run_publish_once_from_env().await?),
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let store = ChartStore::open(&config.store.db_path).await?;
            println!("migrate complete: db={}", store.path().display());
        }
        Commands::Run => {
            let pipeline = Pipeline::open(PipelineConfig::from_env()).await?;
            print_charts(&pipeline.run_charts(&Platform::ALL).await?);
            print_details(&pipeline.run_details().await?);
            print_publish(&pipeline.run_publish().await?);
        }
    }

    Ok(())
}
