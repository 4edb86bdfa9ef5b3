use archivesync::{sync_series, SeriesQuery, SyncConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "archivesync")]
#[command(about = "Download digitized catalog records based on parent series ID", long_about = None)]
#[command(version)]
struct Args {
    /// Parent series ID
    #[arg(short, long, default_value = "5573655")]
    id: String,

    /// Total number of records to fetch
    #[arg(short, long, default_value_t = 50)]
    limit: usize,

    /// Don't download files, just query the catalog and write the results JSON
    #[arg(short, long)]
    no_download: bool,

    /// Directory receiving results_{id}.json and output_{id}/
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Catalog API base URL
    #[arg(long, default_value = "https://catalog.archives.gov/api/v2")]
    endpoint: String,

    /// Records requested per catalog page
    #[arg(long, default_value_t = 100)]
    page_size: usize,

    /// Maximum parallel downloads
    #[arg(short, long, default_value_t = 8)]
    concurrency: usize,

    /// Catalog API key
    #[arg(long, env = "NARA_KEY", hide_env_values = true)]
    api_key: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Trust files from a previous run without re-checking them
    #[arg(long)]
    skip_verify: bool,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the key may come from the environment or --api-key.
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("archivesync={}", log_level))
        .init();

    info!("🚀 Archivesync - Catalog Series Downloader");
    info!("Series: {}", args.id);
    info!("Limit: {}", args.limit);
    info!("Output directory: {:?}", args.output);

    let config = SyncConfig {
        endpoint: args.endpoint,
        page_size: args.page_size,
        concurrency: args.concurrency,
        credential: args.api_key,
        output_root: args.output,
        request_timeout: Duration::from_secs(args.timeout),
        skip_verify: args.skip_verify,
        show_progress: !args.no_progress,
        ..SyncConfig::default()
    };
    let query = SeriesQuery::new(args.id, args.limit).dry_run(args.no_download);

    match sync_series(&config, &query).await {
        Ok(result) => {
            info!("✅ Series {} synced", query.series_id);
            println!("{}", result);
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            std::process::exit(1);
        }
    }
}
