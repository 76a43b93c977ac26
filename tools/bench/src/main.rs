use clap::{Parser, Subcommand, ValueEnum};
use ping_discovery::DEFAULT_KEY_PREFIX;
use std::net::SocketAddr;
use std::path::PathBuf;

mod metrics;
mod runner;

#[derive(Parser)]
#[command(name = "ping-bench")]
#[command(about = "Load generator for backends found through discovery")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping discovered backends from concurrent workers
    Run(RunArgs),

    /// Display results from a previous run
    Report(ReportArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Discovery key prefix
    #[arg(long, env = "PING_DISCOVERY_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    discovery_key_prefix: String,

    /// Comma-separated etcd endpoints used for service discovery
    #[arg(
        long,
        env = "PING_DISCOVERY_ADDRESSES",
        value_delimiter = ',',
        default_value = "http://localhost:2480,http://localhost:2481,http://localhost:2482"
    )]
    discovery_addresses: Vec<String>,

    /// Number of concurrent workers (default: 2x CPUs)
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Total number of requests (0 = unlimited until duration)
    #[arg(short = 'n', long, default_value = "0")]
    requests: usize,

    /// Test duration in seconds (0 = until requests complete)
    #[arg(short, long, default_value = "60")]
    duration: u64,

    /// Ramp-up period in seconds
    #[arg(long, default_value = "0")]
    ramp_up: u64,

    /// Timeout for each ping in milliseconds
    #[arg(long, default_value = "1000")]
    request_timeout_ms: u64,

    /// Output file for results
    #[arg(short, long, default_value = "./ping-bench-results.json")]
    output: PathBuf,

    /// Real-time progress report interval in seconds
    #[arg(long, default_value = "5")]
    report_interval: u64,

    /// Serve Prometheus metrics while running
    #[arg(long, env = "PING_BENCH_METRICS_LISTEN_ADDRESS")]
    metrics_listen_address: Option<SocketAddr>,
}

#[derive(clap::Args)]
struct ReportArgs {
    /// Path to results file
    #[arg(short, long, default_value = "./ping-bench-results.json")]
    input: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: ReportFormat,

    /// Compare with another results file
    #[arg(long)]
    compare: Option<PathBuf>,
}

#[derive(Clone, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Run(args) => {
            runner::run_bench(args).await?;
        }
        Commands::Report(args) => {
            report::run_report(args)?;
        }
    }

    Ok(())
}

mod report {
    use super::*;

    pub fn run_report(args: ReportArgs) -> anyhow::Result<()> {
        let results = std::fs::read_to_string(&args.input)?;
        let results: metrics::BenchResults = serde_json::from_str(&results)?;

        match args.format {
            ReportFormat::Text => {
                println!("{}", results.format_text());
            }
            ReportFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
            ReportFormat::Csv => {
                println!("{}", results.format_csv());
            }
        }

        if let Some(compare_path) = args.compare {
            let compare = std::fs::read_to_string(&compare_path)?;
            let compare: metrics::BenchResults = serde_json::from_str(&compare)?;
            println!("\n{}", results.compare(&compare));
        }

        Ok(())
    }
}
