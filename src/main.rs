//! reviewharvest - ICLR OpenReview harvester
//!
//! Collects submissions, reviews, meta-reviews and decisions for a range of
//! conference years and writes one unified JSON Lines file.
//!
//! ## Usage
//!
//! ```bash
//! reviewharvest harvest --years 2016-2025 --output data/output/iclr2016-2025_main.jsonl
//! reviewharvest harvest --years 2024 --resume --summary-csv summary.csv
//! reviewharvest candidates 2017 --version v1
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reviewharvest::cancel::CancelFlag;
use reviewharvest::clock::MonotonicClock;
use reviewharvest::config::{self, HarvestConfig};
use reviewharvest::http::RateLimitedClient;
use reviewharvest::invitations;
use reviewharvest::notes::ApiVersion;
use reviewharvest::openreview::OpenReviewApi;
use reviewharvest::orchestrator::Harvester;
use reviewharvest::sink::{JsonlSink, SinkMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// ICLR OpenReview harvester
#[derive(Parser)]
#[command(name = "reviewharvest")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest one or more conference years
    Harvest {
        /// Year or inclusive range (e.g., "2024", "2016-2025")
        #[arg(long, default_value = "2016-2025")]
        years: String,

        /// Output JSON Lines file
        #[arg(short, long, default_value = "data/output/iclr2016-2025_main.jsonl")]
        output: PathBuf,

        /// Keep existing output and skip papers already in it
        #[arg(long)]
        resume: bool,

        /// Also write the per-year summary as CSV
        #[arg(long)]
        summary_csv: Option<PathBuf>,

        /// OpenReview account (email)
        #[arg(long, env = "OPENREVIEW_USERNAME")]
        username: Option<String>,

        /// OpenReview password
        #[arg(long, env = "OPENREVIEW_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Pre-issued bearer token, used when no credentials are given
        #[arg(long, env = "OPENREVIEW_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Aggregate request ceiling (requests per second)
        #[arg(long, default_value = "5")]
        rate: f64,

        /// Notes per page
        #[arg(long, default_value = "1000")]
        page_size: usize,

        /// Pages per query before pagination is declared runaway
        #[arg(long, default_value = "100")]
        max_pages: usize,

        /// Concurrent reply fetches per year
        #[arg(long, default_value = "8")]
        review_concurrency: usize,

        /// Years harvested concurrently
        #[arg(long, default_value = "2")]
        year_concurrency: usize,

        /// Retries for transient failures
        #[arg(long, default_value = "5")]
        max_retries: u32,

        /// API v1 base URL
        #[arg(long, default_value = config::DEFAULT_V1_BASE)]
        v1_base: String,

        /// API v2 base URL
        #[arg(long, default_value = config::DEFAULT_V2_BASE)]
        v2_base: String,

        /// Venue group prefix
        #[arg(long, default_value = config::DEFAULT_VENUE)]
        venue: String,

        /// Hide the per-year progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Print the submission queries probed for a year
    Candidates {
        /// Conference year
        year: i32,

        /// API generation
        #[arg(long, value_enum, default_value = "v2")]
        version: VersionArg,

        /// Venue group prefix
        #[arg(long, default_value = config::DEFAULT_VENUE)]
        venue: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VersionArg {
    V1,
    V2,
}

impl From<VersionArg> for ApiVersion {
    fn from(value: VersionArg) -> Self {
        match value {
            VersionArg::V1 => ApiVersion::V1,
            VersionArg::V2 => ApiVersion::V2,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if cli.log_json {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }

    match cli.command {
        Commands::Harvest {
            years,
            output,
            resume,
            summary_csv,
            username,
            password,
            token,
            rate,
            page_size,
            max_pages,
            review_concurrency,
            year_concurrency,
            max_retries,
            v1_base,
            v2_base,
            venue,
            no_progress,
        } => {
            let config = HarvestConfig {
                v1_base_url: v1_base,
                v2_base_url: v2_base,
                venue,
                page_size,
                max_pages,
                requests_per_second: rate,
                max_retries,
                review_concurrency,
                year_concurrency,
                ..Default::default()
            };
            let credentials = Credentials {
                username,
                password,
                token,
            };
            let progress = !no_progress && !cli.log_json;
            run_harvest(config, &years, output, resume, summary_csv, credentials, progress).await
        }
        Commands::Candidates {
            year,
            version,
            venue,
        } => {
            for query in invitations::candidates(&venue, year, version.into()) {
                println!("{}", query);
            }
            Ok(())
        }
    }
}

struct Credentials {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

// ============================================================================
// Harvest
// ============================================================================

async fn run_harvest(
    config: HarvestConfig,
    years: &str,
    output: PathBuf,
    resume: bool,
    summary_csv: Option<PathBuf>,
    credentials: Credentials,
    progress: bool,
) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let years = config::parse_years(years).context("Invalid --years")?;

    // One client so both API generations share the rate limit
    let client = Arc::new(RateLimitedClient::from_config(&config)?);
    let mut v2 = OpenReviewApi::new(ApiVersion::V2, &config.v2_base_url, Arc::clone(&client))?
        .with_token(credentials.token.clone());
    let mut v1 = OpenReviewApi::new(ApiVersion::V1, &config.v1_base_url, client)?
        .with_token(credentials.token.clone());

    match (&credentials.username, &credentials.password) {
        (Some(user), Some(pass)) => {
            v2.login(user, pass).await.context("API v2 login failed")?;
            v1.login(user, pass).await.context("API v1 login failed")?;
        }
        (Some(_), None) | (None, Some(_)) => {
            bail!("Both --username and --password are required to log in");
        }
        (None, None) if credentials.token.is_none() => {
            info!("No credentials given, harvesting anonymously");
        }
        (None, None) => {}
    }

    let mode = if resume { SinkMode::Resume } else { SinkMode::Fresh };
    let (sink, existing) = JsonlSink::open(&output, mode)
        .with_context(|| format!("Failed to open output {:?}", output))?;
    if resume {
        info!(path = %output.display(), papers = existing.len(), "Resuming");
    }

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight records");
                cancel.cancel();
            }
        });
    }

    let mut harvester = Harvester::new(
        &config,
        Arc::new(v2),
        Arc::new(v1),
        Arc::new(sink),
        existing,
        Arc::new(MonotonicClock::new()),
        cancel,
    );
    if progress {
        harvester = harvester.with_progress();
    }
    let report = harvester.harvest(&years).await;

    println!("\n{}", report);
    println!("Output: {:?}", output);

    if let Some(path) = summary_csv {
        report
            .write_csv(&path)
            .with_context(|| format!("Failed to write summary {:?}", path))?;
        println!("Summary: {:?}", path);
    }

    if !report.is_ok() {
        let incomplete: Vec<String> = report
            .years
            .iter()
            .filter(|y| !y.status.is_ok())
            .map(|y| format!("{} ({})", y.year, y.status.label()))
            .collect();
        error!(years = ?incomplete, "Harvest incomplete");
        bail!("Harvest incomplete for {}", incomplete.join(", "));
    }
    Ok(())
}
