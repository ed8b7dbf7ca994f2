use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use codeatlas::config::{Config, LoggingConfig};

mod cli;

use cli::OutputFormat;

#[derive(Parser)]
#[command(name = "codeatlas")]
#[command(version)]
#[command(about = "Token-budgeted structural code index for AI assistants", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root
    #[arg(short, long, global = true, default_value = ".")]
    project: String,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from scratch
    Init,

    /// Bring the index up to date with the working tree
    Update {
        /// Only re-index these root-relative paths
        paths: Vec<String>,

        /// Re-scan everything instead of diffing against stored metadata
        #[arg(long)]
        full: bool,
    },

    /// Ask a free-text question
    Query {
        /// Query text, e.g. "what calls authenticate"
        #[arg(required = true)]
        text: Vec<String>,

        /// Token budget for the response
        #[arg(short = 't', long)]
        max_tokens: Option<usize>,

        /// Skip this many results
        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Look up symbols by name
    Find {
        name: String,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// List the symbols of one file
    Show {
        /// File path or unique suffix of one
        path: String,

        #[arg(short = 't', long)]
        max_tokens: Option<usize>,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// List exported symbols
    Exports {
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Show index statistics
    Stats,

    /// Compact the database and refresh planner statistics
    Optimize,

    /// Keep the index current while files change
    Watch,

    /// Show session telemetry
    Session {
        /// Fold the current session into the lifetime totals and reset it
        #[arg(long)]
        end: bool,
    },
}

fn init_logging(config: &LoggingConfig, debug: bool, verbose: bool) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        config.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("codeatlas={}", level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if config.format == "pretty" {
        builder.pretty().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_project_dir(&cli.project)
        .with_context(|| format!("Failed to load configuration for {}", cli.project))?;
    init_logging(&config.logging, cli.debug, cli.verbose);
    debug!("codeatlas v{} starting", env!("CARGO_PKG_VERSION"));

    let workspace = cli::Workspace::open(&cli.project, config)?;
    let format = cli.format;

    match cli.command {
        Commands::Init => cli::index::init(&workspace, format).await?,
        Commands::Update { paths, full } => {
            cli::index::update(&workspace, paths, full, format).await?
        }
        Commands::Query {
            text,
            max_tokens,
            offset,
        } => cli::query::query(&workspace, &text.join(" "), max_tokens, offset, format)?,
        Commands::Find {
            name,
            limit,
            offset,
        } => cli::query::find(&workspace, &name, limit, offset, format)?,
        Commands::Show {
            path,
            max_tokens,
            offset,
        } => cli::query::show(&workspace, &path, max_tokens, offset, format)?,
        Commands::Exports { limit, offset } => {
            cli::query::exports(&workspace, limit, offset, format)?
        }
        Commands::Stats => cli::stats::show_stats(&workspace, format)?,
        Commands::Optimize => cli::index::optimize(&workspace).await?,
        Commands::Watch => cli::index::watch(&workspace).await?,
        Commands::Session { end } => cli::stats::show_session(&workspace, end, format)?,
    }

    Ok(())
}
