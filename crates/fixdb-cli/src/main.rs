//! CLI frontend for inspecting and querying fixdb fixture directories.

mod commands;
mod config;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(
    name = "fixdb",
    about = "fixdb: query declarative fixture data as an in-memory ORM",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ./fixdb.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and link every schema document, reporting errors
    Check {
        /// Directory containing schema documents
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show each model's fields and relations
    Models {
        /// Directory containing schema documents
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// List the rows of a model
    List {
        /// Model name (e.g. Character)
        model: String,

        /// Sort by field; prefix with '-' for descending
        #[arg(long)]
        order_by: Option<String>,

        /// Show at most this many rows
        #[arg(short, long)]
        limit: Option<usize>,

        /// Directory containing schema documents
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show one row with its resolved relations
    Show {
        /// Model name
        model: String,

        /// Primary key
        pk: i64,

        /// Directory containing schema documents
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Run a filter query
    Query {
        /// Model name
        model: String,

        /// Lookup to match, as LOOKUP=VALUE (VALUE is JSON, or a plain string)
        #[arg(short, long = "filter", value_name = "LOOKUP=VALUE")]
        filter: Vec<String>,

        /// Lookup to exclude, as LOOKUP=VALUE
        #[arg(short = 'x', long = "exclude", value_name = "LOOKUP=VALUE")]
        exclude: Vec<String>,

        /// Sort by field; prefix with '-' for descending
        #[arg(long)]
        order_by: Option<String>,

        /// Print these comma-separated field paths instead of whole rows
        #[arg(long, value_delimiter = ',')]
        values: Vec<String>,

        /// Print only the first match
        #[arg(long)]
        first: bool,

        /// Directory containing schema documents
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> Result<(), String> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check { dir } => commands::check::run(&config.fixtures_dir(dir), &config),
        Commands::Models { dir } => commands::models::run(&config.fixtures_dir(dir), &config),
        Commands::List {
            model,
            order_by,
            limit,
            dir,
        } => commands::list::run(
            &config.fixtures_dir(dir),
            &config,
            &model,
            order_by.as_deref(),
            limit,
        ),
        Commands::Show { model, pk, dir } => {
            commands::show::run(&config.fixtures_dir(dir), &config, &model, pk)
        }
        Commands::Query {
            model,
            filter,
            exclude,
            order_by,
            values,
            first,
            dir,
        } => commands::query::run(
            &config.fixtures_dir(dir),
            &config,
            &commands::query::QueryArgs {
                model: &model,
                filter: &filter,
                exclude: &exclude,
                order_by: order_by.as_deref(),
                values: &values,
                first,
            },
        ),
    }
}
