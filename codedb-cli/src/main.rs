use clap::{Parser, Subcommand};
use colored::Colorize;
use codedb::{find, CodeDbError, CodeDbResult, Database, FindOptions, Metrics};
use std::env;
use std::io::{self, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to start from instead of the current one
    #[arg(short = 'd', long = "dir", global = true)]
    dir: Option<PathBuf>,

    /// Log filter (error|warn|info|debug|trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a database in the current directory
    Init,

    /// Show or change database settings
    Config {
        /// Setting to show or change; all settings when omitted
        key: Option<String>,

        /// New value for the setting
        value: Option<String>,
    },

    /// Index the source tree into the database
    Build {
        /// Print each file as it is indexed
        #[arg(short = 'v', long)]
        verbose: bool,
    },

    /// Search the database for one or more patterns
    Find {
        /// Ignore case
        #[arg(short = 'i', long = "ignore-case")]
        ignore_case: bool,

        /// Match patterns as literal text
        #[arg(short = 'v', long)]
        verbatim: bool,

        /// Search the whole database, not just the current directory
        #[arg(short = 'a', long)]
        all: bool,

        /// Number of threads to use
        #[arg(short = 'j', long)]
        threads: Option<NonZeroUsize>,

        /// Patterns to search for, run one after another
        #[arg(required = true)]
        patterns: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CodeDbError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn report_error(error: &CodeDbError) {
    match error {
        CodeDbError::InvalidPattern { message, pattern } => {
            eprintln!("{} invalid regex '{}'", "Error:".red().bold(), pattern);
            for line in message.lines() {
                eprintln!("  {}", line);
            }
        }
        other => eprintln!("{} {}", "Error:".red().bold(), other),
    }
}

fn run(cli: Cli) -> CodeDbResult<()> {
    let cwd = match cli.dir {
        Some(dir) => dir,
        None => env::current_dir()?,
    };
    debug!("Working directory: {}", cwd.display());

    match cli.command {
        Commands::Init => {
            let db = Database::init(&cwd)?;
            println!(
                "Initialized empty database in {}",
                db.dir().display().to_string().blue()
            );
        }

        Commands::Config { key, value } => {
            let db = Database::discover(&cwd)?;
            run_config(&db, key.as_deref(), value.as_deref())?;
        }

        Commands::Build { verbose } => {
            let db = Database::discover(&cwd)?;
            let metrics = Metrics::new();
            let mut progress = |name: &str| {
                if verbose {
                    println!("{}", name);
                }
            };
            let summary = db.build(&metrics, &mut progress)?;
            println!(
                "Indexed {} files ({} bytes) into {} chunks",
                summary.files.to_string().green(),
                summary.bytes,
                summary.chunks
            );
            metrics.log_stats();
        }

        Commands::Find {
            ignore_case,
            verbatim,
            all,
            threads,
            patterns,
        } => {
            let db = Database::discover(&cwd)?;
            let options = FindOptions {
                case_insensitive: ignore_case,
                verbatim,
                all,
                threads,
            };
            let metrics = Metrics::new();
            let mut out = BufWriter::new(io::stdout());
            find(&db, &cwd, &patterns, &options, &metrics, &mut out)?;
            out.flush()?;
            metrics.log_stats();
        }
    }

    Ok(())
}

fn run_config(db: &Database, key: Option<&str>, value: Option<&str>) -> CodeDbResult<()> {
    match (key, value) {
        (None, _) => {
            for (key, value) in db.config()?.entries() {
                println!("{}: {}", key.green(), value);
            }
        }
        (Some(key), None) => println!("{}", db.config()?.get_value(key)?),
        (Some(key), Some(value)) => {
            let mut config = db.local_config()?;
            config.set_value(key, value)?;
            db.save_config(&config)?;
            debug!("Set {} = {} in {}", key, value, db.config_path().display());
        }
    }
    Ok(())
}
