//! Command-line interface for jidac archives.

use clap::{Args, Parser, Subcommand};

use jidac::ops::{self, Options, MAX_QUIET};
use jidac::{date, Error};

/// Journaling incremental deduplicating archiver
#[derive(Parser)]
#[command(name = "jidac")]
#[command(author, version, about = "Journaling incremental deduplicating archiver", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Common {
    /// Archive file (`.zpaq` appended if missing; empty = dry run)
    archive: String,

    /// Files and directories to select (prefix match, `*` and `?`)
    files: Vec<String>,

    /// Exclude files and directories (before renaming)
    #[arg(long = "not", value_name = "PATH")]
    not: Vec<String>,

    /// Rename external files or specify an output prefix
    #[arg(long, value_name = "PATH")]
    to: Vec<String>,

    /// Revert to a version number or UTC date (YYYY[MM[DD[HH[MM[SS]]]]])
    #[arg(long, value_name = "N|DATE")]
    until: Option<String>,

    /// add: re-add unchanged files; extract: overwrite existing files
    #[arg(long, short = 'f')]
    force: bool,

    /// Suppress messages about files smaller than N bytes (no N: all)
    #[arg(long, short = 'q', value_name = "N", num_args = 0..=1, default_missing_value = "max")]
    quiet: Option<String>,

    /// Worker threads (0 = detected core count)
    #[arg(long, short = 't', default_value = "0")]
    threads: usize,

    /// Skip checksums, locator tags, and recovery trailers
    #[arg(long)]
    fragile: bool,

    /// Compression method: 0..6 or an explicit x/s recipe
    #[arg(long, short = 'm', default_value = "1")]
    method: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Add changed files to the archive (alias: a)
    #[command(alias = "a")]
    Add {
        #[command(flatten)]
        common: Common,
    },

    /// Extract the latest (or rolled-back) versions of files (alias: x)
    #[command(alias = "x")]
    Extract {
        #[command(flatten)]
        common: Common,
    },

    /// List contents (alias: l)
    #[command(alias = "l")]
    List {
        #[command(flatten)]
        common: Common,

        /// Show the top N files/directories/types and dedup statistics
        #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "20")]
        summary: Option<usize>,

        /// List from the N'th update, or the last -N updates
        #[arg(long, value_name = "N", allow_hyphen_values = true)]
        since: Option<i64>,

        /// List all stored versions, not only the latest
        #[arg(long)]
        all: bool,
    },

    /// Mark files as deleted in a new version (alias: d)
    #[command(alias = "d")]
    Delete {
        #[command(flatten)]
        common: Common,
    },

    /// Test archive integrity (alias: t)
    #[command(alias = "t")]
    Test {
        #[command(flatten)]
        common: Common,
    },
}

fn build_options(common: &Common) -> Result<Options, Error> {
    let mut opts = Options {
        archive: common.archive.clone(),
        files: common
            .files
            .iter()
            .map(|f| jidac::path::normalize(f))
            .collect(),
        to: common.to.iter().map(|f| jidac::path::normalize(f)).collect(),
        not: common.not.iter().map(|f| jidac::path::normalize(f)).collect(),
        force: common.force,
        fragile: common.fragile,
        method: common.method.clone(),
        ..Options::default()
    };
    if common.threads > 0 {
        opts.threads = common.threads;
    }
    if let Some(until) = &common.until {
        opts.until = date::parse_until(until)?;
    }
    opts.quiet = match common.quiet.as_deref() {
        None => 0,
        Some("max") => MAX_QUIET,
        Some(n) => n
            .parse()
            .map_err(|_| Error::Config(format!("bad --quiet value: {n}")))?,
    };
    Ok(opts)
}

fn run() -> Result<i32, Error> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Add { common } => ops::add(&build_options(common)?, false),
        Commands::Delete { common } => ops::add(&build_options(common)?, true),
        Commands::Extract { common } => ops::extract(&build_options(common)?),
        Commands::Test { common } => ops::test(&build_options(common)?),
        Commands::List {
            common,
            summary,
            since,
            all,
        } => {
            let mut opts = build_options(common)?;
            opts.summary = summary.unwrap_or(0);
            opts.since = since.unwrap_or(0);
            opts.all = *all;
            ops::list(&opts)
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();
    let start = std::time::Instant::now();
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("jidac: {e}");
            1
        }
    };
    log::debug!("finished in {:.3} seconds", start.elapsed().as_secs_f64());
    std::process::exit(code);
}
