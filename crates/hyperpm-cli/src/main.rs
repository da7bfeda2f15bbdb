#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::builder::TypedValueParser;
use clap::Parser;
use hyperpm_core::pkg::DEFAULT_CONCURRENCY;
use hyperpm_core::Config;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hyperpm")]
#[command(author, version, about = "A deterministic npm-compatible package installer", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Install dependencies, optionally adding packages to package.json
    #[command(visible_alias = "i")]
    Install {
        /// Packages to add (e.g. "react", "react@^18", "@types/node@latest")
        names: Vec<String>,

        /// Fail if lockfile is missing or out of date
        #[arg(long)]
        frozen_lockfile: bool,

        /// Skip devDependencies
        #[arg(long)]
        no_dev: bool,

        /// Skip optionalDependencies
        #[arg(long)]
        no_optional: bool,

        /// Maximum packages fetched and linked at once
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY, value_parser = clap::value_parser!(u16).range(1..).map(usize::from))]
        concurrency: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::new(cwd)
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json);

    match cli.command {
        Some(Commands::Version) => commands::version::run(config.json_logs),
        Some(Commands::Install {
            names,
            frozen_lockfile,
            no_dev,
            no_optional,
            concurrency,
        }) => {
            logging::init(config.verbosity, config.json_logs);
            let args = commands::install::InstallArgs {
                names,
                frozen_lockfile,
                include_dev: !no_dev,
                include_optional: !no_optional,
                concurrency,
            };
            commands::install::run(&config, args)
        }
        None => {
            println!("hyperpm: no command given (try --help)");
            Ok(())
        }
    }
}
