//! Ore command-line interface
//!
//! Thin shell over the engine: `lock` resolves the manifest into a lock,
//! `install` materializes the lock into the vendor tree.

use clap::{Parser, Subcommand};
use std::process;

mod commands;

#[derive(Parser)]
#[command(name = "ore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A Ruby gem package manager engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the manifest and write the lock
    Lock {
        /// Path to the manifest (defaults to gems.rb or Gemfile)
        #[arg(long, env = "ORE_GEMFILE")]
        gemfile: Option<String>,

        /// Re-resolve only these gems, keeping everything else pinned
        #[arg(long, value_delimiter = ',')]
        update: Vec<String>,

        /// Allow prerelease versions for all gems
        #[arg(long)]
        pre: bool,

        /// Print the lock to stdout instead of writing it
        #[arg(long)]
        print: bool,
    },

    /// Download and install the locked gems
    Install {
        /// Path to the manifest (defaults to gems.rb or Gemfile)
        #[arg(long, env = "ORE_GEMFILE")]
        gemfile: Option<String>,

        /// Groups to exclude from installation
        #[arg(long, value_delimiter = ',')]
        without: Vec<String>,

        /// Remove and rebuild already-installed gems
        #[arg(long)]
        force: bool,

        /// Number of concurrent workers (defaults to the CPU count)
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Enable verbose output
        #[arg(long)]
        verbose: bool,
    },
}

fn display_error(err: &anyhow::Error) {
    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(err) = source {
        eprintln!("caused by: {err}");
        source = err.source();
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Lock {
            gemfile,
            update,
            pre,
            print,
        } => {
            commands::lock::run(commands::lock::LockOptions {
                gemfile,
                update,
                pre,
                print,
            })
            .await
        }
        Commands::Install {
            gemfile,
            without,
            force,
            jobs,
            verbose,
        } => {
            commands::install::run(commands::install::InstallOptions {
                gemfile,
                without,
                force,
                jobs,
                verbose,
            })
            .await
        }
    };

    if let Err(err) = result {
        display_error(&err);
        process::exit(1);
    }
}
