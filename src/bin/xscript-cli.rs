//! xscript CLI - run scripts on an in-process cluster
//!
//! `run` evaluates a script on the root node of a cluster and prints the
//! values of its last form; `check` only parses it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use xscript::script::parse_program;
use xscript::{Cluster, NodeConfig};

#[derive(Parser)]
#[command(name = "xscript")]
#[command(about = "Run scripts with futures, dataflow and replicated functions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a script on the root node
    Run {
        /// Script file
        file: PathBuf,

        /// Number of nodes in the cluster
        #[arg(short, long, default_value = "1")]
        nodes: usize,

        /// Node configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Parse a script and list the functions it defines
    Check {
        /// Script file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            nodes,
            config,
        } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };

            let cluster = Cluster::new(nodes, config)?;
            let values = cluster
                .root()
                .eval(&source)
                .with_context(|| format!("Script {} failed", file.display()))?;

            for value in values {
                println!("{}", value);
            }
        }

        Commands::Check { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let program = parse_program(&source)
                .map_err(|e| anyhow::anyhow!("{}: {}", file.display(), e))?;

            println!("{}: {} forms", file.display(), program.forms.len());
            for name in program.defined_names() {
                println!("  {}", name);
            }
        }
    }

    Ok(())
}
