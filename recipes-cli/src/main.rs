//! recipes CLI: entry point for the candle training recipes.
//!
//! `recipes charnn` trains or samples the character-level GPT;
//! `recipes doc-cls` loads the document-classification datamodule.

mod commands;
mod logging;

use clap::Parser;
use std::path::PathBuf;

/// Paved-path training recipes built on candle
#[derive(Parser, Debug)]
#[command(name = "recipes", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train the character-level GPT or generate text with it
    Charnn {
        /// Configuration file (defaults to ./charnn.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override a configuration value, e.g. --set trainer.max_epochs=3
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
    /// Load the document-classification data and print the first train batch
    DocCls {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override a configuration value, e.g. --set batch_size=8
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
    },
}

impl Cli {
    fn filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

// No #[tokio::main]: launch defaults go into the process environment
// before the runtime starts any threads.
fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let filter = cli.filter();
    match cli.command {
        Commands::Charnn { config, overrides } => commands::charnn(config, &overrides, filter),
        Commands::DocCls { config, overrides } => commands::doc_cls(&config, &overrides, filter),
    }
}
