mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vericode-cli")]
#[command(about = "Vericode CLI - Submit code for analysis and inspect reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a Python submission for analysis
    Submit {
        /// Assignment the submission belongs to
        #[arg(short, long)]
        assignment: String,

        /// Author of the submission
        #[arg(long)]
        author: String,

        /// Path to the Python source file
        #[arg(short, long)]
        source: PathBuf,

        /// Path to a test spec file (one `input -> expected` per line)
        #[arg(short, long)]
        tests: Option<PathBuf>,

        /// Path to the expected program output (recorded, not compared)
        #[arg(short, long)]
        expected: Option<PathBuf>,
    },

    /// Show the analysis report of a job
    Report {
        /// Job id printed by `submit`
        job_id: String,

        /// Print the raw JSON record
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// List the committed submissions of an assignment
    Corpus {
        /// Assignment id
        #[arg(short, long)]
        assignment: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            assignment,
            author,
            source,
            tests,
            expected,
        } => {
            commands::submit(
                &assignment,
                &author,
                &source,
                tests.as_deref(),
                expected.as_deref(),
            )
            .await?;
        }
        Commands::Report { job_id, json } => {
            commands::show_report(&job_id, json).await?;
        }
        Commands::Corpus { assignment } => {
            commands::list_corpus(&assignment).await?;
        }
    }

    Ok(())
}
