//! CLI argument parsing for the haulplan-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "haulplan-worker", about = "Route planning and versioning worker for transport loads")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Plan a single load offline and print the generated version as JSON
    Plan {
        /// JSON file with the load, constraints and optional departure
        #[arg(long)]
        input: PathBuf,
    },
}
