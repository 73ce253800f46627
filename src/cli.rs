use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crawlhub", about = "Hosted web-crawl service")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API surface only
    Serve,
    /// Run the job-leasing worker loop only
    Worker,
    /// Run both the API surface and the worker loop in one process
    Run,
    /// Apply pending database migrations and exit
    Migrate,
}
