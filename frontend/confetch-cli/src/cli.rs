use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "confetch", about = "Confetch configuration CLI")]
pub struct Cli {
    /// Remote API token.
    #[arg(long, env = "CONFETCH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Remote API base URL.
    #[arg(long, env = "CONFETCH_API_URL")]
    pub api_url: Option<String>,

    #[arg(long, env = "CONFETCH_PROJECT")]
    pub project: Option<String>,

    #[arg(long, env = "CONFETCH_ENVIRONMENT")]
    pub environment: Option<String>,

    /// Local JSON fallback file.
    #[arg(long, env = "CONFETCH_FALLBACK_PATH")]
    pub fallback: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Fetch the flat config for the scope and print it as JSON.
    Fetch,
    /// Fetch the flat config and write it to the fallback file.
    Snapshot,
    /// Poll the source and print keys that changed between polls.
    Watch {
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
    /// Verify that the configured source is reachable.
    Check,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
