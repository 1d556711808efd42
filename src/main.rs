// reward_joiner - main.rs
// Examples go to stdout (or --output), logs go to stderr.

use clap::Parser;
use reward_joiner::cli::{dispatch, Cli};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    dispatch(Cli::parse())
}
