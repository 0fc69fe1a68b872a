use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use anthropic_oauth_proxy::cli::{self, Cli};
use anthropic_oauth_proxy::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings, cli.debug);

    cli::run(cli, settings).await
}

/// `--debug` wins, then `RUST_LOG`, then the configured level.
fn init_tracing(settings: &Settings, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&settings.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
