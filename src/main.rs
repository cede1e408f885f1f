use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use roboclaw_arm_runtime::config::{Cli, RuntimeConfig};

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    // a bad address or ratio must stop us before any motor is touched
    let config = match RuntimeConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = roboclaw_arm_runtime::runtime::run(config).await {
        error!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
