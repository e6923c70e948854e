use std::sync::Arc;

use anyhow::Result;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use droidian_encryption_service::{build, cli::ServiceArgs, config::Config, service::Daemon};

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let _args = ServiceArgs::parse();

    tracing::info!(
        "droidian-encryption-service version: v{}  buildtime: {}",
        build::PKG_VERSION,
        build::BUILD_TIME
    );

    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("Service must run with root privileges");
    }

    droidian_encryption_service::fs::set_verbose(tracing::enabled!(
        target: "droidian_encryption_service",
        tracing::Level::DEBUG
    ));

    let config = Arc::new(Config::load());
    let daemon = Daemon::connect(config).await?;

    daemon.run().await
}
