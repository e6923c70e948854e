use std::process::ExitCode;

use clap::{error::ErrorKind, Parser as _};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use droidian_encryption_service::{cli::HelperArgs, fs, helper};

fn main() -> ExitCode {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Exit code 2 is reserved for activation failures (the boot machinery
    // re-prompts on it), so argument errors must not go through clap's
    // default exit.
    let args = match HelperArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    fs::set_verbose(tracing::enabled!(
        target: "droidian_encryption_service",
        tracing::Level::DEBUG
    ));

    helper::run(&args)
}
