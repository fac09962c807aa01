use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use layerd_core::{config, DaemonError, OverlaySnapshotter, SnapshotterLifecycle, FATAL_TARGET};

mod cli;
mod logging;
mod shutdown;
mod version;

use cli::Args;
use logging::{LogFormat, LogLevel};
use shutdown::ShutdownCoordinator;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.parse::<LogLevel>() {
        Ok(level) => level,
        Err(e) => {
            report_without_logger(&e, args.log_format);
            return ExitCode::FAILURE;
        }
    };

    if args.version {
        println!("{}", version::line());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = logging::init(level, args.log_format) {
        report_without_logger(&e, args.log_format);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let op = e
                .downcast_ref::<DaemonError>()
                .map_or("bootstrap", DaemonError::operation);
            error!(
                target: FATAL_TARGET,
                severity = "fatal",
                op,
                error = %format!("{e:#}"),
                "layerd failed"
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!(
        version = version::VERSION,
        revision = version::REVISION,
        address = %args.address.display(),
        root = %args.root.display(),
        "layerd starting"
    );

    let config = config::resolve(&args.config)?;

    let lifecycle = SnapshotterLifecycle::<OverlaySnapshotter>::construct(&args.root, &config)?;
    info!(root = %lifecycle.handle().root().display(), "snapshotter configured");

    let interrupt = shutdown::interrupt_signal().context("failed to subscribe to SIGINT")?;

    let listener = layerd_grpc::provision(&args.address)?;
    let _server = layerd_grpc::spawn(listener, lifecycle.handle(), &args.address);

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.run(interrupt, lifecycle).await;
    debug_assert_eq!(coordinator.state(), shutdown::State::Terminating);
    Ok(())
}

/// Emit a fatal record before the global logger exists.
fn report_without_logger(err: &DaemonError, format: LogFormat) {
    let subscriber = logging::subscriber(LogLevel::Fatal, format, std::io::stderr);
    tracing::subscriber::with_default(subscriber, || {
        error!(
            target: FATAL_TARGET,
            severity = "fatal",
            op = err.operation(),
            error = %err,
            "layerd failed"
        );
    });
}
