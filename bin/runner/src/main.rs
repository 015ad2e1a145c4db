use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weaver_runner::Cli;
use weaver_workflow::ExecutionStatus;

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the JSON event stream.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for interrupts");
            std::future::pending::<()>().await;
        }
    };

    match weaver_runner::run(&cli, std::io::stdout().lock(), interrupted).await {
        Ok(execution) => match execution.status {
            ExecutionStatus::Completed => ExitCode::SUCCESS,
            ExecutionStatus::Cancelled => ExitCode::from(130),
            _ => ExitCode::from(1),
        },
        Err(report) => {
            tracing::error!("{report}");
            ExitCode::from(2)
        }
    }
}
