//! Runs one workflow file to completion.

use crate::cli::Cli;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::load::{load_credentials, load_workflow, parse_trigger_data};
use async_trait::async_trait;
use rootcause::prelude::{Report, ResultExt};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use weaver_integration::InMemoryCredentialStore;
use weaver_nodes::register_builtin;
use weaver_workflow::{
    Execution, ExecutionEngine, ExecutionSink, InMemoryWorkflowSource, NatsExecutionSink,
    NodeRegistry, NodeSnapshot, NoopSink, SinkError, forward_events,
};

/// How long to wait for the final record to reach the sink before exiting.
const SINK_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Flags when a terminal execution record has been written.
struct TrackedSink {
    inner: Arc<dyn ExecutionSink>,
    finished: watch::Sender<bool>,
}

#[async_trait]
impl ExecutionSink for TrackedSink {
    async fn record_node(&self, snapshot: &NodeSnapshot) -> Result<(), SinkError> {
        self.inner.record_node(snapshot).await
    }

    async fn record_execution(&self, execution: &Execution) -> Result<(), SinkError> {
        self.inner.record_execution(execution).await?;
        if execution.is_terminal() {
            self.finished.send_replace(true);
        }
        Ok(())
    }
}

/// Loads everything `cli` points at, runs the workflow and writes one JSON
/// line per lifecycle event to `out`, followed by the final execution.
///
/// `shutdown` resolving cancels the execution; the run then continues until
/// the engine reports it cancelled.
///
/// # Errors
///
/// Fails when an input cannot be loaded or the engine rejects the workflow.
/// A workflow that runs and fails is not an error; check the returned
/// execution's status.
pub async fn run<W, S>(
    cli: &Cli,
    mut out: W,
    shutdown: S,
) -> Result<Execution, Report<RunnerError>>
where
    W: Write,
    S: Future<Output = ()>,
{
    let config = match &cli.config {
        Some(path) => RunnerConfig::from_file_and_env(path)?,
        None => RunnerConfig::from_env()?,
    };
    let definition = load_workflow(&cli.workflow)?;
    let trigger_data = parse_trigger_data(cli.data.as_deref())?;
    let credentials = match &cli.credentials {
        Some(path) => load_credentials(path)?,
        None => InMemoryCredentialStore::new(),
    };

    let registry = NodeRegistry::new();
    register_builtin(&registry).context(RunnerError::Registry)?;

    let nats = match &config.nats {
        Some(nats) => Some(NatsExecutionSink::connect(nats).await.map_err(|e| {
            RunnerError::Sink {
                reason: e.to_string(),
            }
        })?),
        None => None,
    };
    let inner: Arc<dyn ExecutionSink> = match &nats {
        Some(sink) => Arc::new(sink.clone()),
        None => Arc::new(NoopSink),
    };
    let (finished, mut flushed) = watch::channel(false);

    let workflows = Arc::new(InMemoryWorkflowSource::new());
    let workflow_id = workflows.insert(definition);
    let engine = ExecutionEngine::builder()
        .workflow_source(workflows)
        .node_provider(Arc::new(registry))
        .credential_store(Arc::new(credentials))
        .sink(Arc::new(TrackedSink { inner, finished }))
        .config(config.engine)
        .build();
    if let Some(sink) = &nats {
        let _forwarder = forward_events(sink.context().clone(), engine.subscribe());
    }

    let mut events = engine.subscribe();
    let execution_id = engine
        .submit(workflow_id, trigger_data)
        .await
        .context(RunnerError::Execution)?;
    info!(%execution_id, %workflow_id, "workflow started");

    tokio::pin!(shutdown);
    let mut cancelled = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.execution_id == execution_id => {
                    if !cli.quiet {
                        write_line(&mut out, &event)?;
                    }
                    if event.kind.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            () = &mut shutdown, if !cancelled => {
                warn!(%execution_id, "interrupted, cancelling execution");
                engine.cancel(execution_id).context(RunnerError::Execution)?;
                cancelled = true;
            }
        }
    }

    let execution = engine
        .wait(execution_id)
        .await
        .context(RunnerError::Execution)?;
    write_line(&mut out, &execution)?;

    if nats.is_some()
        && tokio::time::timeout(SINK_FLUSH_TIMEOUT, flushed.wait_for(|done| *done))
            .await
            .is_err()
    {
        warn!(%execution_id, "final execution record was not persisted in time");
    }
    info!(%execution_id, status = ?execution.status, "workflow finished");
    Ok(execution)
}

fn write_line<W: Write, T: serde::Serialize>(out: &mut W, value: &T) -> Result<(), RunnerError> {
    let line = serde_json::to_string(value).map_err(|e| RunnerError::Output {
        reason: e.to_string(),
    })?;
    writeln!(out, "{line}").map_err(|e| RunnerError::Output {
        reason: e.to_string(),
    })
}
