//! Command-line arguments.

use clap::Parser;
use std::path::PathBuf;

/// Run a workflow file through the weaver engine.
///
/// Lifecycle events are printed to stdout as JSON lines, followed by the
/// final execution record. The exit code is 0 when the execution completed,
/// 1 when it failed, 130 when it was interrupted and 2 when it could not run.
#[derive(Debug, Clone, Parser)]
#[command(name = "weaver-runner", version)]
pub struct Cli {
    /// Workflow JSON file.
    pub workflow: PathBuf,

    /// Trigger data as JSON. An array starts one item per element.
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Credentials JSON file, keyed by credential reference.
    #[arg(long, env = "WEAVER_CREDENTIALS_FILE")]
    pub credentials: Option<PathBuf>,

    /// Configuration file. `WEAVER__*` environment variables override it.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Print only the final execution record.
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "weaver-runner",
            "flow.json",
            "--data",
            r#"{"a": 1}"#,
            "-q",
        ])
        .expect("parse");
        assert_eq!(cli.workflow, PathBuf::from("flow.json"));
        assert_eq!(cli.data.as_deref(), Some(r#"{"a": 1}"#));
        assert!(cli.quiet);
        assert!(cli.config.is_none());
    }
}
