//! Input files: the workflow, credentials and trigger data.

use crate::error::RunnerError;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use weaver_core::WorkflowId;
use weaver_integration::{CredentialData, InMemoryCredentialStore};
use weaver_workflow::{WorkflowDefinition, WorkflowGraph};

/// A workflow file: the graph plus optional identity.
///
/// ```json
/// {
///   "name": "fetch and tag",
///   "nodes": [{"id": "start", "type": "trigger.manual"}],
///   "connections": []
/// }
/// ```
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    id: Option<WorkflowId>,
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    graph: WorkflowGraph,
}

fn read(path: &Path) -> Result<String, RunnerError> {
    std::fs::read_to_string(path).map_err(|e| RunnerError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse<T: for<'de> Deserialize<'de>>(path: &Path, raw: &str) -> Result<T, RunnerError> {
    serde_json::from_str(raw).map_err(|e| RunnerError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Reads a workflow file. The name defaults to the file stem.
///
/// # Errors
///
/// Returns an error if the file is unreadable or not a workflow.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition, RunnerError> {
    let file: WorkflowFile = parse(path, &read(path)?)?;
    let name = file.name.unwrap_or_else(|| {
        path.file_stem()
            .map_or_else(|| "workflow".to_string(), |s| s.to_string_lossy().into_owned())
    });
    Ok(match file.id {
        Some(id) => WorkflowDefinition::with_id(id, name, file.graph),
        None => WorkflowDefinition::new(name, file.graph),
    })
}

/// Reads a credentials file: an object of references to credential data.
///
/// ```json
/// {"github": {"type": "bearerToken", "token": "ghp_..."}}
/// ```
///
/// # Errors
///
/// Returns an error if the file is unreadable or an entry is malformed.
/// The message never includes credential values.
pub fn load_credentials(path: &Path) -> Result<InMemoryCredentialStore, RunnerError> {
    let raw = read(path)?;
    let entries: BTreeMap<String, JsonValue> = parse(path, &raw)?;
    let store = InMemoryCredentialStore::new();
    for (reference, value) in entries {
        let data: CredentialData =
            serde_json::from_value(value).map_err(|_| RunnerError::Load {
                path: path.to_path_buf(),
                reason: format!("credential '{reference}' is malformed"),
            })?;
        store.insert(reference, data);
    }
    Ok(store)
}

/// Parses trigger data given inline. Absent data means `null`.
///
/// # Errors
///
/// Returns an error if the text is not JSON.
pub fn parse_trigger_data(raw: Option<&str>) -> Result<JsonValue, RunnerError> {
    raw.map_or(Ok(JsonValue::Null), |raw| {
        serde_json::from_str(raw).map_err(|e| RunnerError::InvalidTriggerData {
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn file_with(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("nightly-sync")
            .suffix(".json")
            .tempfile()
            .expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn loads_a_workflow_file() {
        let file = file_with(
            &json!({
                "nodes": [
                    {"id": "start", "type": "trigger.manual"},
                    {"id": "fetch", "type": "http.request", "parameters": {"url": "https://example.com"}}
                ],
                "connections": [{"sourceNodeId": "start", "targetNodeId": "fetch"}]
            })
            .to_string(),
        );

        let definition = load_workflow(file.path()).expect("load");
        assert!(definition.name().starts_with("nightly-sync"));
        assert_eq!(definition.graph.node_count(), 2);
        assert_eq!(definition.graph.connections.len(), 1);
    }

    #[test]
    fn keeps_a_declared_id_and_name() {
        let id = WorkflowId::new();
        let file = file_with(
            &json!({"id": id, "name": "named", "nodes": [{"id": "a", "type": "noop"}]}).to_string(),
        );
        let definition = load_workflow(file.path()).expect("load");
        assert_eq!(definition.id, id);
        assert_eq!(definition.name(), "named");
    }

    #[test]
    fn unreadable_or_invalid_files_name_the_path() {
        let err = load_workflow(Path::new("/definitely/not/here.json")).expect_err("missing");
        assert!(err.to_string().contains("/definitely/not/here.json"));

        let file = file_with("{ not json");
        let err = load_workflow(file.path()).expect_err("invalid");
        assert!(matches!(err, RunnerError::Load { .. }));
    }

    #[test]
    fn loads_credentials_without_leaking_them() {
        let file = file_with(
            &json!({
                "github": {"type": "bearerToken", "token": "ghp_secret"},
                "broken": {"type": "basicAuth", "username": "only-user-ghp_other"}
            })
            .to_string(),
        );
        let err = load_credentials(file.path()).expect_err("broken entry");
        assert!(err.to_string().contains("credential 'broken' is malformed"));
        assert!(!err.to_string().contains("ghp_"));

        let file = file_with(&json!({"github": {"type": "bearerToken", "token": "t"}}).to_string());
        let store = load_credentials(file.path()).expect("load");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn trigger_data() {
        assert_eq!(parse_trigger_data(None).expect("none"), JsonValue::Null);
        assert_eq!(
            parse_trigger_data(Some(r#"[{"a": 1}]"#)).expect("array"),
            json!([{"a": 1}])
        );
        assert!(parse_trigger_data(Some("{")).is_err());
    }
}
