//! The `set` node: writes fields onto each item.
//!
//! Parameters:
//! - `values`: object of field paths to values. Paths may be dotted
//!   (`user.name`) to reach into nested objects, which are created as needed.
//!   Values are templated per item.
//! - `keepOnlySet`: when true, each output item holds only the set fields.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use weaver_workflow::{
    Item, NodeDescriptor, NodeError, NodeExecutionContext, NodeLogic, OutputByPort,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct SetNode;

#[async_trait]
impl NodeLogic for SetNode {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("set")
    }

    async fn execute(
        &self,
        items: Vec<Item>,
        ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError> {
        let keep_only_set = match ctx.node().parameter("keepOnlySet") {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(other) => {
                return Err(NodeError::validation(format!(
                    "parameter 'keepOnlySet' must be a boolean, got {other}"
                )));
            }
        };

        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let values = match ctx.parameter("values", index)? {
                JsonValue::Object(values) => values,
                JsonValue::Null => Map::new(),
                other => {
                    return Err(NodeError::validation(format!(
                        "parameter 'values' must be an object, got {other}"
                    )));
                }
            };

            let mut fields = if keep_only_set {
                Map::new()
            } else {
                into_object(item.data)
            };
            for (path, value) in values {
                set_path(&mut fields, &path, value)?;
            }
            out.push(Item::new(JsonValue::Object(fields)));
        }
        Ok(OutputByPort::main(out))
    }
}

/// Item data as an object; scalars and arrays are kept under `value`.
fn into_object(data: JsonValue) -> Map<String, JsonValue> {
    match data {
        JsonValue::Object(fields) => fields,
        JsonValue::Null => Map::new(),
        other => Map::from_iter([("value".to_string(), other)]),
    }
}

fn set_path(
    fields: &mut Map<String, JsonValue>,
    path: &str,
    value: JsonValue,
) -> Result<(), NodeError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(NodeError::validation(format!("invalid field path '{path}'")));
    }
    let Some((last, parents)) = segments.split_last() else {
        return Err(NodeError::validation("field path is empty"));
    };

    let mut current = fields;
    for segment in parents {
        let slot = current
            .entry((*segment).to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if !slot.is_object() {
            *slot = JsonValue::Object(Map::new());
        }
        let JsonValue::Object(next) = slot else {
            return Err(NodeError::validation(format!("cannot set field path '{path}'")));
        };
        current = next;
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use serde_json::json;
    use weaver_workflow::Node;

    async fn run(parameters: JsonValue, items: Vec<JsonValue>) -> Result<Vec<JsonValue>, NodeError> {
        let items: Vec<Item> = items.into_iter().map(Item::new).collect();
        let ctx = context(Node::new("s", "set").with_parameters(parameters), items.clone());
        let out = SetNode.execute(items, &ctx).await?;
        Ok(out.get("main").iter().map(|i| i.data.clone()).collect())
    }

    #[tokio::test]
    async fn merges_templated_values() {
        let out = run(
            json!({"values": {"greeting": "hello {{ json.name }}", "index": "{{ itemIndex }}"}}),
            vec![json!({"name": "ada"}), json!({"name": "bob"})],
        )
        .await
        .expect("set");
        assert_eq!(
            out,
            vec![
                json!({"name": "ada", "greeting": "hello ada", "index": 0}),
                json!({"name": "bob", "greeting": "hello bob", "index": 1}),
            ]
        );
    }

    #[tokio::test]
    async fn dotted_paths_create_objects() {
        let out = run(
            json!({"values": {"user.profile.id": 7}}),
            vec![json!({"user": "replaced"})],
        )
        .await
        .expect("set");
        assert_eq!(out, vec![json!({"user": {"profile": {"id": 7}}})]);
    }

    #[tokio::test]
    async fn keep_only_set_drops_input_fields() {
        let out = run(
            json!({"keepOnlySet": true, "values": {"kept": "{{ json.a }}"}}),
            vec![json!({"a": 1, "b": 2})],
        )
        .await
        .expect("set");
        assert_eq!(out, vec![json!({"kept": 1})]);
    }

    #[tokio::test]
    async fn scalar_items_are_wrapped() {
        let out = run(json!({"values": {"x": true}}), vec![json!(5)])
            .await
            .expect("set");
        assert_eq!(out, vec![json!({"value": 5, "x": true})]);
    }

    #[tokio::test]
    async fn bad_parameters_are_validation_errors() {
        let err = run(json!({"values": [1, 2]}), vec![json!({})])
            .await
            .expect_err("array values");
        assert!(err.to_string().contains("must be an object"));

        let err = run(json!({"values": {"a..b": 1}}), vec![json!({})])
            .await
            .expect_err("bad path");
        assert!(matches!(err, NodeError::Validation { .. }));
    }
}
