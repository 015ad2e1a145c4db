//! The `if` node: routes each item to `true` or `false`.
//!
//! The `condition` parameter is templated per item, so
//! `"{{ json.status == 'open' }}"` yields a boolean directly. Other values
//! are judged by [`is_truthy`]. A port that receives no items is not taken,
//! and everything reachable only through it is skipped.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;
use weaver_workflow::{
    Item, NodeDescriptor, NodeError, NodeExecutionContext, NodeLogic, OutputByPort,
};

pub const TRUE_PORT: &str = "true";
pub const FALSE_PORT: &str = "false";

#[derive(Debug, Default, Clone, Copy)]
pub struct IfNode;

#[async_trait]
impl NodeLogic for IfNode {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("if").with_outputs([TRUE_PORT, FALSE_PORT])
    }

    async fn execute(
        &self,
        items: Vec<Item>,
        ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError> {
        if ctx.node().parameter("condition").is_none() {
            return Err(NodeError::validation("parameter 'condition' is required"));
        }

        let mut out = OutputByPort::new();
        for (index, item) in items.into_iter().enumerate() {
            let condition = ctx.parameter("condition", index)?;
            let port = if is_truthy(&condition) {
                TRUE_PORT
            } else {
                FALSE_PORT
            };
            out.push(port, item);
        }
        debug!(node_id = %ctx.node_id(), ports = ?out.counts(), "condition evaluated");
        Ok(out)
    }
}

/// Truthiness of a resolved condition.
///
/// `null`, `false`, zero, empty collections and the strings `""`, `"0"` and
/// `"false"` (any case) are false. Everything else is true.
#[must_use]
pub fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => {
            let s = s.trim();
            !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false"))
        }
        JsonValue::Array(values) => !values.is_empty(),
        JsonValue::Object(fields) => !fields.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use serde_json::json;
    use weaver_workflow::Node;

    #[test]
    fn truthiness() {
        for falsy in [
            json!(null),
            json!(false),
            json!(0),
            json!(0.0),
            json!(""),
            json!("0"),
            json!("False"),
            json!([]),
            json!({}),
        ] {
            assert!(!is_truthy(&falsy), "{falsy} should be false");
        }
        for truthy in [json!(true), json!(-1), json!("no"), json!([0]), json!({"a": null})] {
            assert!(is_truthy(&truthy), "{truthy} should be true");
        }
    }

    #[tokio::test]
    async fn routes_items_by_condition() {
        let node = Node::new("check", "if")
            .with_parameters(json!({"condition": "{{ json.amount > 10 }}"}));
        let items = vec![
            Item::new(json!({"amount": 5})),
            Item::new(json!({"amount": 50})),
            Item::new(json!({"amount": 7})),
        ];
        let ctx = context(node, items.clone());

        let out = IfNode.execute(items, &ctx).await.expect("if");
        assert_eq!(out.get(TRUE_PORT), &[Item::new(json!({"amount": 50}))]);
        assert_eq!(out.get(FALSE_PORT).len(), 2);
    }

    #[tokio::test]
    async fn untaken_port_is_absent() {
        let node = Node::new("check", "if").with_parameters(json!({"condition": false}));
        let items = vec![Item::empty()];
        let ctx = context(node, items.clone());

        let out = IfNode.execute(items, &ctx).await.expect("if");
        assert_eq!(out.ports().collect::<Vec<_>>(), vec![FALSE_PORT]);
    }

    #[tokio::test]
    async fn missing_condition_is_rejected() {
        let ctx = context(Node::new("check", "if"), vec![Item::empty()]);
        let err = IfNode
            .execute(vec![Item::empty()], &ctx)
            .await
            .expect_err("no condition");
        assert!(err.to_string().contains("'condition' is required"));
    }
}
