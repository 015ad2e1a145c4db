//! Nodes that forward their input unchanged.

use async_trait::async_trait;
use weaver_workflow::{
    Item, NodeDescriptor, NodeError, NodeExecutionContext, NodeLogic, OutputByPort,
};

/// Starts a workflow by hand. Emits the trigger data as items.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualTrigger;

#[async_trait]
impl NodeLogic for ManualTrigger {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::trigger("trigger.manual")
    }

    async fn execute(
        &self,
        items: Vec<Item>,
        _ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError> {
        Ok(OutputByPort::main(items))
    }
}

/// Does nothing. Useful as a join point or a placeholder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOp;

#[async_trait]
impl NodeLogic for NoOp {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("noop")
    }

    async fn execute(
        &self,
        items: Vec<Item>,
        _ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError> {
        Ok(OutputByPort::main(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use serde_json::json;
    use weaver_workflow::Node;

    #[test]
    fn trigger_has_no_inputs() {
        let descriptor = ManualTrigger.descriptor();
        assert!(descriptor.inputs.is_empty());
        assert_eq!(descriptor.first_output(), Some("main"));
    }

    #[tokio::test]
    async fn items_pass_through() {
        let items = vec![Item::new(json!({"a": 1})), Item::new(json!({"b": 2}))];
        let ctx = context(Node::new("n", "noop"), items.clone());

        let out = NoOp.execute(items.clone(), &ctx).await.expect("noop");
        assert_eq!(out.get("main"), items.as_slice());

        let out = ManualTrigger.execute(items.clone(), &ctx).await.expect("trigger");
        assert_eq!(out.get("main"), items.as_slice());
    }
}
