//! The `wait` node: pauses before passing its items on.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;
use weaver_workflow::{
    Item, NodeDescriptor, NodeError, NodeExecutionContext, NodeLogic, OutputByPort,
};

/// Sleeps for `amountMs` milliseconds, then forwards its input.
///
/// The sleep ends early with a cancellation error when the execution is
/// cancelled. The node's own timeout still applies, so long waits need a
/// matching `timeoutMs` setting.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitNode;

#[async_trait]
impl NodeLogic for WaitNode {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("wait")
    }

    async fn execute(
        &self,
        items: Vec<Item>,
        ctx: &NodeExecutionContext,
    ) -> Result<OutputByPort, NodeError> {
        let amount = match ctx.parameter("amountMs", 0)? {
            JsonValue::Null => 0,
            JsonValue::Number(n) => n.as_u64().ok_or_else(|| {
                NodeError::validation(format!(
                    "parameter 'amountMs' must be a non-negative integer, got {n}"
                ))
            })?,
            other => {
                return Err(NodeError::validation(format!(
                    "parameter 'amountMs' must be a number, got {other}"
                )));
            }
        };

        tokio::select! {
            () = ctx.cancellation().cancelled() => Err(NodeError::Cancelled {
                reason: "execution cancelled while waiting".to_string(),
            }),
            () = tokio::time::sleep(Duration::from_millis(amount)) => Ok(OutputByPort::main(items)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, context_with, gateway};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;
    use weaver_workflow::Node;

    fn waiting(amount: JsonValue) -> Node {
        Node::new("pause", "wait").with_parameters(json!({ "amountMs": amount }))
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_then_forwards() {
        let items = vec![Item::new(json!({"id": 1}))];
        let ctx = context(waiting(json!(250)), items.clone());

        let started = Instant::now();
        let out = WaitNode.execute(items.clone(), &ctx).await.expect("wait");
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(out.get("main"), items.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_the_wait_short() {
        let cancel = CancellationToken::new();
        let ctx = context_with(
            waiting(json!(60_000)),
            vec![Item::empty()],
            &gateway(Arc::default()),
            cancel.clone(),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let err = WaitNode
            .execute(vec![Item::empty()], &ctx)
            .await
            .expect_err("cancelled");
        canceller.await.expect("canceller");

        assert!(matches!(err, NodeError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rejects_negative_amounts() {
        let ctx = context(waiting(json!(-5)), vec![Item::empty()]);
        let err = WaitNode
            .execute(vec![Item::empty()], &ctx)
            .await
            .expect_err("negative");
        assert!(err.to_string().contains("non-negative"));
    }
}
