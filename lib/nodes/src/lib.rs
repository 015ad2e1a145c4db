//! Built-in node types.
//!
//! | Type             | Inputs | Outputs          |
//! |------------------|--------|------------------|
//! | `trigger.manual` | none   | `main`           |
//! | `http.request`   | `main` | `main`           |
//! | `set`            | `main` | `main`           |
//! | `if`             | `main` | `true`, `false`  |
//! | `wait`           | `main` | `main`           |
//! | `noop`           | `main` | `main`           |
//!
//! [`register_builtin`] adds all of them to a [`NodeRegistry`].

pub mod branch;
pub mod http;
pub mod passthrough;
pub mod set;
pub mod wait;

pub use branch::{IfNode, is_truthy};
pub use http::HttpRequestNode;
pub use passthrough::{ManualTrigger, NoOp};
pub use set::SetNode;
pub use wait::WaitNode;

use rootcause::prelude::Report;
use std::sync::Arc;
use weaver_workflow::{NodeLogic, NodeRegistry, RegistrationError};

/// One instance of every built-in node type.
#[must_use]
pub fn builtin_nodes() -> Vec<Arc<dyn NodeLogic>> {
    vec![
        Arc::new(ManualTrigger),
        Arc::new(HttpRequestNode),
        Arc::new(SetNode),
        Arc::new(IfNode),
        Arc::new(WaitNode),
        Arc::new(NoOp),
    ]
}

/// Registers every built-in node type.
///
/// # Errors
///
/// Fails if any of the type names is already registered.
pub fn register_builtin(registry: &NodeRegistry) -> Result<(), Report<RegistrationError>> {
    for logic in builtin_nodes() {
        registry.register(logic)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::net::IpAddr;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;
    use weaver_core::{ExecutionId, WorkflowId};
    use weaver_integration::{
        CredentialData, Enforcer, HostResolver, HttpError, HttpGateway, HttpResponse,
        HttpTransport, InMemoryCredentialStore, PreparedRequest, ResourceLimits, SecurityPolicy,
    };
    use weaver_workflow::{Item, Node, NodeExecutionContext, ParameterResolver, RuntimeServices};

    /// Resolves `api.example.com` to a public address and nothing else.
    pub(crate) struct StaticResolver;

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<IpAddr>, HttpError> {
            let hosts: HashMap<&str, &str> = HashMap::from([("api.example.com", "93.184.216.34")]);
            Ok(hosts
                .get(host)
                .and_then(|ip| ip.parse().ok())
                .into_iter()
                .collect())
        }
    }

    /// Replays canned responses, then answers `200 {}`.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        responses: Mutex<VecDeque<HttpResponse>>,
        pub(crate) sent: Mutex<Vec<PreparedRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn replying(responses: impl IntoIterator<Item = HttpResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                sent: Mutex::default(),
            })
        }

        pub(crate) fn sent(&self) -> Vec<PreparedRequest> {
            self.sent.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: PreparedRequest) -> Result<HttpResponse, HttpError> {
            self.sent.lock().expect("lock").push(request);
            Ok(self
                .responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| HttpResponse::new(200, "{}")))
        }
    }

    pub(crate) fn gateway(transport: Arc<ScriptedTransport>) -> HttpGateway {
        HttpGateway::with_transport(
            Enforcer::new(SecurityPolicy::default(), ResourceLimits::default()),
            Arc::new(StaticResolver),
            transport,
        )
    }

    pub(crate) fn context_with(
        node: Node,
        items: Vec<Item>,
        gateway: &HttpGateway,
        cancel: CancellationToken,
    ) -> NodeExecutionContext {
        let credentials = InMemoryCredentialStore::new();
        credentials.insert("api-token", CredentialData::bearer("s3cret"));
        NodeExecutionContext::new(
            ExecutionId::new(),
            WorkflowId::new(),
            node,
            1,
            items.into(),
            RuntimeServices {
                resolver: Arc::new(ParameterResolver::new()),
                credentials: Arc::new(credentials),
                http: gateway.scoped(cancel),
            },
        )
    }

    pub(crate) fn context(node: Node, items: Vec<Item>) -> NodeExecutionContext {
        context_with(
            node,
            items,
            &gateway(Arc::new(ScriptedTransport::default())),
            CancellationToken::new(),
        )
    }
}
