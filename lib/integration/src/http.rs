//! The outbound HTTP helper.
//!
//! Node logic never talks to the network directly. It gets an [`HttpClient`]
//! scoped to its execution, and every request goes through the same steps:
//!
//! 1. `Enforcer::check_url` on the raw URL
//! 2. request body ceiling
//! 3. host resolution by the helper itself
//! 4. `Enforcer::check_resolved` on every address
//! 5. a per-execution outbound permit
//! 6. the transport, pinned to the validated addresses with redirects off
//!
//! Pinning the connection to the addresses that passed step 4 closes the
//! DNS rebinding window between validation and connect.

use crate::error::{HttpError, NetworkErrorKind};
use crate::security::{Enforcer, SecurityViolation, TargetUrl};
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A request as node logic builds it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Adds a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a raw body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a JSON body and content type.
    #[must_use]
    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(value.to_string())
    }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response. Mostly useful for scripted transports.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// True for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with the given name, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body decoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns the decode error when the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// A request that passed every check and is ready to go on the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Host name and the validated addresses the connection must use.
    /// `None` when the URL host is already an IP literal.
    pub pinned: Option<(String, Vec<SocketAddr>)>,
    pub timeout: Duration,
    pub max_response_bytes: u64,
}

/// Sends prepared requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Performs the request and buffers the response body.
    ///
    /// Implementations must honour `pinned`, must not follow redirects and
    /// must stop reading once the body crosses `max_response_bytes`.
    async fn send(&self, request: PreparedRequest) -> Result<HttpResponse, HttpError>;
}

/// Resolves host names to addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolves `host`.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, HttpError>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<IpAddr>, HttpError> {
        let addrs = tokio::net::lookup_host((host, port)).await.map_err(|e| {
            HttpError::network(NetworkErrorKind::Dns, format!("failed to resolve {host}: {e}"))
        })?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    user_agent: String,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self {
            user_agent: format!("weaver/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ReqwestTransport {
    /// Creates a transport with the default user agent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<HttpResponse, HttpError> {
        let host = request.url.host_str().unwrap_or_default().to_string();

        // One client per request: the pinned resolution is a client setting.
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request.timeout)
            .user_agent(self.user_agent.clone());
        if let Some((name, addrs)) = &request.pinned {
            builder = builder.resolve_to_addrs(name, addrs);
        }
        let client = builder.build().map_err(|e| HttpError::InvalidRequest {
            reason: e.to_string(),
        })?;

        let mut outbound = client.request(request.method, request.url);
        for (name, value) in request.headers {
            outbound = outbound.header(name, value);
        }
        if let Some(body) = request.body {
            outbound = outbound.body(body);
        }

        let mut response = outbound.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let limit = request.max_response_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(SecurityViolation::payload_too_large(host, "response", limit).into());
        }
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_reqwest_error)? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(SecurityViolation::payload_too_large(host, "response", limit).into());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> HttpError {
    if err.is_builder() {
        return HttpError::InvalidRequest {
            reason: err.to_string(),
        };
    }
    let kind = if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else {
        classify_source_chain(&err)
    };
    HttpError::network(kind, err.to_string())
}

fn classify_source_chain(err: &(dyn std::error::Error + 'static)) -> NetworkErrorKind {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                _ => {}
            }
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            return NetworkErrorKind::Tls;
        }
        if text.contains("dns") || text.contains("resolve") {
            return NetworkErrorKind::Dns;
        }
        source = cause.source();
    }
    NetworkErrorKind::Connection
}

/// Shared outbound gateway. One per engine.
#[derive(Clone)]
pub struct HttpGateway {
    enforcer: Arc<Enforcer>,
    resolver: Arc<dyn HostResolver>,
    transport: Arc<dyn HttpTransport>,
}

impl HttpGateway {
    /// Creates a gateway using the system resolver and `reqwest`.
    #[must_use]
    pub fn new(enforcer: Enforcer) -> Self {
        Self::with_transport(
            enforcer,
            Arc::new(SystemResolver),
            Arc::new(ReqwestTransport::new()),
        )
    }

    /// Creates a gateway with explicit resolver and transport.
    #[must_use]
    pub fn with_transport(
        enforcer: Enforcer,
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            enforcer: Arc::new(enforcer),
            resolver,
            transport,
        }
    }

    /// The enforcer guarding this gateway.
    #[must_use]
    pub fn enforcer(&self) -> &Enforcer {
        &self.enforcer
    }

    /// Creates a client for one execution.
    ///
    /// The client shares the execution's outbound permits and aborts pending
    /// requests when `cancel` fires.
    #[must_use]
    pub fn scoped(&self, cancel: CancellationToken) -> HttpClient {
        let permits = match self.enforcer.limits().max_outbound_per_execution {
            0 => Semaphore::MAX_PERMITS,
            limit => limit,
        };
        HttpClient {
            gateway: self.clone(),
            permits: Arc::new(Semaphore::new(permits)),
            cancel,
        }
    }
}

impl Default for HttpGateway {
    fn default() -> Self {
        Self::new(Enforcer::default())
    }
}

/// Per-execution HTTP client handed to node logic.
#[derive(Clone)]
pub struct HttpClient {
    gateway: HttpGateway,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl HttpClient {
    /// Sends a request through the enforcer.
    ///
    /// # Errors
    ///
    /// - `Security` when the target, its addresses or a body is rejected
    /// - `Network` for transport failures, including the request timeout
    /// - `Cancelled` when the execution is cancelled first
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let enforcer = self.gateway.enforcer();
        let target = enforcer.check_url(&request.url)?;
        if let Some(body) = &request.body {
            enforcer.check_request_size(&target, body.len())?;
        }

        let addrs = match target.literal {
            Some(ip) => vec![ip],
            None => self.resolve(&target).await?,
        };
        enforcer.check_resolved(&target, &addrs)?;

        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(HttpError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| HttpError::Cancelled)?,
        };

        let limits = enforcer.limits();
        let timeout = limits.request_timeout();
        let pinned = target.literal.is_none().then(|| {
            let sockets = addrs
                .iter()
                .map(|ip| SocketAddr::new(*ip, target.port))
                .collect();
            (target.host.clone(), sockets)
        });
        debug!(method = %request.method, host = %target.host, "sending outbound request");
        let prepared = PreparedRequest {
            method: request.method,
            url: target.url,
            headers: request.headers,
            body: request.body,
            pinned,
            timeout,
            max_response_bytes: limits.max_response_bytes,
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(HttpError::Cancelled),
            result = tokio::time::timeout(timeout, self.gateway.transport.send(prepared)) => {
                result.unwrap_or_else(|_| {
                    Err(HttpError::network(
                        NetworkErrorKind::Timeout,
                        format!("request to {} timed out after {}ms", target.host, timeout.as_millis()),
                    ))
                })
            }
        }
    }

    async fn resolve(&self, target: &TargetUrl) -> Result<Vec<IpAddr>, HttpError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(HttpError::Cancelled),
            addrs = self.gateway.resolver.resolve(&target.host, target.port) => addrs,
        }
    }

    /// The cancellation token this client observes.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;
    use crate::security::{SecurityErrorKind, SecurityPolicy};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StaticResolver {
        hosts: HashMap<String, Vec<IpAddr>>,
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> Result<Vec<IpAddr>, HttpError> {
            Ok(self.hosts.get(host).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<PreparedRequest>>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: PreparedRequest) -> Result<HttpResponse, HttpError> {
            self.sent.lock().expect("lock").push(request);
            Ok(HttpResponse::new(200, r#"{"ok":true}"#))
        }
    }

    struct SlowTransport;

    #[async_trait]
    impl HttpTransport for SlowTransport {
        async fn send(&self, _request: PreparedRequest) -> Result<HttpResponse, HttpError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(HttpResponse::new(200, Vec::new()))
        }
    }

    fn resolver() -> Arc<StaticResolver> {
        let mut hosts = HashMap::new();
        hosts.insert(
            "api.example.com".to_string(),
            vec!["93.184.216.34".parse().expect("ip")],
        );
        hosts.insert(
            "rebind.example.com".to_string(),
            vec!["10.0.0.8".parse().expect("ip")],
        );
        Arc::new(StaticResolver { hosts })
    }

    fn gateway(transport: Arc<dyn HttpTransport>, limits: ResourceLimits) -> HttpGateway {
        HttpGateway::with_transport(
            Enforcer::new(SecurityPolicy::default(), limits),
            resolver(),
            transport,
        )
    }

    #[tokio::test]
    async fn pins_validated_addresses() {
        let transport = Arc::new(RecordingTransport::default());
        let client = gateway(transport.clone(), ResourceLimits::default())
            .scoped(CancellationToken::new());

        let response = client
            .send(HttpRequest::get("https://api.example.com/v1/items"))
            .await
            .expect("sent");
        assert!(response.is_success());
        let body: serde_json::Value = response.json().expect("json");
        assert_eq!(body["ok"], true);

        let sent = transport.sent.lock().expect("lock");
        let (host, addrs) = sent[0].pinned.clone().expect("pinned");
        assert_eq!(host, "api.example.com");
        assert_eq!(addrs, vec!["93.184.216.34:443".parse::<SocketAddr>().expect("addr")]);
    }

    #[tokio::test]
    async fn fully_qualified_hosts_are_pinned_under_the_url_host() {
        let transport = Arc::new(RecordingTransport::default());
        let client = gateway(transport.clone(), ResourceLimits::default())
            .scoped(CancellationToken::new());

        client
            .send(HttpRequest::get("https://api.example.com./v1"))
            .await
            .expect("sent");
        let sent = transport.sent.lock().expect("lock");
        let (host, _) = sent[0].pinned.clone().expect("pinned");
        assert_eq!(sent[0].url.host_str(), Some(host.as_str()));
    }

    #[test]
    fn outbound_limit_of_zero_is_unlimited() {
        let scoped = |limit| {
            gateway(
                Arc::new(RecordingTransport::default()),
                ResourceLimits {
                    max_outbound_per_execution: limit,
                    ..ResourceLimits::default()
                },
            )
            .scoped(CancellationToken::new())
        };
        assert_eq!(scoped(3).permits.available_permits(), 3);
        assert_eq!(scoped(0).permits.available_permits(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn rejects_hosts_resolving_to_private_addresses() {
        let transport = Arc::new(RecordingTransport::default());
        let client = gateway(transport.clone(), ResourceLimits::default())
            .scoped(CancellationToken::new());

        let err = client
            .send(HttpRequest::get("http://rebind.example.com/"))
            .await
            .expect_err("blocked");
        match err {
            HttpError::Security(v) => assert_eq!(v.kind, SecurityErrorKind::BlockedTarget),
            other => panic!("unexpected error: {other}"),
        }
        assert!(transport.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn unresolvable_hosts_are_rejected() {
        let client = gateway(Arc::new(RecordingTransport::default()), ResourceLimits::default())
            .scoped(CancellationToken::new());
        let err = client
            .send(HttpRequest::get("https://nowhere.example.com/"))
            .await
            .expect_err("unresolved");
        assert!(matches!(
            err,
            HttpError::Security(SecurityViolation {
                kind: SecurityErrorKind::UnresolvedHost,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn oversized_request_bodies_are_rejected() {
        let limits = ResourceLimits {
            max_request_bytes: 4,
            ..ResourceLimits::default()
        };
        let client = gateway(Arc::new(RecordingTransport::default()), limits)
            .scoped(CancellationToken::new());
        let err = client
            .send(HttpRequest::new(Method::POST, "https://api.example.com/").body("too long"))
            .await
            .expect_err("too large");
        assert!(err.to_string().contains("payloadTooLarge"));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_time_out() {
        let limits = ResourceLimits {
            request_timeout_ms: 250,
            ..ResourceLimits::default()
        };
        let client = gateway(Arc::new(SlowTransport), limits).scoped(CancellationToken::new());
        let err = client
            .send(HttpRequest::get("https://api.example.com/"))
            .await
            .expect_err("timeout");
        assert!(matches!(
            err,
            HttpError::Network {
                kind: NetworkErrorKind::Timeout,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_pending_requests() {
        let cancel = CancellationToken::new();
        let client = gateway(Arc::new(SlowTransport), ResourceLimits::default())
            .scoped(cancel.clone());

        let pending = tokio::spawn(async move {
            client.send(HttpRequest::get("https://api.example.com/")).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = pending.await.expect("join");
        assert_eq!(result, Err(HttpError::Cancelled));
    }
}
