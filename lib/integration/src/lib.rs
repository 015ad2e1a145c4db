//! Outbound I/O for weaver nodes.
//!
//! This crate provides:
//!
//! - **Security & resource enforcement**: scheme, domain and address checks
//!   for every outbound target, plus payload and timeout ceilings
//! - **HTTP helper**: the only way node logic reaches the network
//! - **Credentials**: the decrypt-on-demand store contract and the data
//!   shapes node logic receives

pub mod credential;
pub mod error;
pub mod http;
pub mod limits;
pub mod security;

pub use credential::{CredentialData, CredentialStore, InMemoryCredentialStore};
pub use error::{CredentialError, HttpError, NetworkErrorKind};
pub use http::{
    HostResolver, HttpClient, HttpGateway, HttpRequest, HttpResponse, HttpTransport,
    PreparedRequest, ReqwestTransport, SystemResolver,
};
pub use limits::ResourceLimits;
pub use reqwest::Method;
pub use security::{
    Enforcer, RiskLevel, SecurityErrorKind, SecurityPolicy, SecurityViolation, TargetUrl,
    redact_url,
};
