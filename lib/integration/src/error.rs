//! Error types for the integration crate.
//!
//! - `HttpError`: failures of an outbound request made through the HTTP helper
//! - `CredentialError`: failures resolving a credential reference
//!
//! Security rejections are their own type, see [`crate::security::SecurityViolation`].

use crate::security::SecurityViolation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport-level failure categories. All of them are considered transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkErrorKind {
    /// The request or connect timed out.
    Timeout,
    /// Host name resolution failed.
    Dns,
    /// The peer refused the connection.
    ConnectionRefused,
    /// TLS handshake or certificate failure.
    Tls,
    /// Any other connection-level failure (reset, closed, protocol).
    Connection,
}

impl NetworkErrorKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Dns => "dns",
            Self::ConnectionRefused => "connectionRefused",
            Self::Tls => "tls",
            Self::Connection => "connection",
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the outbound HTTP helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The target or payload was rejected before or during the request.
    Security(SecurityViolation),
    /// The request failed at the transport level.
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
    /// The request could not be built (bad header, bad method).
    InvalidRequest { reason: String },
    /// The execution was cancelled while the request was pending.
    Cancelled,
}

impl HttpError {
    /// Shorthand for a network failure.
    #[must_use]
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Security(violation) => write!(f, "request blocked: {violation}"),
            Self::Network { kind, message } => write!(f, "network error ({kind}): {message}"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<SecurityViolation> for HttpError {
    fn from(violation: SecurityViolation) -> Self {
        Self::Security(violation)
    }
}

/// Errors from credential resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// No credential is stored under the reference.
    NotFound { reference: String },
    /// The node asked for a reference it does not declare.
    NotPermitted { reference: String },
    /// Decryption failed.
    DecryptionFailed { reason: String },
    /// Stored data did not match any credential shape.
    InvalidFormat { reason: String },
    /// The backing store failed.
    StorageFailed { reason: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { reference } => write!(f, "credential not found: {reference}"),
            Self::NotPermitted { reference } => {
                write!(f, "credential '{reference}' is not assigned to this node")
            }
            Self::DecryptionFailed { reason } => write!(f, "decryption failed: {reason}"),
            Self::InvalidFormat { reason } => write!(f, "invalid credential format: {reason}"),
            Self::StorageFailed { reason } => write!(f, "storage operation failed: {reason}"),
        }
    }
}

impl std::error::Error for CredentialError {}
