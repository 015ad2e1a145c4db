//! Security & resource enforcement for outbound targets.
//!
//! Every URL a node wants to reach goes through [`Enforcer::check_url`]
//! before any I/O happens, and every address the host resolves to goes
//! through [`Enforcer::check_resolved`] before a connection is opened. Both
//! checks fail closed unless [`SecurityPolicy::allow_private_networks`] is
//! set.

use crate::limits::ResourceLimits;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// How dangerous a rejected request would have been.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityErrorKind {
    /// The URL could not be parsed or has no host.
    InvalidUrl,
    /// The scheme is not in the allow-list.
    BlockedScheme,
    /// The host is on the domain deny-list.
    BlockedDomain,
    /// The host is, or resolves to, a private or local address.
    BlockedTarget,
    /// The host resolved to no addresses.
    UnresolvedHost,
    /// A request or response body exceeded its ceiling.
    PayloadTooLarge,
}

impl SecurityErrorKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalidUrl",
            Self::BlockedScheme => "blockedScheme",
            Self::BlockedDomain => "blockedDomain",
            Self::BlockedTarget => "blockedTarget",
            Self::UnresolvedHost => "unresolvedHost",
            Self::PayloadTooLarge => "payloadTooLarge",
        }
    }
}

impl fmt::Display for SecurityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected outbound request.
///
/// `target` is the host only. Paths and query strings are left out because
/// they routinely carry tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    pub kind: SecurityErrorKind,
    pub risk_level: RiskLevel,
    pub target: String,
    pub reason: String,
}

impl SecurityViolation {
    /// Creates a violation.
    #[must_use]
    pub fn new(
        kind: SecurityErrorKind,
        risk_level: RiskLevel,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            risk_level,
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// A body crossed its size ceiling. `direction` is "request" or "response".
    #[must_use]
    pub fn payload_too_large(target: impl Into<String>, direction: &str, limit: u64) -> Self {
        Self::new(
            SecurityErrorKind::PayloadTooLarge,
            RiskLevel::Medium,
            target,
            format!("{direction} body exceeds {limit} bytes"),
        )
    }
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} risk) for {}: {}",
            self.kind, self.risk_level, self.target, self.reason
        )
    }
}

impl std::error::Error for SecurityViolation {}

fn default_allowed_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

/// Target policy applied by the [`Enforcer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Schemes that may be requested.
    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,
    /// Domains that may never be requested. Subdomains are blocked as well.
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Allows private, loopback and link-local targets. Local development only.
    #[serde(default)]
    pub allow_private_networks: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_schemes: default_allowed_schemes(),
            blocked_domains: Vec::new(),
            allow_private_networks: false,
        }
    }
}

impl SecurityPolicy {
    /// Adds a domain to the deny-list.
    #[must_use]
    pub fn block_domain(mut self, domain: impl Into<String>) -> Self {
        self.blocked_domains.push(domain.into());
        self
    }

    /// Sets the private network opt-out.
    #[must_use]
    pub fn with_private_networks(mut self, allow: bool) -> Self {
        self.allow_private_networks = allow;
        self
    }
}

/// A URL that passed [`Enforcer::check_url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    /// The parsed URL.
    pub url: Url,
    /// Lowercased host, without IPv6 brackets.
    pub host: String,
    /// Explicit or scheme-default port.
    pub port: u16,
    /// Set when the host is an IP literal and needs no resolution.
    pub literal: Option<IpAddr>,
}

/// Applies the security policy and resource limits to outbound requests.
#[derive(Debug, Clone, Default)]
pub struct Enforcer {
    policy: SecurityPolicy,
    limits: ResourceLimits,
}

impl Enforcer {
    /// Creates an enforcer.
    #[must_use]
    pub fn new(policy: SecurityPolicy, limits: ResourceLimits) -> Self {
        Self { policy, limits }
    }

    /// Returns the target policy.
    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Returns the resource limits.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Validates a URL without doing any I/O.
    ///
    /// # Errors
    ///
    /// Returns a [`SecurityViolation`] for unparsable URLs, disallowed
    /// schemes, deny-listed domains, local host names and private literal
    /// addresses.
    pub fn check_url(&self, raw: &str) -> Result<TargetUrl, SecurityViolation> {
        let url = Url::parse(raw).map_err(|e| {
            SecurityViolation::new(
                SecurityErrorKind::InvalidUrl,
                RiskLevel::Low,
                "<unparsable url>",
                e.to_string(),
            )
        })?;

        let scheme = url.scheme();
        if !self
            .policy
            .allowed_schemes
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(scheme))
        {
            let target = url.host_str().unwrap_or(scheme).to_string();
            return Err(SecurityViolation::new(
                SecurityErrorKind::BlockedScheme,
                RiskLevel::High,
                target,
                format!("scheme '{scheme}' is not allowed"),
            ));
        }

        // A fully qualified name ("host.") names the same host as "host".
        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').trim_end_matches('.'))
            .filter(|h| !h.is_empty())
            .map(str::to_ascii_lowercase);
        let Some(host) = host else {
            return Err(SecurityViolation::new(
                SecurityErrorKind::InvalidUrl,
                RiskLevel::Low,
                scheme.to_string(),
                "url has no host",
            ));
        };
        let mut url = url;
        if url.host_str().is_some_and(|h| h.ends_with('.')) {
            // The pinned resolution is keyed by the URL's host, so the URL
            // must carry the same name the checks below saw.
            url.set_host(Some(&host)).map_err(|e| {
                SecurityViolation::new(
                    SecurityErrorKind::InvalidUrl,
                    RiskLevel::Low,
                    host.clone(),
                    e.to_string(),
                )
            })?;
        }

        let Some(port) = url.port_or_known_default() else {
            return Err(SecurityViolation::new(
                SecurityErrorKind::InvalidUrl,
                RiskLevel::Low,
                host,
                "url has no port and the scheme has no default",
            ));
        };

        if let Some(domain) = self.blocked_domain(&host) {
            let reason = format!("domain '{domain}' is blocked");
            return Err(SecurityViolation::new(
                SecurityErrorKind::BlockedDomain,
                RiskLevel::High,
                host,
                reason,
            ));
        }

        let literal = host.parse::<IpAddr>().ok();
        if !self.policy.allow_private_networks {
            if is_local_name(&host) {
                return Err(SecurityViolation::new(
                    SecurityErrorKind::BlockedTarget,
                    RiskLevel::Critical,
                    host,
                    "local host names are not reachable",
                ));
            }
            if let Some((risk, class)) = literal.and_then(classify_address) {
                return Err(SecurityViolation::new(
                    SecurityErrorKind::BlockedTarget,
                    risk,
                    host,
                    format!("{class} address"),
                ));
            }
        }

        Ok(TargetUrl {
            url,
            host,
            port,
            literal,
        })
    }

    /// Validates the addresses a target resolved to.
    ///
    /// # Errors
    ///
    /// Returns `unresolvedHost` for an empty set and `blockedTarget` if any
    /// address is private or local.
    pub fn check_resolved(
        &self,
        target: &TargetUrl,
        addrs: &[IpAddr],
    ) -> Result<(), SecurityViolation> {
        if addrs.is_empty() {
            return Err(SecurityViolation::new(
                SecurityErrorKind::UnresolvedHost,
                RiskLevel::Low,
                target.host.clone(),
                "host resolved to no addresses",
            ));
        }
        if self.policy.allow_private_networks {
            return Ok(());
        }
        for ip in addrs {
            if let Some((risk, class)) = classify_address(*ip) {
                return Err(SecurityViolation::new(
                    SecurityErrorKind::BlockedTarget,
                    risk,
                    target.host.clone(),
                    format!("resolves to {class} address {ip}"),
                ));
            }
        }
        Ok(())
    }

    /// Checks a request body against the request ceiling.
    ///
    /// # Errors
    ///
    /// Returns `payloadTooLarge` when `len` exceeds the limit.
    pub fn check_request_size(&self, target: &TargetUrl, len: usize) -> Result<(), SecurityViolation> {
        let limit = self.limits.max_request_bytes;
        if len as u64 > limit {
            return Err(SecurityViolation::payload_too_large(
                target.host.clone(),
                "request",
                limit,
            ));
        }
        Ok(())
    }

    fn blocked_domain(&self, host: &str) -> Option<&str> {
        self.policy
            .blocked_domains
            .iter()
            .map(|d| d.trim().trim_matches('.'))
            .filter(|d| !d.is_empty())
            .find(|domain| {
                host.eq_ignore_ascii_case(domain)
                    || (host.len() > domain.len()
                        && host.ends_with(&domain.to_ascii_lowercase())
                        && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
            })
    }
}

/// A URL reduced to what may appear in errors, logs and events: scheme,
/// host, port and path. Credentials, query and fragment are dropped.
#[must_use]
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<unparsable url>".to_string();
    };
    // Only fails for URLs that cannot carry credentials in the first place.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);
    url.into()
}

fn is_local_name(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host == "localhost"
        || host.ends_with(".localhost")
        || host == "localhost.localdomain"
        || host == "ip6-localhost"
        || host == "ip6-loopback"
}

/// Classifies an address that must never be reached from node logic.
///
/// Returns `None` for publicly routable addresses.
#[must_use]
pub fn classify_address(ip: IpAddr) -> Option<(RiskLevel, &'static str)> {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(ip: Ipv4Addr) -> Option<(RiskLevel, &'static str)> {
    let octets = ip.octets();
    if ip.is_loopback() {
        Some((RiskLevel::Critical, "loopback"))
    } else if ip.is_link_local() {
        // 169.254.169.254 serves cloud instance metadata.
        Some((RiskLevel::Critical, "link-local"))
    } else if ip.is_private() {
        Some((RiskLevel::High, "private"))
    } else if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
        Some((RiskLevel::High, "carrier-grade NAT"))
    } else if ip.is_unspecified() || octets[0] == 0 {
        Some((RiskLevel::High, "unspecified"))
    } else if ip.is_broadcast() {
        Some((RiskLevel::Medium, "broadcast"))
    } else if ip.is_multicast() {
        Some((RiskLevel::Medium, "multicast"))
    } else {
        None
    }
}

/// `64:ff9b::/96`, where NAT64 gateways embed the IPv4 destination.
const NAT64_PREFIX: [u16; 6] = [0x64, 0xff9b, 0, 0, 0, 0];

fn classify_v6(ip: Ipv6Addr) -> Option<(RiskLevel, &'static str)> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_v4(v4).map(|(risk, _)| (risk, "IPv4-mapped"));
    }
    let segments = ip.segments();
    let embedding = if segments[..6] == NAT64_PREFIX {
        Some("NAT64")
    } else if segments[..6] == [0; 6] && !ip.is_loopback() && !ip.is_unspecified() {
        Some("IPv4-compatible")
    } else {
        None
    };
    if let Some(label) = embedding {
        let v4 = Ipv4Addr::from((u32::from(segments[6]) << 16) | u32::from(segments[7]));
        return classify_v4(v4).map(|(risk, _)| (risk, label));
    }
    let first = ip.segments()[0];
    if ip.is_loopback() {
        Some((RiskLevel::Critical, "loopback"))
    } else if (first & 0xffc0) == 0xfe80 {
        Some((RiskLevel::Critical, "link-local"))
    } else if (first & 0xfe00) == 0xfc00 {
        Some((RiskLevel::High, "unique local"))
    } else if ip.is_unspecified() {
        Some((RiskLevel::High, "unspecified"))
    } else if ip.is_multicast() {
        Some((RiskLevel::Medium, "multicast"))
    } else {
        None
    }
}
