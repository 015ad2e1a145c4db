//! Credential material and the store that decrypts it.
//!
//! Node logic only ever holds [`CredentialData`] for the duration of one
//! call. The engine never persists it, and its `Debug` output names the
//! variant and nothing else.

use crate::error::CredentialError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

const AUTHORIZATION: &str = "Authorization";
const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Decrypted credential material, tagged by `type` in JSON.
///
/// ```json
/// {"type": "apiKey", "key": "abc", "headerName": "X-Token"}
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CredentialData {
    Oauth2 {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        token_type: Option<String>,
        /// Informational. Refreshing tokens is the store's job.
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    ApiKey {
        key: String,
        /// Header carrying the key, `X-API-Key` when absent.
        #[serde(default)]
        header_name: Option<String>,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    BearerToken {
        token: String,
    },
    /// Anything else. A `headers` object of strings is sent as-is.
    Custom {
        data: JsonValue,
    },
}

impl fmt::Debug for CredentialData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialData::{}(..)", self.kind())
    }
}

impl CredentialData {
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::BearerToken {
            token: token.into(),
        }
    }

    #[must_use]
    pub fn basic_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::BasicAuth {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: key.into(),
            header_name: None,
        }
    }

    /// The JSON tag of this variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Oauth2 { .. } => "oauth2",
            Self::ApiKey { .. } => "apiKey",
            Self::BasicAuth { .. } => "basicAuth",
            Self::BearerToken { .. } => "bearerToken",
            Self::Custom { .. } => "custom",
        }
    }

    /// Whether an OAuth2 token has passed its recorded expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::Oauth2 { expires_at: Some(at), .. } if *at <= now)
    }

    /// Request headers that present this credential.
    #[must_use]
    pub fn auth_headers(&self) -> Vec<(String, String)> {
        let authorization = |value: String| vec![(AUTHORIZATION.to_string(), value)];
        match self {
            Self::Oauth2 {
                access_token,
                token_type,
                ..
            } => authorization(format!(
                "{} {access_token}",
                token_type.as_deref().unwrap_or("Bearer")
            )),
            Self::BearerToken { token } => authorization(format!("Bearer {token}")),
            Self::BasicAuth { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                authorization(format!("Basic {encoded}"))
            }
            Self::ApiKey { key, header_name } => vec![(
                header_name
                    .as_deref()
                    .unwrap_or(DEFAULT_API_KEY_HEADER)
                    .to_string(),
                key.clone(),
            )],
            Self::Custom { data } => {
                let Some(headers) = data.get("headers").and_then(JsonValue::as_object) else {
                    return Vec::new();
                };
                headers
                    .iter()
                    .filter_map(|(name, value)| Some((name.clone(), value.as_str()?.to_string())))
                    .collect()
            }
        }
    }
}

/// Decrypt-on-demand access to stored credentials.
///
/// Encryption at rest belongs to the implementation. The engine calls
/// `decrypt` once per node call that asks for a credential and drops the
/// result when the call returns.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// # Errors
    ///
    /// `NotFound` for unknown references, otherwise store-specific.
    async fn decrypt(&self, reference: &str) -> Result<CredentialData, CredentialError>;
}

/// Plaintext credentials in a map. Used by the runner and in tests.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    entries: RwLock<HashMap<String, CredentialData>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `reference`, replacing any previous entry.
    pub fn insert(&self, reference: impl Into<String>, data: CredentialData) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reference.into(), data);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Into<String>> FromIterator<(R, CredentialData)> for InMemoryCredentialStore {
    fn from_iter<I: IntoIterator<Item = (R, CredentialData)>>(iter: I) -> Self {
        Self {
            entries: RwLock::new(iter.into_iter().map(|(r, d)| (r.into(), d)).collect()),
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn decrypt(&self, reference: &str) -> Result<CredentialData, CredentialError> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(reference)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                reference: reference.to_string(),
            })
    }
}
