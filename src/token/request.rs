//! Request context and token response payload
//!
//! The cache never talks to the network. Callers describe the request they
//! are serving with a [`TokenRequest`] and hand back whatever the token
//! endpoint returned as a [`TokenResponse`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::items::BEARER_TOKEN_TYPE;
use super::scopes::ScopeSet;

/// Tenants that do not identify a single directory
const MULTI_TENANT_ALIASES: [&str; 3] = ["common", "organizations", "consumers"];

/// Which acquisition flow the request belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKind {
    /// Silent acquisition for a known account
    Silent,
    /// Listing or looking up accounts
    AccountLookup,
    /// App-only tokens
    ClientCredentials,
    /// Middle-tier service acting for a user
    OnBehalfOf {
        user_assertion: String,
        long_running_key: Option<String>,
    },
    /// Anything else; reads scan every partition
    Other,
}

/// Authority host and tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub environment: String,
    pub tenant: String,
}

impl Authority {
    pub fn new(environment: &str, tenant: &str) -> Self {
        Self {
            environment: environment.to_string(),
            tenant: tenant.to_string(),
        }
    }

    /// Whether the tenant is a multi-tenant alias rather than a directory id
    pub fn is_multi_tenant(&self) -> bool {
        self.tenant.is_empty()
            || MULTI_TENANT_ALIASES
                .iter()
                .any(|alias| self.tenant.eq_ignore_ascii_case(alias))
    }
}

/// Account the request is made for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId {
    /// `{uid}.{utid}`
    pub home_account_id: String,
    pub username: Option<String>,
}

impl AccountId {
    pub fn new(home_account_id: &str) -> Self {
        Self {
            home_account_id: home_account_id.to_string(),
            username: None,
        }
    }
}

/// Everything the cache needs to know about one logical request
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub client_id: String,
    pub authority: Authority,
    pub scopes: ScopeSet,
    pub account: Option<AccountId>,
    pub api: ApiKind,
    /// Requested token type, `Bearer` unless proof-of-possession is used
    pub token_type: String,
    /// Proof-of-possession key id
    pub key_id: Option<String>,
    pub correlation_id: Uuid,
    pub cancellation: CancellationToken,
}

impl TokenRequest {
    pub fn new(client_id: &str, authority: Authority, scopes: ScopeSet) -> Self {
        Self {
            client_id: client_id.to_string(),
            authority,
            scopes,
            account: None,
            api: ApiKind::Silent,
            token_type: BEARER_TOKEN_TYPE.to_string(),
            key_id: None,
            correlation_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_api(mut self, api: ApiKind) -> Self {
        self.api = api;
        self
    }

    pub fn with_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    /// Bind the request to a proof-of-possession key
    pub fn with_pop_key(mut self, key_id: &str) -> Self {
        self.key_id = Some(key_id.to_string());
        self.token_type = "pop".to_string();
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn is_on_behalf_of(&self) -> bool {
        matches!(self.api, ApiKind::OnBehalfOf { .. })
    }

    pub fn is_app_only(&self) -> bool {
        self.api == ApiKind::ClientCredentials
    }
}

/// Accept seconds as either a JSON number or a string
fn deserialize_optional_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    super::items::unix_seconds::option::deserialize(deserializer)
}

/// Successful token endpoint response
#[derive(Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub client_info: Option<String>,
    /// Space separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_seconds")]
    pub expires_in: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_optional_seconds")]
    pub ext_expires_in: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_optional_seconds")]
    pub refresh_in: Option<i64>,
    /// Family id when the refresh token is a family refresh token
    #[serde(default)]
    pub foci: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .field("foci", &self.foci)
            .finish()
    }
}

/// Decoded `client_info` (`{"uid": ..., "utid": ...}` in base64url)
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub uid: String,
    pub utid: String,
}

impl ClientInfo {
    /// Decode; returns None for anything malformed
    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = decode_base64url(raw)?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn home_account_id(&self) -> String {
        format!("{}.{}", self.uid, self.utid)
    }
}

/// The ID token claims the cache reads. The signature is not checked.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub upn: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IdTokenClaims {
    /// Decode the payload segment of a compact JWT
    pub fn decode(jwt: &str) -> Option<Self> {
        let payload = jwt.split('.').nth(1)?;
        let bytes = decode_base64url(payload)?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Object id, falling back to subject
    pub fn local_account_id(&self) -> Option<&str> {
        self.oid.as_deref().or(self.sub.as_deref())
    }

    pub fn username(&self) -> Option<&str> {
        self.preferred_username.as_deref().or(self.upn.as_deref())
    }
}

fn decode_base64url(raw: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')).ok()
}
