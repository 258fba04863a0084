//! Cache keys and partition keys
//!
//! Item keys identify one item inside the store. Partition keys select the
//! bucket a request reads from and writes to, so contention and scan cost
//! stay local to one account or app credential.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::items::{AccessTokenItem, AccountItem, AppMetadataItem, IdTokenItem, RefreshTokenItem};
use super::request::{ApiKind, TokenRequest};

const APP_TOKEN_CACHE_SUFFIX: &str = "_AppTokenCache";

/// Hash of an on-behalf-of user assertion: base64url(SHA-256(assertion))
pub fn assertion_hash(user_assertion: &str) -> String {
    let digest = Sha256::digest(user_assertion.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Partition key of app-only (client credentials) tokens
pub fn app_token_partition_key(client_id: &str, tenant: &str, kid: Option<&str>) -> String {
    match kid {
        Some(kid) if !kid.is_empty() => {
            format!("{}_{}_{}{}", client_id, tenant, kid, APP_TOKEN_CACHE_SUFFIX)
        }
        _ => format!("{}_{}{}", client_id, tenant, APP_TOKEN_CACHE_SUFFIX),
    }
}

/// Partition a request reads from and writes to.
///
/// `None` means the request is not partitioned and every partition is
/// scanned.
pub fn partition_key_for_request(request: &TokenRequest) -> Option<String> {
    match &request.api {
        ApiKind::OnBehalfOf {
            long_running_key: Some(key),
            ..
        } if !key.is_empty() => Some(key.clone()),
        ApiKind::OnBehalfOf { user_assertion, .. } => Some(assertion_hash(user_assertion)),
        ApiKind::ClientCredentials => Some(app_token_partition_key(
            &request.client_id,
            &request.authority.tenant,
            request.key_id.as_deref(),
        )),
        ApiKind::Silent | ApiKind::AccountLookup => request
            .account
            .as_ref()
            .map(|account| account.home_account_id.clone()),
        ApiKind::Other => None,
    }
}

/// On-behalf-of cache key carried by the request, if any
pub fn obo_cache_key(request: &TokenRequest) -> Option<String> {
    match &request.api {
        ApiKind::OnBehalfOf {
            long_running_key: Some(key),
            ..
        } if !key.is_empty() => Some(key.clone()),
        ApiKind::OnBehalfOf { user_assertion, .. } => Some(assertion_hash(user_assertion)),
        _ => None,
    }
}

fn credential_key(
    home_account_id: &str,
    environment: &str,
    credential_type: &str,
    client_id: &str,
    realm: &str,
    target: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}-{}",
        home_account_id, environment, credential_type, client_id, realm, target
    )
    .to_lowercase()
}

impl AccessTokenItem {
    pub fn cache_key(&self) -> String {
        let mut key = credential_key(
            &self.home_account_id,
            &self.environment,
            &self.credential_type,
            &self.client_id,
            &self.realm,
            &self.target.key_string(),
        );
        if let Some(token_type) = &self.token_type {
            if !token_type.eq_ignore_ascii_case(super::items::BEARER_TOKEN_TYPE) {
                key.push('-');
                key.push_str(&token_type.to_lowercase());
            }
        }
        key
    }

    pub fn partition_key(&self) -> String {
        if let Some(obo) = self.user_assertion_hash.as_deref().filter(|k| !k.is_empty()) {
            return obo.to_string();
        }
        if self.is_app_token() {
            return app_token_partition_key(&self.client_id, &self.realm, self.kid.as_deref());
        }
        self.home_account_id.clone()
    }
}

impl RefreshTokenItem {
    /// Family tokens are keyed by family id so one exists per family
    pub fn cache_key(&self) -> String {
        let client_or_family = match &self.family_id {
            Some(family) if !family.is_empty() => family.as_str(),
            _ => self.client_id.as_str(),
        };
        credential_key(
            &self.home_account_id,
            &self.environment,
            &self.credential_type,
            client_or_family,
            "",
            "",
        )
    }

    pub fn partition_key(&self) -> String {
        match self.user_assertion_hash.as_deref().filter(|k| !k.is_empty()) {
            Some(obo) => obo.to_string(),
            None => self.home_account_id.clone(),
        }
    }
}

impl IdTokenItem {
    pub fn cache_key(&self) -> String {
        credential_key(
            &self.home_account_id,
            &self.environment,
            &self.credential_type,
            &self.client_id,
            &self.realm,
            "",
        )
    }

    pub fn partition_key(&self) -> String {
        self.home_account_id.clone()
    }
}

impl AccountItem {
    pub fn cache_key(&self) -> String {
        format!("{}-{}-{}", self.home_account_id, self.environment, self.realm).to_lowercase()
    }

    pub fn partition_key(&self) -> String {
        self.home_account_id.clone()
    }
}

impl AppMetadataItem {
    pub fn cache_key(&self) -> String {
        format!("appmetadata-{}-{}", self.environment, self.client_id).to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::request::{AccountId, Authority};
    use crate::token::scopes::ScopeSet;

    fn request(api: ApiKind) -> TokenRequest {
        TokenRequest::new(
            "client-1",
            Authority::new("login.example.com", "tenant-1"),
            ScopeSet::parse("user.read"),
        )
        .with_api(api)
    }

    #[test]
    fn test_assertion_hash_is_url_safe() {
        let hash = assertion_hash("eyJhbGciOi.assertion+/=");
        assert_eq!(hash.len(), 43);
        assert!(!hash.contains('+') && !hash.contains('/') && !hash.contains('='));
        assert_eq!(hash, assertion_hash("eyJhbGciOi.assertion+/="));
    }

    #[test]
    fn test_partition_key_derivation() {
        let obo = request(ApiKind::OnBehalfOf {
            user_assertion: "assertion".to_string(),
            long_running_key: None,
        });
        assert_eq!(partition_key_for_request(&obo), Some(assertion_hash("assertion")));

        let long_running = request(ApiKind::OnBehalfOf {
            user_assertion: "assertion".to_string(),
            long_running_key: Some("session-42".to_string()),
        });
        assert_eq!(
            partition_key_for_request(&long_running),
            Some("session-42".to_string())
        );

        let app = request(ApiKind::ClientCredentials);
        assert_eq!(
            partition_key_for_request(&app),
            Some("client-1_tenant-1_AppTokenCache".to_string())
        );

        let pop_app = request(ApiKind::ClientCredentials).with_pop_key("kid-9");
        assert_eq!(
            partition_key_for_request(&pop_app),
            Some("client-1_tenant-1_kid-9_AppTokenCache".to_string())
        );

        let silent = request(ApiKind::Silent).with_account(AccountId::new("uid.utid"));
        assert_eq!(partition_key_for_request(&silent), Some("uid.utid".to_string()));

        assert_eq!(partition_key_for_request(&request(ApiKind::Silent)), None);
        assert_eq!(partition_key_for_request(&request(ApiKind::Other)), None);
    }

    #[test]
    fn test_refresh_token_key_uses_family() {
        let item = RefreshTokenItem {
            home_account_id: "UID.UTID".to_string(),
            environment: "login.example.com".to_string(),
            client_id: "client-1".to_string(),
            credential_type: "RefreshToken".to_string(),
            secret: "rt".to_string(),
            family_id: Some("1".to_string()),
            user_assertion_hash: None,
            additional: Default::default(),
        };
        assert_eq!(item.cache_key(), "uid.utid-login.example.com-refreshtoken-1--");
    }
}
