//! Credential cache items
//!
//! The JSON shape of every item follows the shared cache format: snake_case
//! field names, timestamps as strings of unix seconds, and any field this
//! crate does not know about kept in `additional` so it survives a
//! read-modify-write cycle untouched.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::scopes::ScopeSet;

pub const CREDENTIAL_TYPE_ACCESS_TOKEN: &str = "AccessToken";
pub const CREDENTIAL_TYPE_ACCESS_TOKEN_WITH_SCHEME: &str = "AccessToken_With_AuthScheme";
pub const CREDENTIAL_TYPE_REFRESH_TOKEN: &str = "RefreshToken";
pub const CREDENTIAL_TYPE_ID_TOKEN: &str = "IdToken";

/// Default token type when an item or request does not name one
pub const BEARER_TOKEN_TYPE: &str = "Bearer";

/// Authority type recorded on accounts issued by the v2 endpoint
pub const AUTHORITY_TYPE_MSSTS: &str = "MSSTS";

/// Current time in unix seconds
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Unix timestamps stored as strings but accepted as numbers too
pub(crate) mod unix_seconds {
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(FlexibleI64Visitor)
    }

    pub(crate) struct FlexibleI64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleI64Visitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer or a string containing an integer")
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<i64, E> {
            Ok(value)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<i64, E> {
            i64::try_from(value).map_err(|_| de::Error::custom("timestamp out of range"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<i64, E> {
            value.trim().parse::<i64>().map_err(de::Error::custom)
        }
    }

    pub mod option {
        use serde::{de, Deserializer, Serializer};

        use super::FlexibleI64Visitor;

        pub fn serialize<S: Serializer>(
            value: &Option<i64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.collect_str(v),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct OptionVisitor;

            impl<'de> de::Visitor<'de> for OptionVisitor {
                type Value = Option<i64>;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("an optional timestamp")
                }

                fn visit_none<E: de::Error>(self) -> Result<Option<i64>, E> {
                    Ok(None)
                }

                fn visit_unit<E: de::Error>(self) -> Result<Option<i64>, E> {
                    Ok(None)
                }

                fn visit_some<D2: Deserializer<'de>>(
                    self,
                    deserializer: D2,
                ) -> Result<Option<i64>, D2::Error> {
                    deserializer.deserialize_any(FlexibleI64Visitor).map(Some)
                }
            }

            deserializer.deserialize_option(OptionVisitor)
        }
    }
}

fn access_token_credential_type() -> String {
    CREDENTIAL_TYPE_ACCESS_TOKEN.to_string()
}

fn refresh_token_credential_type() -> String {
    CREDENTIAL_TYPE_REFRESH_TOKEN.to_string()
}

fn id_token_credential_type() -> String {
    CREDENTIAL_TYPE_ID_TOKEN.to_string()
}

fn mssts_authority_type() -> String {
    AUTHORITY_TYPE_MSSTS.to_string()
}

/// Cached access token
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenItem {
    /// Empty for app-only tokens
    #[serde(default)]
    pub home_account_id: String,
    pub environment: String,
    #[serde(default)]
    pub realm: String,
    pub client_id: String,
    #[serde(default = "access_token_credential_type")]
    pub credential_type: String,
    pub secret: String,
    #[serde(default)]
    pub target: ScopeSet,
    #[serde(with = "unix_seconds")]
    pub cached_at: i64,
    #[serde(with = "unix_seconds")]
    pub expires_on: i64,
    #[serde(with = "unix_seconds")]
    pub extended_expires_on: i64,
    #[serde(
        default,
        with = "unix_seconds::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_on: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Proof-of-possession key id the token is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// On-behalf-of partition: long-running key or user assertion hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assertion_hash: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
    /// Set when served past `expires_on` under extended lifetime
    #[serde(skip)]
    pub is_extended_lifetime: bool,
}

impl AccessTokenItem {
    /// Token type with the bearer default applied
    pub fn effective_token_type(&self) -> &str {
        self.token_type.as_deref().unwrap_or(BEARER_TOKEN_TYPE)
    }

    pub fn is_app_token(&self) -> bool {
        self.home_account_id.is_empty()
    }
}

impl fmt::Debug for AccessTokenItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenItem")
            .field("home_account_id", &self.home_account_id)
            .field("environment", &self.environment)
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("secret", &"<redacted>")
            .field("target", &self.target)
            .field("expires_on", &self.expires_on)
            .field("refresh_on", &self.refresh_on)
            .field("token_type", &self.token_type)
            .field("kid", &self.kid)
            .finish()
    }
}

/// Cached refresh token; `family_id` marks a family refresh token
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTokenItem {
    #[serde(default)]
    pub home_account_id: String,
    pub environment: String,
    pub client_id: String,
    #[serde(default = "refresh_token_credential_type")]
    pub credential_type: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assertion_hash: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

impl RefreshTokenItem {
    pub fn is_family(&self) -> bool {
        self.family_id.as_deref().is_some_and(|f| !f.is_empty())
    }
}

impl fmt::Debug for RefreshTokenItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenItem")
            .field("home_account_id", &self.home_account_id)
            .field("environment", &self.environment)
            .field("client_id", &self.client_id)
            .field("secret", &"<redacted>")
            .field("family_id", &self.family_id)
            .finish()
    }
}

/// Cached raw ID token
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenItem {
    #[serde(default)]
    pub home_account_id: String,
    pub environment: String,
    #[serde(default)]
    pub realm: String,
    pub client_id: String,
    #[serde(default = "id_token_credential_type")]
    pub credential_type: String,
    pub secret: String,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

impl fmt::Debug for IdTokenItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdTokenItem")
            .field("home_account_id", &self.home_account_id)
            .field("environment", &self.environment)
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Cached account record, one per (home account, environment, tenant)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountItem {
    pub home_account_id: String,
    pub environment: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub local_account_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "mssts_authority_type")]
    pub authority_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// Which family (if any) an application belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadataItem {
    pub client_id: String,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_access_token_json() -> &'static str {
        r#"{
            "home_account_id": "uid.utid",
            "environment": "login.example.com",
            "realm": "utid",
            "client_id": "client-1",
            "credential_type": "AccessToken",
            "secret": "at-secret",
            "target": "User.Read Mail.Send",
            "cached_at": "1700000000",
            "expires_on": "1700003600",
            "extended_expires_on": "1700007200",
            "refresh_on": "1700001800",
            "x_future_field": {"nested": [1, 2, 3]},
            "x_flag": true
        }"#
    }

    #[test]
    fn test_access_token_round_trip_keeps_unknown_fields() {
        let item: AccessTokenItem = serde_json::from_str(sample_access_token_json()).unwrap();
        assert_eq!(item.expires_on, 1_700_003_600);
        assert_eq!(item.refresh_on, Some(1_700_001_800));
        assert_eq!(item.additional.len(), 2);

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["cached_at"], "1700000000");
        assert_eq!(json["x_future_field"]["nested"][2], 3);
        assert_eq!(json["x_flag"], true);

        let back: AccessTokenItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_numeric_timestamps_accepted() {
        let json = r#"{
            "environment": "login.example.com",
            "client_id": "client-1",
            "secret": "s",
            "cached_at": 1,
            "expires_on": 2,
            "extended_expires_on": 3,
            "refresh_on": null
        }"#;
        let item: AccessTokenItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.cached_at, 1);
        assert_eq!(item.refresh_on, None);
        assert!(item.is_app_token());
        assert_eq!(item.credential_type, CREDENTIAL_TYPE_ACCESS_TOKEN);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let item: AccessTokenItem = serde_json::from_str(sample_access_token_json()).unwrap();
        let rendered = format!("{:?}", item);
        assert!(!rendered.contains("at-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_refresh_token_family_flag() {
        let json = r#"{
            "home_account_id": "uid.utid",
            "environment": "login.example.com",
            "client_id": "client-1",
            "secret": "rt",
            "family_id": "1"
        }"#;
        let item: RefreshTokenItem = serde_json::from_str(json).unwrap();
        assert!(item.is_family());
        assert_eq!(item.credential_type, CREDENTIAL_TYPE_REFRESH_TOKEN);
    }
}
