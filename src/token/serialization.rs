//! Whole-cache JSON document
//!
//! ```json
//! {"AccessToken": {key: item}, "RefreshToken": {}, "IdToken": {},
//!  "Account": {}, "AppMetadata": {}}
//! ```
//!
//! A document that is not valid JSON fails with a serialization error. Inside
//! a valid document, items that do not parse are skipped.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::accessor::TokenCacheAccessor;
use super::items::{AccessTokenItem, AccountItem, AppMetadataItem, IdTokenItem, RefreshTokenItem};
use crate::error::{CacheError, Result};

#[derive(Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(rename = "AccessToken", default)]
    access_tokens: BTreeMap<String, Value>,
    #[serde(rename = "RefreshToken", default)]
    refresh_tokens: BTreeMap<String, Value>,
    #[serde(rename = "IdToken", default)]
    id_tokens: BTreeMap<String, Value>,
    #[serde(rename = "Account", default)]
    accounts: BTreeMap<String, Value>,
    #[serde(rename = "AppMetadata", default)]
    app_metadata: BTreeMap<String, Value>,
}

fn to_section<T: Serialize>(items: Vec<T>, key: impl Fn(&T) -> String) -> Result<BTreeMap<String, Value>> {
    items
        .into_iter()
        .map(|item| {
            let value = serde_json::to_value(&item)
                .map_err(|e| CacheError::serialization("cache item", &[], e))?;
            Ok((key(&item), value))
        })
        .collect()
}

/// Serialize every item the accessor holds
pub fn serialize(accessor: &dyn TokenCacheAccessor) -> Result<Vec<u8>> {
    let document = CacheDocument {
        access_tokens: to_section(accessor.get_all_access_tokens(None), |i| i.cache_key())?,
        refresh_tokens: to_section(accessor.get_all_refresh_tokens(None), |i| i.cache_key())?,
        id_tokens: to_section(accessor.get_all_id_tokens(None), |i| i.cache_key())?,
        accounts: to_section(accessor.get_all_accounts(None), |i| i.cache_key())?,
        app_metadata: to_section(accessor.get_all_app_metadata(), |i| i.cache_key())?,
    };

    serde_json::to_vec(&document).map_err(|e| CacheError::serialization("token cache", &[], e))
}

fn parse_section<T: DeserializeOwned>(section: &'static str, raw: BTreeMap<String, Value>) -> Vec<T> {
    raw.into_values()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(section = section, error = %e, "Skipping malformed cache item");
                None
            }
        })
        .collect()
}

/// Load a document into the accessor.
///
/// Without `merge` the accessor is cleared first. Empty input is an empty
/// cache. A document that fails to parse leaves the accessor untouched.
pub fn deserialize(accessor: &dyn TokenCacheAccessor, data: &[u8], merge: bool) -> Result<()> {
    let document: CacheDocument = if data.iter().all(|b| b.is_ascii_whitespace()) {
        CacheDocument::default()
    } else {
        serde_json::from_slice(data)
            .map_err(|e| CacheError::serialization("token cache", data, e))?
    };
    if !merge {
        accessor.clear();
    }

    let access_tokens: Vec<AccessTokenItem> = parse_section("AccessToken", document.access_tokens);
    let refresh_tokens: Vec<RefreshTokenItem> =
        parse_section("RefreshToken", document.refresh_tokens);
    let id_tokens: Vec<IdTokenItem> = parse_section("IdToken", document.id_tokens);
    let accounts: Vec<AccountItem> = parse_section("Account", document.accounts);
    let app_metadata: Vec<AppMetadataItem> = parse_section("AppMetadata", document.app_metadata);

    debug!(
        access_tokens = access_tokens.len(),
        refresh_tokens = refresh_tokens.len(),
        id_tokens = id_tokens.len(),
        accounts = accounts.len(),
        "Deserialized token cache"
    );

    for item in access_tokens {
        accessor.save_access_token(item);
    }
    for item in refresh_tokens {
        accessor.save_refresh_token(item);
    }
    for item in id_tokens {
        accessor.save_id_token(item);
    }
    for item in accounts {
        accessor.save_account(item);
    }
    for item in app_metadata {
        accessor.save_app_metadata(item);
    }
    Ok(())
}
