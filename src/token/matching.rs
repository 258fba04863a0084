//! Token selection and freshness rules
//!
//! Candidates are first narrowed by [`filter_access_tokens`] to the tokens a
//! request may see at all, then [`select_by_scopes`] picks the best one:
//! an exact scope match, else a superset, else a partial overlap.

use tracing::trace;

use super::items::{AccessTokenItem, RefreshTokenItem};
use super::keys::obo_cache_key;
use super::request::{ApiKind, TokenRequest};
use super::scopes::ScopeSet;
use crate::error::{CacheError, Result};

/// Expirations further out than this are treated as corrupt
pub const EXPIRATION_TOO_LONG_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Why the caller has to go to the network (or not)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRefreshReason {
    /// A valid token was found
    NotApplicable,
    /// Nothing matched the request
    NoCachedAccessToken,
    /// A matching token exists but is expired (or corrupt)
    Expired,
    /// A valid token exists but its refresh time has passed
    ProactivelyRefreshed,
    /// Only a token covering part of the requested scopes exists
    PartialScopeMatch,
}

/// How a cached token's scopes relate to the requested ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeMatch {
    Exact,
    Superset,
    Intersect,
}

/// Result of an access token lookup
#[derive(Debug, Clone)]
pub struct AccessTokenLookup {
    /// Token usable for the request; may still be due for refresh
    pub access_token: Option<AccessTokenItem>,
    pub scope_match: Option<ScopeMatch>,
    pub reason: CacheRefreshReason,
    /// Refresh token to redeem when the access token is missing or due
    pub refresh_token: Option<RefreshTokenItem>,
}

impl AccessTokenLookup {
    pub(crate) fn miss(reason: CacheRefreshReason) -> Self {
        Self {
            access_token: None,
            scope_match: None,
            reason,
            refresh_token: None,
        }
    }

    /// A token can be returned without a network call
    pub fn is_hit(&self) -> bool {
        self.access_token.is_some() && self.reason == CacheRefreshReason::NotApplicable
    }

    /// A token can be returned but should be refreshed in the background
    pub fn needs_refresh(&self) -> bool {
        self.reason == CacheRefreshReason::ProactivelyRefreshed
    }
}

/// `now + skew >= expires_on`
pub fn is_expired(item: &AccessTokenItem, now: i64, skew_secs: i64) -> bool {
    now + skew_secs >= item.expires_on
}

/// Due for proactive refresh: past `refresh_on` when set, else within the skew of expiry
pub fn needs_refresh(item: &AccessTokenItem, now: i64, skew_secs: i64) -> bool {
    match item.refresh_on {
        Some(refresh_on) => now >= refresh_on,
        None => now >= item.expires_on - skew_secs,
    }
}

/// Expiry too far in the future to be genuine
pub fn is_expiry_corrupt(item: &AccessTokenItem, now: i64) -> bool {
    item.expires_on > now + EXPIRATION_TOO_LONG_SECS
}

/// Still inside the extended lifetime window
pub fn is_within_extended_lifetime(item: &AccessTokenItem, now: i64, skew_secs: i64) -> bool {
    item.extended_expires_on > now + skew_secs
}

/// Keep the access tokens the request is allowed to see
pub fn filter_access_tokens(
    items: Vec<AccessTokenItem>,
    request: &TokenRequest,
) -> Vec<AccessTokenItem> {
    let obo_key = obo_cache_key(request);
    let home_account = match request.api {
        ApiKind::ClientCredentials | ApiKind::OnBehalfOf { .. } => None,
        _ => request.account.as_ref().map(|a| a.home_account_id.as_str()),
    };
    // A multi-tenant authority resolves to the account's home tenant (`uid.utid`)
    let tenant = if request.authority.is_multi_tenant() {
        home_account
            .and_then(|home| home.split_once('.'))
            .map(|(_, utid)| utid)
            .filter(|utid| !utid.is_empty())
    } else {
        Some(request.authority.tenant.as_str())
    };

    items
        .into_iter()
        .filter(|item| {
            let accepted = item.client_id.eq_ignore_ascii_case(&request.client_id)
                && item
                    .environment
                    .eq_ignore_ascii_case(&request.authority.environment)
                && item
                    .effective_token_type()
                    .eq_ignore_ascii_case(&request.token_type)
                && kid_matches(item.kid.as_deref(), request.key_id.as_deref())
                && tenant.map_or(true, |t| item.realm.eq_ignore_ascii_case(t))
                && home_account.map_or(true, |home| item.home_account_id.eq_ignore_ascii_case(home))
                && match &obo_key {
                    Some(key) => item
                        .user_assertion_hash
                        .as_deref()
                        .is_some_and(|h| h.eq_ignore_ascii_case(key)),
                    None => true,
                };
            trace!(target_scopes = %item.target, accepted = accepted, "Access token filter");
            accepted
        })
        .collect()
}

pub(crate) fn kid_matches(item_kid: Option<&str>, request_kid: Option<&str>) -> bool {
    match (item_kid.filter(|k| !k.is_empty()), request_kid.filter(|k| !k.is_empty())) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Pick the best candidate for `requested` scopes.
///
/// More than one exact or superset candidate is ambiguous and fails with
/// [`CacheError::MultipleTokensMatched`]. Among partial matches the one with
/// the largest overlap wins. A request with nothing but reserved scopes
/// matches nothing.
pub fn select_by_scopes(
    candidates: &[AccessTokenItem],
    requested: &ScopeSet,
) -> Result<Option<(AccessTokenItem, ScopeMatch)>> {
    let requested = requested.without_reserved();
    if requested.is_empty() {
        return Ok(None);
    }
    let targets: Vec<ScopeSet> = candidates
        .iter()
        .map(|item| item.target.without_reserved())
        .collect();

    let exact: Vec<usize> = (0..candidates.len())
        .filter(|&i| targets[i] == requested)
        .collect();
    if let Some(found) = single(&exact, candidates, ScopeMatch::Exact)? {
        return Ok(Some(found));
    }

    let superset: Vec<usize> = (0..candidates.len())
        .filter(|&i| targets[i].is_superset_of(&requested))
        .collect();
    if let Some(found) = single(&superset, candidates, ScopeMatch::Superset)? {
        return Ok(Some(found));
    }

    let best_partial = (0..candidates.len())
        .map(|i| (i, targets[i].overlap(&requested)))
        .filter(|&(_, overlap)| overlap > 0)
        .max_by_key(|&(_, overlap)| overlap);

    Ok(best_partial.map(|(i, _)| (candidates[i].clone(), ScopeMatch::Intersect)))
}

fn single(
    indices: &[usize],
    candidates: &[AccessTokenItem],
    kind: ScopeMatch,
) -> Result<Option<(AccessTokenItem, ScopeMatch)>> {
    match indices {
        [] => Ok(None),
        [only] => Ok(Some((candidates[*only].clone(), kind))),
        _ => Err(CacheError::MultipleTokensMatched),
    }
}
