//! Token cache
//!
//! [`TokenCache`] owns the accessor and the cache lock and implements the
//! read and write algorithms: candidate filtering and scope matching on
//! reads, intersecting-scope coalescing and family refresh token rotation on
//! writes. Every write runs under the lock and is bracketed by the
//! notification hooks; reads get their notifications from
//! [`super::session::CacheSessionManager`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::Map;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::accessor::{InMemoryPartitionedAccessor, TokenCacheAccessor};
use super::items::{
    unix_now, AccessTokenItem, AccountItem, AppMetadataItem, IdTokenItem, RefreshTokenItem,
    AUTHORITY_TYPE_MSSTS, BEARER_TOKEN_TYPE, CREDENTIAL_TYPE_ACCESS_TOKEN,
    CREDENTIAL_TYPE_ACCESS_TOKEN_WITH_SCHEME, CREDENTIAL_TYPE_ID_TOKEN, CREDENTIAL_TYPE_REFRESH_TOKEN,
};
use super::keys::{obo_cache_key, partition_key_for_request};
use super::matching::{
    filter_access_tokens, is_expired, is_expiry_corrupt, is_within_extended_lifetime, kid_matches,
    needs_refresh, select_by_scopes, AccessTokenLookup, CacheRefreshReason, ScopeMatch,
};
use super::notify::{NotificationArgs, TokenCacheNotifications};
use super::request::{ClientInfo, IdTokenClaims, TokenRequest, TokenResponse};
use super::scopes::ScopeSet;
use super::serialization;
use crate::config::TokenCacheOptions;
use crate::error::{CacheError, Result};

/// Tokens living at least this long get a proactive refresh time at half-life
const MIN_LIFETIME_FOR_PROACTIVE_REFRESH_SECS: i64 = 2 * 60 * 60;

/// Items written for one token response
#[derive(Debug, Clone, Default)]
pub struct SavedTokens {
    pub access_token: Option<AccessTokenItem>,
    pub id_token: Option<IdTokenItem>,
    pub account: Option<AccountItem>,
}

/// One tenant an account has signed in to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub local_account_id: String,
    pub is_home_tenant: bool,
}

/// Account plus its tenant profiles
#[derive(Debug, Clone)]
pub struct CachedAccount {
    pub account: AccountItem,
    pub tenant_profiles: Vec<TenantProfile>,
}

/// Everything derived from a token response before it is written
struct PendingItems {
    access_token: Option<AccessTokenItem>,
    refresh_token: Option<RefreshTokenItem>,
    id_token: Option<IdTokenItem>,
    account: Option<AccountItem>,
    app_metadata: AppMetadataItem,
}

/// `refresh_in` from the server wins; otherwise half-life for long-lived tokens
pub fn compute_refresh_on(cached_at: i64, expires_in: i64, refresh_in: Option<i64>) -> Option<i64> {
    match refresh_in {
        Some(refresh_in) if refresh_in > 0 => Some(cached_at + refresh_in),
        _ if expires_in >= MIN_LIFETIME_FOR_PROACTIVE_REFRESH_SECS => Some(cached_at + expires_in / 2),
        _ => None,
    }
}

/// In-memory token cache with optional external persistence hooks
pub struct TokenCache {
    options: TokenCacheOptions,
    accessor: Arc<dyn TokenCacheAccessor>,
    notifications: Option<Arc<dyn TokenCacheNotifications>>,
    lock: Mutex<()>,
    is_application_cache: bool,
}

impl TokenCache {
    /// Create a cache backed by a partitioned in-memory accessor
    pub fn new(options: TokenCacheOptions) -> Result<Self> {
        let accessor = Arc::new(InMemoryPartitionedAccessor::new(options.max_partitions)?);
        Ok(Self::with_accessor(options, accessor))
    }

    /// Create a cache over an existing accessor
    pub fn with_accessor(options: TokenCacheOptions, accessor: Arc<dyn TokenCacheAccessor>) -> Self {
        info!(client_id = %options.client_id, "Token cache initialized");
        Self {
            options,
            accessor,
            notifications: None,
            lock: Mutex::new(()),
            is_application_cache: false,
        }
    }

    /// Subscribe an external store to cache notifications
    pub fn with_notifications(mut self, notifications: Arc<dyn TokenCacheNotifications>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Mark this cache as holding app-only tokens
    pub fn as_application_cache(mut self) -> Self {
        self.is_application_cache = true;
        self
    }

    pub fn options(&self) -> &TokenCacheOptions {
        &self.options
    }

    pub fn accessor(&self) -> &dyn TokenCacheAccessor {
        self.accessor.as_ref()
    }

    pub fn has_notifications(&self) -> bool {
        self.notifications.is_some()
    }

    pub(crate) fn notifications(&self) -> Option<&Arc<dyn TokenCacheNotifications>> {
        self.notifications.as_ref()
    }

    fn skew_secs(&self) -> i64 {
        self.options.expiry_skew.as_secs() as i64
    }

    /// Wait for the cache lock, giving up when `cancellation` fires
    pub(crate) async fn lock(&self, cancellation: &CancellationToken) -> Result<MutexGuard<'_, ()>> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(CacheError::Cancelled),
            guard = self.lock.lock() => Ok(guard),
        }
    }

    pub(crate) fn notification_args(
        &self,
        request: Option<&TokenRequest>,
        cancellation: &CancellationToken,
        has_state_changed: bool,
    ) -> NotificationArgs<'_> {
        let suggested_cache_expiry = if has_state_changed {
            self.suggested_cache_expiry()
        } else {
            None
        };

        match request {
            Some(request) => NotificationArgs {
                cache: self,
                suggested_cache_key: partition_key_for_request(request),
                client_id: request.client_id.clone(),
                account: request.account.clone(),
                has_state_changed,
                has_tokens: self.accessor.has_access_or_refresh_tokens(),
                suggested_cache_expiry,
                is_application_cache: self.is_application_cache,
                cancellation: cancellation.clone(),
                correlation_id: request.correlation_id,
                requested_scopes: request.scopes.clone(),
                requested_tenant: Some(request.authority.tenant.clone()),
            },
            None => NotificationArgs {
                cache: self,
                suggested_cache_key: None,
                client_id: self.options.client_id.clone(),
                account: None,
                has_state_changed,
                has_tokens: self.accessor.has_access_or_refresh_tokens(),
                suggested_cache_expiry,
                is_application_cache: self.is_application_cache,
                cancellation: cancellation.clone(),
                correlation_id: Uuid::new_v4(),
                requested_scopes: ScopeSet::new(),
                requested_tenant: None,
            },
        }
    }

    /// Latest access token expiry, when it is safe for a store to expire the entry
    fn suggested_cache_expiry(&self) -> Option<i64> {
        if !self.accessor.get_all_refresh_tokens(None).is_empty() {
            return None;
        }
        let latest = self
            .accessor
            .get_all_access_tokens(None)
            .iter()
            .map(|item| item.expires_on)
            .max()?;
        (latest >= unix_now() + self.skew_secs()).then_some(latest)
    }

    /// Run a write under the lock, bracketed by the notification hooks
    async fn write_with_notifications<T, F>(
        &self,
        request: Option<&TokenRequest>,
        cancellation: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.lock(cancellation).await?;
        let Some(notifications) = self.notifications.clone() else {
            return op(self);
        };

        let args = self.notification_args(request, cancellation, false);
        let before = match notifications.before_access(&args).await {
            Ok(()) => notifications.before_write(&args).await,
            Err(e) => Err(e),
        };
        if let Err(e) = before {
            if let Err(after_err) = notifications.after_access(&args).await {
                warn!(error = %after_err, "after_access failed after a failed before hook");
            }
            return Err(e);
        }

        let result = op(self);
        let args = self.notification_args(request, cancellation, result.is_ok());
        notifications.after_access(&args).await?;
        result
    }

    /// Find the access token serving `request`.
    ///
    /// A miss is not an error; only an ambiguous match is.
    pub fn find_access_token(&self, request: &TokenRequest) -> Result<AccessTokenLookup> {
        let partition = partition_key_for_request(request);
        let all = self.accessor.get_all_access_tokens(partition.as_deref());
        debug!(
            partition = ?partition,
            count = all.len(),
            "Discovered access tokens in cache"
        );
        if all.is_empty() {
            return Ok(AccessTokenLookup::miss(CacheRefreshReason::NoCachedAccessToken));
        }

        let candidates = filter_access_tokens(all, request);
        let Some((item, scope_match)) = select_by_scopes(&candidates, &request.scopes)? else {
            debug!("No access token matched client, authority, account and scopes");
            return Ok(AccessTokenLookup {
                refresh_token: self.find_refresh_token(request, None),
                ..AccessTokenLookup::miss(CacheRefreshReason::NoCachedAccessToken)
            });
        };

        if scope_match == ScopeMatch::Intersect {
            debug!(cached = %item.target, requested = %request.scopes, "Partial scope match");
            return Ok(AccessTokenLookup {
                access_token: None,
                scope_match: Some(scope_match),
                reason: CacheRefreshReason::PartialScopeMatch,
                refresh_token: self.find_refresh_token(request, None),
            });
        }

        let now = unix_now();
        let skew = self.skew_secs();

        if is_expiry_corrupt(&item, now) {
            warn!(
                expires_on = item.expires_on,
                "Access token expiration is implausibly far away; ignoring it"
            );
            return Ok(AccessTokenLookup {
                scope_match: Some(scope_match),
                refresh_token: self.find_refresh_token(request, None),
                ..AccessTokenLookup::miss(CacheRefreshReason::Expired)
            });
        }

        if !is_expired(&item, now, skew) {
            let due = needs_refresh(&item, now, skew);
            debug!(expires_on = item.expires_on, refresh_due = due, "Access token cache HIT");
            let (reason, refresh_token) = if due {
                (
                    CacheRefreshReason::ProactivelyRefreshed,
                    self.find_refresh_token(request, None),
                )
            } else {
                (CacheRefreshReason::NotApplicable, None)
            };
            return Ok(AccessTokenLookup {
                access_token: Some(item),
                scope_match: Some(scope_match),
                reason,
                refresh_token,
            });
        }

        let refresh_token = self.find_refresh_token(request, None);

        if self.options.extended_lifetime_enabled && is_within_extended_lifetime(&item, now, skew) {
            debug!(
                extended_expires_on = item.extended_expires_on,
                "Serving access token under extended lifetime"
            );
            let mut item = item;
            item.is_extended_lifetime = true;
            return Ok(AccessTokenLookup {
                access_token: Some(item),
                scope_match: Some(scope_match),
                reason: CacheRefreshReason::Expired,
                refresh_token,
            });
        }

        if refresh_token.is_none() {
            // No-op when a concurrent save already replaced the item
            if self.accessor.delete_access_token_if_unchanged(&item) {
                debug!("Purged expired access token with no refresh token");
            }
        } else {
            debug!(expires_on = item.expires_on, "Access token expired");
        }

        Ok(AccessTokenLookup {
            scope_match: Some(scope_match),
            refresh_token,
            ..AccessTokenLookup::miss(CacheRefreshReason::Expired)
        })
    }

    /// Family the app belongs to: `None` unknown, `Some(None)` not a member
    fn app_family(&self, request: &TokenRequest) -> Option<Option<String>> {
        self.accessor
            .get_all_app_metadata()
            .into_iter()
            .find(|m| {
                m.client_id.eq_ignore_ascii_case(&request.client_id)
                    && m.environment.eq_ignore_ascii_case(&request.authority.environment)
            })
            .map(|m| m.family_id.filter(|f| !f.is_empty()))
    }

    /// Find a refresh token for the request.
    ///
    /// With `family_id` only that family's token qualifies. Without it the
    /// app's own token is preferred, falling back to a family token when the
    /// app is (or may be) a family member.
    pub fn find_refresh_token(
        &self,
        request: &TokenRequest,
        family_id: Option<&str>,
    ) -> Option<RefreshTokenItem> {
        if request.is_app_only() {
            return None;
        }

        let partition = partition_key_for_request(request);
        let obo_key = obo_cache_key(request);
        let home = request.account.as_ref().map(|a| a.home_account_id.as_str());
        let environment = &request.authority.environment;

        let candidates: Vec<RefreshTokenItem> = self
            .accessor
            .get_all_refresh_tokens(partition.as_deref())
            .into_iter()
            .filter(|rt| {
                rt.environment.eq_ignore_ascii_case(environment)
                    && home.map_or(true, |h| rt.home_account_id.eq_ignore_ascii_case(h))
                    && match &obo_key {
                        Some(key) => rt
                            .user_assertion_hash
                            .as_deref()
                            .is_some_and(|h| h.eq_ignore_ascii_case(key)),
                        None => true,
                    }
            })
            .collect();

        if let Some(family_id) = family_id {
            return candidates
                .into_iter()
                .find(|rt| rt.family_id.as_deref() == Some(family_id));
        }

        if let Some(own) = candidates
            .iter()
            .find(|rt| !rt.is_family() && rt.client_id.eq_ignore_ascii_case(&request.client_id))
        {
            return Some(own.clone());
        }

        if !self.options.foci_enabled {
            return candidates
                .into_iter()
                .find(|rt| rt.client_id.eq_ignore_ascii_case(&request.client_id));
        }

        match self.app_family(request) {
            Some(None) => candidates
                .into_iter()
                .find(|rt| rt.client_id.eq_ignore_ascii_case(&request.client_id)),
            Some(Some(family)) => candidates
                .into_iter()
                .find(|rt| rt.family_id.as_deref() == Some(family.as_str())),
            None => candidates.into_iter().find(RefreshTokenItem::is_family),
        }
    }

    /// Whether the app belongs to `family_id`; `None` when it has never been seen
    pub fn is_app_foci_member(&self, request: &TokenRequest, family_id: &str) -> Option<bool> {
        self.app_family(request)
            .map(|family| family.as_deref() == Some(family_id))
    }

    /// Accounts visible to the request, one per home account
    pub fn get_accounts(&self, request: &TokenRequest) -> Vec<CachedAccount> {
        let partition = request.account.as_ref().map(|a| a.home_account_id.as_str());
        let environment = &request.authority.environment;

        let mut grouped: BTreeMap<String, Vec<AccountItem>> = BTreeMap::new();
        for account in self.accessor.get_all_accounts(partition) {
            if account.environment.eq_ignore_ascii_case(environment) {
                grouped
                    .entry(account.home_account_id.to_lowercase())
                    .or_default()
                    .push(account);
            }
        }

        let id_tokens: Vec<IdTokenItem> = self
            .accessor
            .get_all_id_tokens(partition)
            .into_iter()
            .filter(|id| {
                id.environment.eq_ignore_ascii_case(environment)
                    && id.client_id.eq_ignore_ascii_case(&request.client_id)
            })
            .collect();

        grouped
            .into_iter()
            .filter_map(|(home, mut accounts)| {
                let home_tenant = home.split_once('.').map(|(_, utid)| utid.to_string());
                let is_home = |realm: &str| {
                    home_tenant
                        .as_deref()
                        .is_some_and(|t| t.eq_ignore_ascii_case(realm))
                };

                if accounts.is_empty() {
                    return None;
                }
                let primary = accounts.iter().position(|a| is_home(&a.realm)).unwrap_or(0);
                let account = accounts.swap_remove(primary);

                let tenant_profiles = id_tokens
                    .iter()
                    .filter(|id| id.home_account_id.eq_ignore_ascii_case(&home))
                    .map(|id| TenantProfile {
                        tenant_id: id.realm.clone(),
                        local_account_id: IdTokenClaims::decode(&id.secret)
                            .and_then(|c| c.local_account_id().map(str::to_string))
                            .unwrap_or_default(),
                        is_home_tenant: is_home(&id.realm),
                    })
                    .collect();

                Some(CachedAccount {
                    account,
                    tenant_profiles,
                })
            })
            .collect()
    }

    /// Store the result of a successful token request
    pub async fn save_token_response(
        &self,
        request: &TokenRequest,
        response: &TokenResponse,
    ) -> Result<SavedTokens> {
        let pending = self.build_items(request, response)?;
        let cancellation = request.cancellation.clone();
        self.write_with_notifications(Some(request), &cancellation, move |cache| {
            Ok(cache.store(pending))
        })
        .await
    }

    fn build_items(&self, request: &TokenRequest, response: &TokenResponse) -> Result<PendingItems> {
        let now = unix_now();
        let client_info = response.client_info.as_deref().and_then(ClientInfo::decode);
        let claims = response.id_token.as_deref().and_then(IdTokenClaims::decode);

        let home_account_id = match &client_info {
            Some(info) => info.home_account_id(),
            None if request.is_app_only() => String::new(),
            None => request
                .account
                .as_ref()
                .map(|a| a.home_account_id.clone())
                .unwrap_or_default(),
        };
        let environment = request.authority.environment.clone();
        let realm = claims
            .as_ref()
            .and_then(|c| c.tid.clone())
            .unwrap_or_else(|| request.authority.tenant.clone());
        let obo_key = obo_cache_key(request);

        let access_token = match &response.access_token {
            Some(secret) => {
                let expires_in = response.expires_in.ok_or_else(|| {
                    CacheError::InvalidArgument("token response is missing expires_in".to_string())
                })?;
                let target = response
                    .scope
                    .as_deref()
                    .map(ScopeSet::parse)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| request.scopes.clone());
                let token_type = response
                    .token_type
                    .clone()
                    .unwrap_or_else(|| request.token_type.clone());
                let token_type =
                    (!token_type.eq_ignore_ascii_case(BEARER_TOKEN_TYPE)).then_some(token_type);
                let credential_type = if token_type.is_some() {
                    CREDENTIAL_TYPE_ACCESS_TOKEN_WITH_SCHEME
                } else {
                    CREDENTIAL_TYPE_ACCESS_TOKEN
                };
                let ext_expires_in = response.ext_expires_in.unwrap_or(expires_in).max(expires_in);

                Some(AccessTokenItem {
                    home_account_id: home_account_id.clone(),
                    environment: environment.clone(),
                    realm: realm.clone(),
                    client_id: request.client_id.clone(),
                    credential_type: credential_type.to_string(),
                    secret: secret.clone(),
                    target,
                    cached_at: now,
                    expires_on: now + expires_in,
                    extended_expires_on: now + ext_expires_in,
                    refresh_on: compute_refresh_on(now, expires_in, response.refresh_in),
                    token_type,
                    kid: request.key_id.clone(),
                    user_assertion_hash: obo_key.clone(),
                    additional: Map::new(),
                    is_extended_lifetime: false,
                })
            }
            None => None,
        };

        let family_id = response.foci.clone().filter(|f| !f.is_empty());

        let refresh_token = response.refresh_token.as_ref().map(|secret| RefreshTokenItem {
            home_account_id: home_account_id.clone(),
            environment: environment.clone(),
            client_id: request.client_id.clone(),
            credential_type: CREDENTIAL_TYPE_REFRESH_TOKEN.to_string(),
            secret: secret.clone(),
            family_id: family_id.clone(),
            user_assertion_hash: obo_key.clone(),
            additional: Map::new(),
        });

        let (id_token, account) = match &response.id_token {
            Some(raw) if !home_account_id.is_empty() => {
                let claims = claims.unwrap_or_default();
                let id_token = IdTokenItem {
                    home_account_id: home_account_id.clone(),
                    environment: environment.clone(),
                    realm: realm.clone(),
                    client_id: request.client_id.clone(),
                    credential_type: CREDENTIAL_TYPE_ID_TOKEN.to_string(),
                    secret: raw.clone(),
                    additional: Map::new(),
                };
                let username = claims
                    .username()
                    .map(str::to_string)
                    .or_else(|| request.account.as_ref().and_then(|a| a.username.clone()))
                    .unwrap_or_default();
                let account = AccountItem {
                    home_account_id: home_account_id.clone(),
                    environment: environment.clone(),
                    realm: realm.clone(),
                    local_account_id: claims.local_account_id().unwrap_or_default().to_string(),
                    username,
                    authority_type: AUTHORITY_TYPE_MSSTS.to_string(),
                    client_info: response.client_info.clone(),
                    additional: Map::new(),
                };
                (Some(id_token), Some(account))
            }
            _ => (None, None),
        };

        Ok(PendingItems {
            access_token,
            refresh_token,
            id_token,
            account,
            app_metadata: AppMetadataItem {
                client_id: request.client_id.clone(),
                environment,
                family_id,
                additional: Map::new(),
            },
        })
    }

    fn store(&self, pending: PendingItems) -> SavedTokens {
        self.accessor.save_app_metadata(pending.app_metadata);

        if let Some(access_token) = &pending.access_token {
            let removed = self.delete_intersecting_access_tokens(access_token);
            self.accessor.save_access_token(access_token.clone());
            info!(
                scopes = %access_token.target,
                replaced = removed,
                expires_on = access_token.expires_on,
                "Saved access token"
            );
        }

        if let Some(refresh_token) = pending.refresh_token {
            if refresh_token.is_family() {
                self.propagate_family_refresh_token(&refresh_token);
            }
            self.accessor.save_refresh_token(refresh_token);
        }

        if let Some(id_token) = &pending.id_token {
            self.accessor.save_id_token(id_token.clone());
        }
        if let Some(account) = &pending.account {
            self.accessor.save_account(account.clone());
        }

        SavedTokens {
            access_token: pending.access_token,
            id_token: pending.id_token,
            account: pending.account,
        }
    }

    /// Remove every access token the new one would overlap with
    fn delete_intersecting_access_tokens(&self, new: &AccessTokenItem) -> usize {
        let partition = new.partition_key();
        let mut removed = 0;
        for existing in self.accessor.get_all_access_tokens(Some(&partition)) {
            let same_slot = existing.client_id.eq_ignore_ascii_case(&new.client_id)
                && existing.realm.eq_ignore_ascii_case(&new.realm)
                && existing.environment.eq_ignore_ascii_case(&new.environment)
                && existing.home_account_id.eq_ignore_ascii_case(&new.home_account_id)
                && existing
                    .effective_token_type()
                    .eq_ignore_ascii_case(new.effective_token_type())
                && kid_matches(existing.kid.as_deref(), new.kid.as_deref());
            if same_slot && existing.target.intersects(&new.target) {
                debug!(scopes = %existing.target, "Removing access token with intersecting scopes");
                self.accessor.delete_access_token(&existing);
                removed += 1;
            }
        }
        removed
    }

    /// Rotate a family refresh token onto the account's other family members
    fn propagate_family_refresh_token(&self, family_rt: &RefreshTokenItem) {
        let Some(family_id) = family_rt.family_id.as_deref() else {
            return;
        };
        let mut family_clients: HashSet<String> = self
            .accessor
            .get_all_app_metadata()
            .into_iter()
            .filter(|m| m.family_id.as_deref() == Some(family_id))
            .map(|m| m.client_id.to_lowercase())
            .collect();
        family_clients.insert(family_rt.client_id.to_lowercase());

        let new_key = family_rt.cache_key();
        let mut rotated = 0;
        for mut existing in self
            .accessor
            .get_all_refresh_tokens(Some(&family_rt.partition_key()))
        {
            let member = existing.family_id.as_deref() == Some(family_id)
                || family_clients.contains(&existing.client_id.to_lowercase());
            if member
                && existing.cache_key() != new_key
                && existing
                    .home_account_id
                    .eq_ignore_ascii_case(&family_rt.home_account_id)
                && existing.environment.eq_ignore_ascii_case(&family_rt.environment)
            {
                existing.secret = family_rt.secret.clone();
                self.accessor.save_refresh_token(existing);
                rotated += 1;
            }
        }
        if rotated > 0 {
            debug!(family_id = family_id, rotated = rotated, "Rotated family refresh token");
        }
    }

    /// Sign an account out of this app.
    ///
    /// When family refresh tokens are honoured and the account holds one,
    /// every app's credentials for the account go; otherwise only this app's.
    pub async fn remove_account(&self, request: &TokenRequest, home_account_id: &str) -> Result<()> {
        let cancellation = request.cancellation.clone();
        self.write_with_notifications(Some(request), &cancellation, |cache| {
            cache.remove_account_items(request, home_account_id);
            Ok(())
        })
        .await
    }

    fn remove_account_items(&self, request: &TokenRequest, home_account_id: &str) {
        let partition = Some(home_account_id);
        let environment = &request.authority.environment;
        let in_account = |home: &str, env: &str| {
            home.eq_ignore_ascii_case(home_account_id) && env.eq_ignore_ascii_case(environment)
        };

        let refresh_tokens: Vec<RefreshTokenItem> = self
            .accessor
            .get_all_refresh_tokens(partition)
            .into_iter()
            .filter(|rt| in_account(&rt.home_account_id, &rt.environment))
            .collect();
        let all_clients =
            self.options.foci_enabled && refresh_tokens.iter().any(RefreshTokenItem::is_family);
        let client_matches =
            |client_id: &str| all_clients || client_id.eq_ignore_ascii_case(&request.client_id);

        let mut removed = 0usize;
        for rt in refresh_tokens.iter().filter(|rt| client_matches(&rt.client_id)) {
            self.accessor.delete_refresh_token(rt);
            removed += 1;
        }
        for at in self.accessor.get_all_access_tokens(partition) {
            if in_account(&at.home_account_id, &at.environment) && client_matches(&at.client_id) {
                self.accessor.delete_access_token(&at);
                removed += 1;
            }
        }
        for id in self.accessor.get_all_id_tokens(partition) {
            if in_account(&id.home_account_id, &id.environment) && client_matches(&id.client_id) {
                self.accessor.delete_id_token(&id);
                removed += 1;
            }
        }
        for account in self.accessor.get_all_accounts(partition) {
            if in_account(&account.home_account_id, &account.environment) {
                self.accessor.delete_account(&account);
                removed += 1;
            }
        }

        info!(
            home_account_id = home_account_id,
            all_clients = all_clients,
            removed = removed,
            "Removed account from token cache"
        );
    }

    /// Drop every token stored under a long-running on-behalf-of key
    pub async fn stop_long_running_obo(&self, request: &TokenRequest, cache_key: &str) -> Result<bool> {
        let cancellation = request.cancellation.clone();
        self.write_with_notifications(Some(request), &cancellation, |cache| {
            let owned_by_key = |hash: Option<&str>| hash.is_some_and(|h| h.eq_ignore_ascii_case(cache_key));
            let mut removed = 0usize;
            for at in cache.accessor.get_all_access_tokens(Some(cache_key)) {
                if owned_by_key(at.user_assertion_hash.as_deref()) {
                    cache.accessor.delete_access_token(&at);
                    removed += 1;
                }
            }
            for rt in cache.accessor.get_all_refresh_tokens(Some(cache_key)) {
                if owned_by_key(rt.user_assertion_hash.as_deref()) {
                    cache.accessor.delete_refresh_token(&rt);
                    removed += 1;
                }
            }
            info!(removed = removed, "Stopped long-running on-behalf-of session");
            Ok(removed > 0)
        })
        .await
    }

    /// Remove every item
    pub async fn clear(&self, cancellation: &CancellationToken) -> Result<()> {
        self.write_with_notifications(None, cancellation, |cache| {
            cache.accessor.clear();
            info!("Cleared token cache");
            Ok(())
        })
        .await
    }

    /// Export the whole cache as a JSON document
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialization::serialize(self.accessor.as_ref())
    }

    /// Import a JSON document, replacing the content unless `merge` is set
    pub fn deserialize(&self, data: &[u8], merge: bool) -> Result<()> {
        serialization::deserialize(self.accessor.as_ref(), data, merge)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::token::keys::assertion_hash;
    use crate::token::request::tests::{encode_client_info, encode_id_token};
    use crate::token::request::{AccountId, ApiKind, Authority};
    use proptest::prelude::*;

    pub(crate) const ENV: &str = "login.example.com";
    pub(crate) const HOME: &str = "uid.utid";

    pub(crate) fn user_request(scopes: &str) -> TokenRequest {
        TokenRequest::new("client-1", Authority::new(ENV, "utid"), ScopeSet::parse(scopes))
            .with_account(AccountId::new(HOME))
    }

    pub(crate) fn user_response(scopes: &str, expires_in: i64) -> TokenResponse {
        TokenResponse {
            access_token: Some(format!("at-{}", scopes)),
            refresh_token: Some("rt".to_string()),
            id_token: Some(encode_id_token("oid-1", "utid", "user@example.com")),
            client_info: Some(encode_client_info("uid", "utid")),
            scope: Some(scopes.to_string()),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(expires_in),
            ..Default::default()
        }
    }

    fn cache() -> TokenCache {
        TokenCache::new(TokenCacheOptions::for_client("client-1")).unwrap()
    }

    #[tokio::test]
    async fn test_save_then_find_is_hit() {
        let cache = cache();
        let request = user_request("user.read");
        let saved = cache
            .save_token_response(&request, &user_response("user.read", 3600))
            .await
            .unwrap();
        assert!(saved.access_token.is_some());
        assert_eq!(saved.account.as_ref().unwrap().username, "user@example.com");

        let lookup = cache.find_access_token(&request).unwrap();
        assert!(lookup.is_hit());
        assert_eq!(lookup.scope_match, Some(ScopeMatch::Exact));
        assert_eq!(lookup.access_token.unwrap().secret, "at-user.read");
    }

    #[tokio::test]
    async fn test_overlapping_write_coalesces() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a b"), &user_response("a b", 3600))
            .await
            .unwrap();
        cache
            .save_token_response(&user_request("b c"), &user_response("b c", 3600))
            .await
            .unwrap();

        let tokens = cache.accessor().get_all_access_tokens(None);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].target, ScopeSet::parse("b c"));

        let lookup = cache.find_access_token(&user_request("a b")).unwrap();
        assert!(!lookup.is_hit());
        assert_eq!(lookup.reason, CacheRefreshReason::PartialScopeMatch);
        assert!(lookup.refresh_token.is_some());
    }

    #[tokio::test]
    async fn test_disjoint_writes_coexist() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a"), &user_response("a", 3600))
            .await
            .unwrap();
        cache
            .save_token_response(&user_request("b"), &user_response("b", 3600))
            .await
            .unwrap();
        assert_eq!(cache.accessor().get_all_access_tokens(None).len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_due_token_still_served() {
        let cache = cache();
        let request = user_request("a");
        let saved = cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();

        let mut item = saved.access_token.unwrap();
        item.refresh_on = Some(unix_now() - 1);
        cache.accessor().save_access_token(item);

        let lookup = cache.find_access_token(&request).unwrap();
        assert!(lookup.needs_refresh());
        assert!(lookup.access_token.is_some());
        assert!(lookup.refresh_token.is_some());
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_is_purged() {
        let cache = cache();
        let request = user_request("a");
        let response = TokenResponse {
            refresh_token: None,
            ..user_response("a", 3600)
        };
        let saved = cache.save_token_response(&request, &response).await.unwrap();
        let mut item = saved.access_token.unwrap();
        item.expires_on = unix_now() - 1;
        cache.accessor().save_access_token(item);

        let lookup = cache.find_access_token(&request).unwrap();
        assert_eq!(lookup.reason, CacheRefreshReason::Expired);
        assert!(lookup.access_token.is_none());
        assert!(cache.accessor().get_all_access_tokens(None).is_empty());
    }

    #[tokio::test]
    async fn test_expired_with_refresh_token_is_kept() {
        let cache = cache();
        let request = user_request("a");
        let saved = cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        let mut item = saved.access_token.unwrap();
        item.expires_on = unix_now() - 1;
        cache.accessor().save_access_token(item);

        let lookup = cache.find_access_token(&request).unwrap();
        assert_eq!(lookup.reason, CacheRefreshReason::Expired);
        assert!(lookup.refresh_token.is_some());
        assert_eq!(cache.accessor().get_all_access_tokens(None).len(), 1);
    }

    #[tokio::test]
    async fn test_extended_lifetime() {
        let mut options = TokenCacheOptions::for_client("client-1");
        options.extended_lifetime_enabled = true;
        let cache = TokenCache::new(options).unwrap();
        let request = user_request("a");
        let saved = cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        let mut item = saved.access_token.unwrap();
        item.expires_on = unix_now() - 1;
        item.extended_expires_on = unix_now() + 3600;
        cache.accessor().save_access_token(item);

        let lookup = cache.find_access_token(&request).unwrap();
        assert_eq!(lookup.reason, CacheRefreshReason::Expired);
        assert!(lookup.access_token.unwrap().is_extended_lifetime);
    }

    #[tokio::test]
    async fn test_corrupt_expiry_ignored() {
        let cache = cache();
        let request = user_request("a");
        let saved = cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        let mut item = saved.access_token.unwrap();
        item.expires_on = unix_now() + 20 * 365 * 24 * 3600;
        cache.accessor().save_access_token(item);

        let lookup = cache.find_access_token(&request).unwrap();
        assert!(lookup.access_token.is_none());
        assert_eq!(lookup.reason, CacheRefreshReason::Expired);
    }

    #[tokio::test]
    async fn test_ambiguous_without_account() {
        let cache = cache();
        for (uid, secret) in [("u1", "one"), ("u2", "two")] {
            let response = TokenResponse {
                access_token: Some(secret.to_string()),
                client_info: Some(encode_client_info(uid, "utid")),
                ..user_response("a", 3600)
            };
            let request = user_request("a").with_account(AccountId::new(&format!("{}.utid", uid)));
            cache.save_token_response(&request, &response).await.unwrap();
        }

        let mut unscoped = user_request("a").with_api(ApiKind::Other);
        unscoped.account = None;
        let result = cache.find_access_token(&unscoped);
        assert!(matches!(result, Err(CacheError::MultipleTokensMatched)));

        let scoped = user_request("a").with_account(AccountId::new("u2.utid"));
        let lookup = cache.find_access_token(&scoped).unwrap();
        assert_eq!(lookup.access_token.unwrap().secret, "two");
    }

    #[tokio::test]
    async fn test_multi_tenant_authority_resolves_home_tenant() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a"), &user_response("a", 3600))
            .await
            .unwrap();

        let guest_request =
            TokenRequest::new("client-1", Authority::new(ENV, "guest-tenant"), ScopeSet::parse("a"))
                .with_account(AccountId::new(HOME));
        let guest_response = TokenResponse {
            access_token: Some("at-guest".to_string()),
            id_token: None,
            ..user_response("a", 3600)
        };
        cache
            .save_token_response(&guest_request, &guest_response)
            .await
            .unwrap();
        assert_eq!(cache.accessor().get_all_access_tokens(None).len(), 2);

        let common = TokenRequest::new("client-1", Authority::new(ENV, "common"), ScopeSet::parse("a"))
            .with_account(AccountId::new(HOME));
        let lookup = cache.find_access_token(&common).unwrap();
        let found = lookup.access_token.unwrap();
        assert_eq!(found.realm, "utid");
        assert_eq!(found.secret, "at-a");
    }

    #[tokio::test]
    async fn test_reserved_only_request_is_miss() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a"), &user_response("a", 3600))
            .await
            .unwrap();

        let lookup = cache.find_access_token(&user_request("openid profile")).unwrap();
        assert!(!lookup.is_hit());
        assert!(lookup.access_token.is_none());
        assert_eq!(lookup.reason, CacheRefreshReason::NoCachedAccessToken);
    }

    #[tokio::test]
    async fn test_app_tokens_partitioned_by_client_and_tenant() {
        let cache = cache().as_application_cache();
        let request = TokenRequest::new("client-1", Authority::new(ENV, "tenant-1"), ScopeSet::parse("api/.default"))
            .with_api(ApiKind::ClientCredentials);
        let response = TokenResponse {
            access_token: Some("app".to_string()),
            expires_in: Some(3600),
            ..Default::default()
        };
        let saved = cache.save_token_response(&request, &response).await.unwrap();
        assert!(saved.account.is_none());
        assert_eq!(
            saved.access_token.unwrap().partition_key(),
            "client-1_tenant-1_AppTokenCache"
        );

        assert!(cache.find_access_token(&request).unwrap().is_hit());

        let other_tenant = TokenRequest::new("client-1", Authority::new(ENV, "tenant-2"), ScopeSet::parse("api/.default"))
            .with_api(ApiKind::ClientCredentials);
        assert_eq!(
            cache.find_access_token(&other_tenant).unwrap().reason,
            CacheRefreshReason::NoCachedAccessToken
        );
    }

    #[tokio::test]
    async fn test_family_refresh_token_fallback_and_membership() {
        let cache = cache();
        let request = user_request("a");
        let response = TokenResponse {
            foci: Some("1".to_string()),
            ..user_response("a", 3600)
        };
        cache.save_token_response(&request, &response).await.unwrap();
        assert_eq!(cache.is_app_foci_member(&request, "1"), Some(true));

        let mut sibling = user_request("a");
        sibling.client_id = "client-2".to_string();
        assert_eq!(cache.is_app_foci_member(&sibling, "1"), None);

        let rt = cache.find_refresh_token(&sibling, None).unwrap();
        assert_eq!(rt.family_id.as_deref(), Some("1"));
        assert_eq!(cache.find_refresh_token(&sibling, Some("1")).unwrap().secret, "rt");
    }

    #[tokio::test]
    async fn test_family_refresh_token_rotates_member_tokens() {
        let cache = cache();
        let mut sibling = user_request("b");
        sibling.client_id = "client-2".to_string();
        let sibling_response = TokenResponse {
            refresh_token: Some("old-rt".to_string()),
            foci: Some("1".to_string()),
            ..user_response("b", 3600)
        };
        cache.save_token_response(&sibling, &sibling_response).await.unwrap();
        // A per-client token left over from before the app joined the family
        cache.accessor().save_refresh_token(RefreshTokenItem {
            home_account_id: HOME.to_string(),
            environment: ENV.to_string(),
            client_id: "client-2".to_string(),
            credential_type: CREDENTIAL_TYPE_REFRESH_TOKEN.to_string(),
            secret: "stale".to_string(),
            family_id: None,
            user_assertion_hash: None,
            additional: Map::new(),
        });

        let response = TokenResponse {
            refresh_token: Some("new-rt".to_string()),
            foci: Some("1".to_string()),
            ..user_response("a", 3600)
        };
        cache.save_token_response(&user_request("a"), &response).await.unwrap();

        let secrets: Vec<String> = cache
            .accessor()
            .get_all_refresh_tokens(Some(HOME))
            .into_iter()
            .map(|rt| rt.secret)
            .collect();
        assert_eq!(secrets.len(), 2);
        assert!(secrets.iter().all(|s| s == "new-rt"));
    }

    #[tokio::test]
    async fn test_accounts_with_tenant_profiles() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a"), &user_response("a", 3600))
            .await
            .unwrap();
        let guest = TokenResponse {
            id_token: Some(encode_id_token("oid-guest", "other-tenant", "user@example.com")),
            ..user_response("b", 3600)
        };
        let guest_request =
            TokenRequest::new("client-1", Authority::new(ENV, "other-tenant"), ScopeSet::parse("b"))
                .with_account(AccountId::new(HOME));
        cache.save_token_response(&guest_request, &guest).await.unwrap();

        let accounts = cache.get_accounts(&user_request("a"));
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account.realm, "utid");
        assert_eq!(accounts[0].tenant_profiles.len(), 2);
        assert!(accounts[0]
            .tenant_profiles
            .iter()
            .any(|p| p.tenant_id == "other-tenant" && !p.is_home_tenant && p.local_account_id == "oid-guest"));
    }

    #[tokio::test]
    async fn test_remove_account() {
        let cache = cache();
        let request = user_request("a");
        cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        cache.remove_account(&request, HOME).await.unwrap();

        assert!(cache.accessor().get_all_access_tokens(None).is_empty());
        assert!(cache.accessor().get_all_refresh_tokens(None).is_empty());
        assert!(cache.accessor().get_all_id_tokens(None).is_empty());
        assert!(cache.get_accounts(&request).is_empty());
    }

    #[tokio::test]
    async fn test_remove_account_keeps_other_clients_without_family() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a"), &user_response("a", 3600))
            .await
            .unwrap();
        let mut other = user_request("b");
        other.client_id = "client-2".to_string();
        cache
            .save_token_response(&other, &user_response("b", 3600))
            .await
            .unwrap();

        cache.remove_account(&user_request("a"), HOME).await.unwrap();
        let remaining = cache.accessor().get_all_access_tokens(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id, "client-2");
    }

    #[tokio::test]
    async fn test_stop_long_running_obo() {
        let cache = cache();
        let request = user_request("a").with_api(ApiKind::OnBehalfOf {
            user_assertion: "assertion".to_string(),
            long_running_key: Some("session-1".to_string()),
        });
        cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        assert!(cache.find_access_token(&request).unwrap().is_hit());

        assert!(cache.stop_long_running_obo(&request, "session-1").await.unwrap());
        assert!(cache.accessor().get_all_access_tokens(Some("session-1")).is_empty());
        assert!(!cache.stop_long_running_obo(&request, "session-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_obo_tokens_keyed_by_assertion_hash() {
        let cache = cache();
        let request = user_request("a").with_api(ApiKind::OnBehalfOf {
            user_assertion: "assertion-1".to_string(),
            long_running_key: None,
        });
        let saved = cache
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        assert_eq!(
            saved.access_token.unwrap().user_assertion_hash,
            Some(assertion_hash("assertion-1"))
        );

        let other = user_request("a").with_api(ApiKind::OnBehalfOf {
            user_assertion: "assertion-2".to_string(),
            long_running_key: None,
        });
        assert!(!cache.find_access_token(&other).unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_cancelled_write_fails() {
        let cache = cache();
        let request = user_request("a");
        request.cancellation.cancel();
        let result = cache.save_token_response(&request, &user_response("a", 3600)).await;
        assert!(matches!(result, Err(CacheError::Cancelled)));
        assert!(cache.accessor().get_all_access_tokens(None).is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache();
        cache
            .save_token_response(&user_request("a"), &user_response("a", 3600))
            .await
            .unwrap();
        cache.clear(&CancellationToken::new()).await.unwrap();
        assert!(cache.accessor().get_all_access_tokens(None).is_empty());
    }

    #[test]
    fn test_compute_refresh_on() {
        assert_eq!(compute_refresh_on(100, 3600, Some(600)), Some(700));
        assert_eq!(compute_refresh_on(100, 7200, None), Some(3700));
        assert_eq!(compute_refresh_on(100, 3600, None), None);
    }

    proptest! {
        #[test]
        fn test_no_intersecting_scopes_after_any_writes(
            writes in prop::collection::vec(prop::collection::btree_set(0u8..6, 1..4), 1..12)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let tokens = runtime.block_on(async {
                let cache = cache();
                for scopes in &writes {
                    let scopes = scopes
                        .iter()
                        .map(|s| format!("scope{}", s))
                        .collect::<Vec<_>>()
                        .join(" ");
                    cache
                        .save_token_response(&user_request(&scopes), &user_response(&scopes, 3600))
                        .await
                        .unwrap();
                }
                cache.accessor().get_all_access_tokens(None)
            });

            for (i, a) in tokens.iter().enumerate() {
                for b in tokens.iter().skip(i + 1) {
                    prop_assert!(!a.target.intersects(&b.target));
                }
            }
            let last = writes.last().unwrap().len();
            prop_assert!(tokens.iter().any(|t| t.target.len() == last));
        }
    }
}
