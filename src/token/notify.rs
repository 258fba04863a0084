//! Notification hooks for external token stores
//!
//! An application that persists the token cache (to disk, a distributed
//! cache, ...) implements [`TokenCacheNotifications`]. The hooks run while
//! the cache lock is held, so they may call [`TokenCache::serialize`] and
//! [`TokenCache::deserialize`] without racing other requests.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::TokenCache;
use super::request::AccountId;
use super::scopes::ScopeSet;
use crate::error::Result;

/// Arguments passed to every notification
pub struct NotificationArgs<'a> {
    /// The cache being accessed
    pub cache: &'a TokenCache,
    /// Partition key a persistent store should load and save under
    pub suggested_cache_key: Option<String>,
    pub client_id: String,
    pub account: Option<AccountId>,
    /// The cache content changed during this access
    pub has_state_changed: bool,
    /// The cache holds at least one access or refresh token
    pub has_tokens: bool,
    /// Set on writes when the persistent entry can safely expire at this unix time
    pub suggested_cache_expiry: Option<i64>,
    pub is_application_cache: bool,
    pub cancellation: CancellationToken,
    pub correlation_id: Uuid,
    pub requested_scopes: ScopeSet,
    pub requested_tenant: Option<String>,
}

impl std::fmt::Debug for NotificationArgs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationArgs")
            .field("suggested_cache_key", &self.suggested_cache_key)
            .field("client_id", &self.client_id)
            .field("has_state_changed", &self.has_state_changed)
            .field("has_tokens", &self.has_tokens)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

/// Capability interface for cache access notifications.
///
/// Every method has a no-op default, so implementors only override the hooks
/// they care about.
#[async_trait]
pub trait TokenCacheNotifications: Send + Sync {
    /// Before the cache is read or written; load external state here
    async fn before_access(&self, _args: &NotificationArgs<'_>) -> Result<()> {
        Ok(())
    }

    /// Before the cache is modified; take external locks here
    async fn before_write(&self, _args: &NotificationArgs<'_>) -> Result<()> {
        Ok(())
    }

    /// After the cache was read or written; persist if `has_state_changed`
    async fn after_access(&self, _args: &NotificationArgs<'_>) -> Result<()> {
        Ok(())
    }
}
