//! Per-request cache session
//!
//! A request may read the cache several times (access token, refresh token,
//! accounts). [`CacheSessionManager`] makes sure the external store is loaded
//! once per request: the first read takes the cache lock, fires
//! `before_access` and `after_access`, and every later read goes straight to
//! memory.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::cache::{CachedAccount, SavedTokens, TokenCache};
use super::items::RefreshTokenItem;
use super::matching::AccessTokenLookup;
use super::request::{TokenRequest, TokenResponse};
use crate::error::Result;

/// Where the data for this request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    /// The cache has not been read yet
    None,
    /// In-memory cache only
    L1Cache,
    /// Loaded from the external store through notifications
    L2Cache,
}

/// Cache access for one request
pub struct CacheSessionManager<'a> {
    cache: &'a TokenCache,
    request: &'a TokenRequest,
    refreshed_for_read: AtomicBool,
}

impl<'a> CacheSessionManager<'a> {
    pub fn new(cache: &'a TokenCache, request: &'a TokenRequest) -> Self {
        Self {
            cache,
            request,
            refreshed_for_read: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &TokenRequest {
        self.request
    }

    pub fn cache_level(&self) -> CacheLevel {
        if !self.refreshed_for_read.load(Ordering::Acquire) {
            CacheLevel::None
        } else if self.cache.has_notifications() {
            CacheLevel::L2Cache
        } else {
            CacheLevel::L1Cache
        }
    }

    pub async fn find_access_token(&self) -> Result<AccessTokenLookup> {
        self.refresh_cache_for_read().await?;
        self.cache.find_access_token(self.request)
    }

    pub async fn find_refresh_token(&self) -> Result<Option<RefreshTokenItem>> {
        self.refresh_cache_for_read().await?;
        Ok(self.cache.find_refresh_token(self.request, None))
    }

    pub async fn find_family_refresh_token(&self, family_id: &str) -> Result<Option<RefreshTokenItem>> {
        self.refresh_cache_for_read().await?;
        Ok(self.cache.find_refresh_token(self.request, Some(family_id)))
    }

    pub async fn get_accounts(&self) -> Result<Vec<CachedAccount>> {
        self.refresh_cache_for_read().await?;
        Ok(self.cache.get_accounts(self.request))
    }

    pub async fn is_app_foci_member(&self, family_id: &str) -> Result<Option<bool>> {
        self.refresh_cache_for_read().await?;
        Ok(self.cache.is_app_foci_member(self.request, family_id))
    }

    /// Writes carry their own notifications
    pub async fn save_token_response(&self, response: &TokenResponse) -> Result<SavedTokens> {
        self.cache.save_token_response(self.request, response).await
    }

    /// Load the external store at most once per session
    async fn refresh_cache_for_read(&self) -> Result<()> {
        if self.refreshed_for_read.load(Ordering::Acquire) {
            return Ok(());
        }

        let Some(notifications) = self.cache.notifications() else {
            self.refreshed_for_read.store(true, Ordering::Release);
            return Ok(());
        };

        let _guard = self.cache.lock(&self.request.cancellation).await?;
        if self.refreshed_for_read.load(Ordering::Acquire) {
            return Ok(());
        }

        debug!(correlation_id = %self.request.correlation_id, "Refreshing cache for read");
        let args = self
            .cache
            .notification_args(Some(self.request), &self.request.cancellation, false);
        let before = notifications.before_access(&args).await;
        let after = notifications.after_access(&args).await;
        before?;
        after?;

        self.refreshed_for_read.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::config::TokenCacheOptions;
    use crate::error::CacheError;
    use crate::token::cache::tests::{user_request, user_response};
    use crate::token::notify::{NotificationArgs, TokenCacheNotifications};

    /// Persists the whole cache to a shared buffer
    #[derive(Default)]
    struct BufferStore {
        data: Mutex<Vec<u8>>,
        before_access: AtomicUsize,
        before_write: AtomicUsize,
        after_access: AtomicUsize,
        last_expiry: Mutex<Option<i64>>,
    }

    #[async_trait]
    impl TokenCacheNotifications for BufferStore {
        async fn before_access(&self, args: &NotificationArgs<'_>) -> Result<()> {
            self.before_access.fetch_add(1, Ordering::SeqCst);
            let data = self.data.lock().unwrap().clone();
            args.cache.deserialize(&data, false)
        }

        async fn before_write(&self, _args: &NotificationArgs<'_>) -> Result<()> {
            self.before_write.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn after_access(&self, args: &NotificationArgs<'_>) -> Result<()> {
            self.after_access.fetch_add(1, Ordering::SeqCst);
            if args.has_state_changed {
                *self.data.lock().unwrap() = args.cache.serialize()?;
                *self.last_expiry.lock().unwrap() = args.suggested_cache_expiry;
            }
            Ok(())
        }
    }

    struct FailingStore;

    #[async_trait]
    impl TokenCacheNotifications for FailingStore {
        async fn before_access(&self, _args: &NotificationArgs<'_>) -> Result<()> {
            Err(CacheError::Notification("store offline".to_string()))
        }
    }

    fn cache_with(store: Arc<dyn TokenCacheNotifications>) -> TokenCache {
        TokenCache::new(TokenCacheOptions::for_client("client-1"))
            .unwrap()
            .with_notifications(store)
    }

    #[tokio::test]
    async fn test_without_notifications_is_memory_only() {
        let cache = TokenCache::new(TokenCacheOptions::for_client("client-1")).unwrap();
        let request = user_request("a");
        let session = CacheSessionManager::new(&cache, &request);
        assert_eq!(session.cache_level(), CacheLevel::None);

        session.save_token_response(&user_response("a", 3600)).await.unwrap();
        assert!(session.find_access_token().await.unwrap().is_hit());
        assert_eq!(session.cache_level(), CacheLevel::L1Cache);
    }

    #[tokio::test]
    async fn test_notifications_fire_once_per_session() {
        let store = Arc::new(BufferStore::default());
        let cache = cache_with(store.clone());
        let request = user_request("a");
        let session = CacheSessionManager::new(&cache, &request);

        let (token, refresh, accounts) = tokio::join!(
            session.find_access_token(),
            session.find_refresh_token(),
            session.get_accounts()
        );
        token.unwrap();
        refresh.unwrap();
        accounts.unwrap();
        session.find_access_token().await.unwrap();

        assert_eq!(store.before_access.load(Ordering::SeqCst), 1);
        assert_eq!(store.after_access.load(Ordering::SeqCst), 1);
        assert_eq!(session.cache_level(), CacheLevel::L2Cache);
    }

    #[tokio::test]
    async fn test_write_persists_and_other_instance_reads_it() {
        let store = Arc::new(BufferStore::default());
        let writer = cache_with(store.clone());
        let request = user_request("a");
        writer
            .save_token_response(&request, &user_response("a", 3600))
            .await
            .unwrap();
        assert_eq!(store.before_write.load(Ordering::SeqCst), 1);
        assert!(!store.data.lock().unwrap().is_empty());
        // A refresh token never expires on its own
        assert_eq!(*store.last_expiry.lock().unwrap(), None);

        let reader = cache_with(store.clone());
        let session = CacheSessionManager::new(&reader, &request);
        let lookup = session.find_access_token().await.unwrap();
        assert!(lookup.is_hit());
        assert_eq!(lookup.access_token.unwrap().secret, "at-a");
    }

    #[tokio::test]
    async fn test_expiry_suggested_without_refresh_tokens() {
        let store = Arc::new(BufferStore::default());
        let cache = cache_with(store.clone());
        let request = user_request("a");
        let response = TokenResponse {
            refresh_token: None,
            ..user_response("a", 3600)
        };
        let saved = cache.save_token_response(&request, &response).await.unwrap();
        assert_eq!(
            *store.last_expiry.lock().unwrap(),
            Some(saved.access_token.unwrap().expires_on)
        );
    }

    #[tokio::test]
    async fn test_failed_before_access_is_reported_and_retried() {
        let cache = cache_with(Arc::new(FailingStore));
        let request = user_request("a");
        let session = CacheSessionManager::new(&cache, &request);

        let result = session.find_access_token().await;
        assert!(matches!(result, Err(CacheError::Notification(_))));
        assert_eq!(session.cache_level(), CacheLevel::None);

        let result = cache
            .save_token_response(&request, &user_response("a", 3600))
            .await;
        assert!(matches!(result, Err(CacheError::Notification(_))));
        assert!(cache.accessor().get_all_access_tokens(None).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let store = Arc::new(BufferStore::default());
        let cache = cache_with(store.clone());
        let request = user_request("a");
        request.cancellation.cancel();
        let session = CacheSessionManager::new(&cache, &request);

        let result = session.find_access_token().await;
        assert!(matches!(result, Err(CacheError::Cancelled)));
        assert_eq!(store.before_access.load(Ordering::SeqCst), 0);
    }
}
