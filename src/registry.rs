//! Cache registry
//!
//! Owns the token caches and file caches of an application. Create one at the
//! application root and hand out references; nothing here is process-global.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{FileCacheOptions, TokenCacheOptions};
use crate::error::{CacheError, Result};
use crate::filecache::{current_platform, SecureFileCache};
use crate::token::TokenCache;

/// Shared caches keyed by client id and cache directory
pub struct CacheRegistry {
    token_defaults: TokenCacheOptions,
    /// User token caches by client id
    user_caches: DashMap<String, Arc<TokenCache>>,
    /// App-only token caches by client id
    app_caches: DashMap<String, Arc<TokenCache>>,
    /// File caches by resolved directory
    file_caches: DashMap<PathBuf, Arc<SecureFileCache>>,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(TokenCacheOptions::default())
    }
}

impl CacheRegistry {
    /// Create a registry; `token_defaults` applies to every token cache it creates
    pub fn new(token_defaults: TokenCacheOptions) -> Self {
        Self {
            token_defaults,
            user_caches: DashMap::new(),
            app_caches: DashMap::new(),
            file_caches: DashMap::new(),
        }
    }

    fn options_for(&self, client_id: &str) -> TokenCacheOptions {
        TokenCacheOptions {
            client_id: client_id.to_string(),
            ..self.token_defaults.clone()
        }
    }

    /// Token cache for user tokens of `client_id`, created on first use
    pub fn user_token_cache(&self, client_id: &str) -> Result<Arc<TokenCache>> {
        if let Some(cache) = self.user_caches.get(client_id) {
            return Ok(Arc::clone(cache.value()));
        }
        let entry = self
            .user_caches
            .entry(client_id.to_string())
            .or_try_insert_with(|| TokenCache::new(self.options_for(client_id)).map(Arc::new))?;
        Ok(Arc::clone(entry.value()))
    }

    /// Token cache for app-only tokens of `client_id`, created on first use
    pub fn app_token_cache(&self, client_id: &str) -> Result<Arc<TokenCache>> {
        if let Some(cache) = self.app_caches.get(client_id) {
            return Ok(Arc::clone(cache.value()));
        }
        let entry = self
            .app_caches
            .entry(client_id.to_string())
            .or_try_insert_with(|| {
                TokenCache::new(self.options_for(client_id))
                    .map(|cache| Arc::new(cache.as_application_cache()))
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// File cache for the directory `options` resolves to, created on first use
    pub fn file_cache(&self, options: FileCacheOptions) -> Result<Arc<SecureFileCache>> {
        let directory = match &options.base_directory {
            Some(dir) => dir.clone(),
            None => current_platform().default_base_directory().ok_or_else(|| {
                CacheError::InvalidArgument(
                    "no per-user directory found; configure base_directory".to_string(),
                )
            })?,
        };

        if let Some(cache) = self.file_caches.get(&directory) {
            return Ok(Arc::clone(cache.value()));
        }
        let entry = self
            .file_caches
            .entry(directory.clone())
            .or_try_insert_with(|| {
                SecureFileCache::new(FileCacheOptions {
                    base_directory: Some(directory),
                    ..options
                })
                .map(Arc::new)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Clear every token cache the registry owns
    pub async fn clear_token_caches(&self, cancellation: &CancellationToken) -> Result<()> {
        let caches: Vec<Arc<TokenCache>> = self
            .user_caches
            .iter()
            .chain(self.app_caches.iter())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for cache in &caches {
            cache.clear(cancellation).await?;
        }
        info!(caches = caches.len(), "Cleared all token caches");
        Ok(())
    }

    pub fn token_cache_count(&self) -> usize {
        self.user_caches.len() + self.app_caches.len()
    }
}
