//! Token store access
//!
//! [`TokenCacheAccessor`] is the seam between the matching logic and the
//! storage. [`InMemoryPartitionedAccessor`] keeps one [`Partition`] per
//! partition key in an [`LruCache`], so the number of resident accounts is
//! bounded and lookups only touch one bucket.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use super::items::{AccessTokenItem, AccountItem, AppMetadataItem, IdTokenItem, RefreshTokenItem};
use crate::config::LruOptions;
use crate::error::Result;
use crate::lru::LruCache;

/// Storage operations used by the token cache.
///
/// `partition` of `None` means every partition.
pub trait TokenCacheAccessor: Send + Sync {
    fn save_access_token(&self, item: AccessTokenItem);
    fn save_refresh_token(&self, item: RefreshTokenItem);
    fn save_id_token(&self, item: IdTokenItem);
    fn save_account(&self, item: AccountItem);
    fn save_app_metadata(&self, item: AppMetadataItem);

    fn delete_access_token(&self, item: &AccessTokenItem);
    /// Delete the access token only if the stored copy is still `item`.
    ///
    /// Returns whether it was removed.
    fn delete_access_token_if_unchanged(&self, item: &AccessTokenItem) -> bool;
    fn delete_refresh_token(&self, item: &RefreshTokenItem);
    fn delete_id_token(&self, item: &IdTokenItem);
    fn delete_account(&self, item: &AccountItem);

    fn get_all_access_tokens(&self, partition: Option<&str>) -> Vec<AccessTokenItem>;
    fn get_all_refresh_tokens(&self, partition: Option<&str>) -> Vec<RefreshTokenItem>;
    fn get_all_id_tokens(&self, partition: Option<&str>) -> Vec<IdTokenItem>;
    fn get_all_accounts(&self, partition: Option<&str>) -> Vec<AccountItem>;
    fn get_all_app_metadata(&self) -> Vec<AppMetadataItem>;

    fn has_access_or_refresh_tokens(&self) -> bool;

    fn clear(&self);
}

/// All items of one account or app key
#[derive(Default)]
pub struct Partition {
    access_tokens: DashMap<String, AccessTokenItem>,
    refresh_tokens: DashMap<String, RefreshTokenItem>,
    id_tokens: DashMap<String, IdTokenItem>,
    accounts: DashMap<String, AccountItem>,
}

impl Partition {
    fn item_count(&self) -> usize {
        self.access_tokens.len() + self.refresh_tokens.len() + self.id_tokens.len() + self.accounts.len()
    }
}

fn collect<T: Clone>(map: &DashMap<String, T>) -> Vec<T> {
    map.iter().map(|entry| entry.value().clone()).collect()
}

/// In-memory accessor partitioned by partition key
pub struct InMemoryPartitionedAccessor {
    partitions: LruCache<String, Arc<Partition>>,
    app_metadata: DashMap<String, AppMetadataItem>,
}

impl InMemoryPartitionedAccessor {
    /// Create an accessor holding at most `max_partitions` partitions
    pub fn new(max_partitions: usize) -> Result<Self> {
        let partitions = LruCache::with_removal_callback(
            LruOptions::with_capacity(max_partitions),
            Arc::new(|partition: &Arc<Partition>| {
                debug!(items = partition.item_count(), "Evicted token cache partition");
            }),
        )?;

        Ok(Self {
            partitions,
            app_metadata: DashMap::new(),
        })
    }

    fn partition(&self, key: &str) -> Arc<Partition> {
        self.partitions
            .get_or_insert_with(key.to_string(), || Arc::new(Partition::default()))
    }

    fn existing_partition(&self, key: &str) -> Option<Arc<Partition>> {
        self.partitions.try_get(&key.to_string())
    }

    fn gather<T, F>(&self, partition: Option<&str>, select: F) -> Vec<T>
    where
        F: Fn(&Partition) -> Vec<T>,
    {
        match partition {
            Some(key) => self
                .existing_partition(key)
                .map(|p| select(p.as_ref()))
                .unwrap_or_default(),
            None => self
                .partitions
                .get_all()
                .iter()
                .flat_map(|p| select(p.as_ref()))
                .collect(),
        }
    }

    /// Number of resident partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

impl TokenCacheAccessor for InMemoryPartitionedAccessor {
    fn save_access_token(&self, item: AccessTokenItem) {
        let partition = item.partition_key();
        trace!(partition = %partition, "Saving access token");
        self.partition(&partition)
            .access_tokens
            .insert(item.cache_key(), item);
    }

    fn save_refresh_token(&self, item: RefreshTokenItem) {
        let partition = item.partition_key();
        self.partition(&partition)
            .refresh_tokens
            .insert(item.cache_key(), item);
    }

    fn save_id_token(&self, item: IdTokenItem) {
        let partition = item.partition_key();
        self.partition(&partition).id_tokens.insert(item.cache_key(), item);
    }

    fn save_account(&self, item: AccountItem) {
        let partition = item.partition_key();
        self.partition(&partition).accounts.insert(item.cache_key(), item);
    }

    fn save_app_metadata(&self, item: AppMetadataItem) {
        self.app_metadata.insert(item.cache_key(), item);
    }

    fn delete_access_token(&self, item: &AccessTokenItem) {
        if let Some(partition) = self.existing_partition(&item.partition_key()) {
            partition.access_tokens.remove(&item.cache_key());
        }
    }

    fn delete_access_token_if_unchanged(&self, item: &AccessTokenItem) -> bool {
        let Some(partition) = self.existing_partition(&item.partition_key()) else {
            return false;
        };
        partition
            .access_tokens
            .remove_if(&item.cache_key(), |_, stored| {
                stored.secret == item.secret
                    && stored.cached_at == item.cached_at
                    && stored.expires_on == item.expires_on
            })
            .is_some()
    }

    fn delete_refresh_token(&self, item: &RefreshTokenItem) {
        if let Some(partition) = self.existing_partition(&item.partition_key()) {
            partition.refresh_tokens.remove(&item.cache_key());
        }
    }

    fn delete_id_token(&self, item: &IdTokenItem) {
        if let Some(partition) = self.existing_partition(&item.partition_key()) {
            partition.id_tokens.remove(&item.cache_key());
        }
    }

    fn delete_account(&self, item: &AccountItem) {
        if let Some(partition) = self.existing_partition(&item.partition_key()) {
            partition.accounts.remove(&item.cache_key());
        }
    }

    fn get_all_access_tokens(&self, partition: Option<&str>) -> Vec<AccessTokenItem> {
        self.gather(partition, |p| collect(&p.access_tokens))
    }

    fn get_all_refresh_tokens(&self, partition: Option<&str>) -> Vec<RefreshTokenItem> {
        self.gather(partition, |p| collect(&p.refresh_tokens))
    }

    fn get_all_id_tokens(&self, partition: Option<&str>) -> Vec<IdTokenItem> {
        self.gather(partition, |p| collect(&p.id_tokens))
    }

    fn get_all_accounts(&self, partition: Option<&str>) -> Vec<AccountItem> {
        self.gather(partition, |p| collect(&p.accounts))
    }

    fn get_all_app_metadata(&self) -> Vec<AppMetadataItem> {
        collect(&self.app_metadata)
    }

    fn has_access_or_refresh_tokens(&self) -> bool {
        self.partitions
            .get_all()
            .iter()
            .any(|p| !p.access_tokens.is_empty() || !p.refresh_tokens.is_empty())
    }

    fn clear(&self) {
        self.partitions.clear();
        self.app_metadata.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::scopes::ScopeSet;

    fn access_token(home: &str, realm: &str, scopes: &str) -> AccessTokenItem {
        AccessTokenItem {
            home_account_id: home.to_string(),
            environment: "login.example.com".to_string(),
            realm: realm.to_string(),
            client_id: "client-1".to_string(),
            credential_type: "AccessToken".to_string(),
            secret: "secret".to_string(),
            target: ScopeSet::parse(scopes),
            cached_at: 0,
            expires_on: 3600,
            extended_expires_on: 3600,
            refresh_on: None,
            token_type: None,
            kid: None,
            user_assertion_hash: None,
            additional: Default::default(),
            is_extended_lifetime: false,
        }
    }

    #[test]
    fn test_items_land_in_their_partition() {
        let accessor = InMemoryPartitionedAccessor::new(100).unwrap();
        accessor.save_access_token(access_token("u1.t1", "t1", "a"));
        accessor.save_access_token(access_token("u2.t2", "t2", "a"));
        accessor.save_access_token(access_token("", "t1", "b"));

        assert_eq!(accessor.get_all_access_tokens(Some("u1.t1")).len(), 1);
        assert_eq!(accessor.get_all_access_tokens(Some("u2.t2")).len(), 1);
        assert_eq!(
            accessor
                .get_all_access_tokens(Some("client-1_t1_AppTokenCache"))
                .len(),
            1
        );
        assert_eq!(accessor.get_all_access_tokens(None).len(), 3);
        assert!(accessor.get_all_access_tokens(Some("missing")).is_empty());
        assert_eq!(accessor.partition_count(), 3);
    }

    #[test]
    fn test_same_key_overwrites_and_delete_removes() {
        let accessor = InMemoryPartitionedAccessor::new(100).unwrap();
        let mut item = access_token("u1.t1", "t1", "a b");
        accessor.save_access_token(item.clone());
        item.secret = "rotated".to_string();
        accessor.save_access_token(item.clone());

        let stored = accessor.get_all_access_tokens(Some("u1.t1"));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].secret, "rotated");

        accessor.delete_access_token(&item);
        assert!(accessor.get_all_access_tokens(Some("u1.t1")).is_empty());
        assert!(!accessor.has_access_or_refresh_tokens());
    }

    #[test]
    fn test_conditional_delete_keeps_replaced_token() {
        let accessor = InMemoryPartitionedAccessor::new(100).unwrap();
        let observed = access_token("u1.t1", "t1", "a");
        accessor.save_access_token(observed.clone());

        let mut replacement = observed.clone();
        replacement.secret = "fresh".to_string();
        replacement.cached_at = 100;
        replacement.expires_on = 7200;
        accessor.save_access_token(replacement.clone());

        assert!(!accessor.delete_access_token_if_unchanged(&observed));
        let stored = accessor.get_all_access_tokens(Some("u1.t1"));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].secret, "fresh");

        assert!(accessor.delete_access_token_if_unchanged(&replacement));
        assert!(accessor.get_all_access_tokens(Some("u1.t1")).is_empty());
        assert!(!accessor.delete_access_token_if_unchanged(&replacement));
    }

    #[test]
    fn test_clear_drops_everything() {
        let accessor = InMemoryPartitionedAccessor::new(100).unwrap();
        accessor.save_access_token(access_token("u1.t1", "t1", "a"));
        accessor.save_app_metadata(AppMetadataItem {
            client_id: "client-1".to_string(),
            environment: "login.example.com".to_string(),
            family_id: None,
            additional: Default::default(),
        });
        assert!(accessor.has_access_or_refresh_tokens());

        accessor.clear();
        assert!(accessor.get_all_access_tokens(None).is_empty());
        assert!(accessor.get_all_app_metadata().is_empty());
    }
}
