//! Token cache
//!
//! Stores access tokens, refresh tokens, ID tokens and accounts, partitioned
//! by account or app key, and decides which cached credential satisfies a
//! request.

pub mod accessor;
pub mod cache;
pub mod items;
pub mod keys;
pub mod matching;
pub mod notify;
pub mod request;
pub mod scopes;
pub mod serialization;
pub mod session;

pub use accessor::{InMemoryPartitionedAccessor, TokenCacheAccessor};
pub use cache::{CachedAccount, SavedTokens, TenantProfile, TokenCache};
pub use items::{AccessTokenItem, AccountItem, AppMetadataItem, IdTokenItem, RefreshTokenItem};
pub use matching::{AccessTokenLookup, CacheRefreshReason, ScopeMatch};
pub use notify::{NotificationArgs, TokenCacheNotifications};
pub use request::{AccountId, ApiKind, Authority, TokenRequest, TokenResponse};
pub use scopes::ScopeSet;
pub use session::{CacheLevel, CacheSessionManager};
