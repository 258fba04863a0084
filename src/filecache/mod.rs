//! Durable cross-process cache for opaque secret material
//!
//! Used for payloads that live outside the token cache, such as
//! proof-of-possession key material or attestation tokens.

pub mod envelope;
pub mod lock;
pub mod platform;
pub mod secure;

pub use envelope::Envelope;
pub use lock::{RefreshLock, RefreshLockFactory};
pub use platform::{current_platform, Platform};
pub use secure::{CacheValue, SecureFileCache};
