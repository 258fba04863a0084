//! Credential Cache Error Types
//!
//! Structured error handling for the cache engine.
//! Benign conditions (miss, corruption, near-expiry) never reach this type;
//! only structural failures are surfaced to callers.

/// Number of leading characters kept when describing unparseable input
const CONTEXT_PREVIEW_CHARS: usize = 8;

/// Errors surfaced by the credential cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Multiple access tokens matched the request; provide an account to disambiguate")]
    MultipleTokensMatched,

    #[error("Timed out acquiring the refresh lock for {bucket}/{key_id}")]
    LockTimeout { bucket: String, key_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to deserialize {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cache value factory failed: {0}")]
    Factory(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Notification hook failed: {0}")]
    Notification(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CacheError {
    /// Wrap a JSON parse failure, keeping only a short non-secret preview of the input
    pub fn serialization(what: &str, input: &[u8], source: serde_json::Error) -> Self {
        let preview: String = String::from_utf8_lossy(input)
            .chars()
            .take(CONTEXT_PREVIEW_CHARS)
            .collect();
        CacheError::Serialization {
            context: format!("{} (starts with {:?})", what, preview),
            source,
        }
    }

    /// Wrap an arbitrary factory error
    pub fn factory<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        CacheError::Factory(err.into())
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::LockTimeout { .. } | CacheError::Io(_) | CacheError::Factory(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_preview_is_truncated() {
        let input = br#"{"AccessToken": {"secret": "very-secret-value"}}"#;
        let source = serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err();
        let err = CacheError::serialization("token cache", input, source);
        let message = match &err {
            CacheError::Serialization { context, .. } => context.clone(),
            _ => panic!("Expected Serialization error"),
        };
        assert!(message.contains("{\\\"Access"));
        assert!(!message.contains("very-secret-value"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(CacheError::LockTimeout {
            bucket: "b".to_string(),
            key_id: "k".to_string()
        }
        .is_retryable());
        assert!(!CacheError::MultipleTokensMatched.is_retryable());
        assert!(!CacheError::Cancelled.is_retryable());
    }
}
