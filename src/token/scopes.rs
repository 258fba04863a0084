//! Scope sets
//!
//! Scopes compare case-insensitively but keep the spelling they were first
//! seen with, so a cached `target` serializes back exactly as it was stored.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Scopes the identity provider adds to every request; ignored when matching
pub const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Case-insensitive set of OAuth scopes
#[derive(Clone, Default)]
pub struct ScopeSet {
    /// Lowercased scope -> original spelling
    scopes: BTreeMap<String, String>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space separated scope string
    pub fn parse(raw: &str) -> Self {
        raw.split_whitespace().collect()
    }

    pub fn insert(&mut self, scope: &str) {
        let scope = scope.trim();
        if scope.is_empty() {
            return;
        }
        self.scopes
            .entry(scope.to_lowercase())
            .or_insert_with(|| scope.to_string());
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains_key(&scope.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Scopes in their original spelling, ordered case-insensitively
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.values().map(String::as_str)
    }

    /// Copy of this set without `openid`, `profile` and `offline_access`
    pub fn without_reserved(&self) -> Self {
        Self {
            scopes: self
                .scopes
                .iter()
                .filter(|(lower, _)| !RESERVED_SCOPES.contains(&lower.as_str()))
                .map(|(lower, original)| (lower.clone(), original.clone()))
                .collect(),
        }
    }

    pub fn is_superset_of(&self, other: &ScopeSet) -> bool {
        other.scopes.keys().all(|scope| self.scopes.contains_key(scope))
    }

    pub fn intersects(&self, other: &ScopeSet) -> bool {
        other.scopes.keys().any(|scope| self.scopes.contains_key(scope))
    }

    /// Number of scopes present in both sets
    pub fn overlap(&self, other: &ScopeSet) -> usize {
        other
            .scopes
            .keys()
            .filter(|scope| self.scopes.contains_key(*scope))
            .count()
    }

    /// Lowercased, space separated form used inside cache keys
    pub fn key_string(&self) -> String {
        self.scopes.keys().cloned().collect::<Vec<_>>().join(" ")
    }
}

impl PartialEq for ScopeSet {
    fn eq(&self, other: &Self) -> bool {
        self.scopes.len() == other.scopes.len() && self.is_superset_of(other)
    }
}

impl Eq for ScopeSet {}

impl<S: AsRef<str>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = ScopeSet::new();
        for scope in iter {
            set.insert(scope.as_ref());
        }
        set
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.iter().collect::<Vec<_>>().join(" ");
        f.write_str(&joined)
    }
}

impl fmt::Debug for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for ScopeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScopeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ScopeSet::parse(&raw))
    }
}
