use crate::error::{CrpcError, Result};
use crpc_types::AgentId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Maps external handles (DIDs, account names, keys) to protocol identities.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, handle: &str) -> Result<AgentId>;
}

/// Derives the identity by hashing the handle. Any non-empty handle resolves.
#[derive(Debug, Default, Clone, Copy)]
pub struct DerivedIdentityResolver;

impl IdentityResolver for DerivedIdentityResolver {
    fn resolve(&self, handle: &str) -> Result<AgentId> {
        let handle = handle.trim();
        if handle.is_empty() {
            return Err(CrpcError::IdentityResolution("empty handle".to_string()));
        }
        Ok(AgentId::derive(handle.as_bytes()))
    }
}

/// Fixed directory of known handles.
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    entries: RwLock<HashMap<String, AgentId>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: impl Into<String>, agent: AgentId) -> Option<AgentId> {
        self.entries.write().insert(handle.into(), agent)
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, handle: &str) -> Result<AgentId> {
        self.entries
            .read()
            .get(handle)
            .copied()
            .ok_or_else(|| CrpcError::IdentityResolution(format!("unknown handle {}", handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_resolver() {
        let resolver = DerivedIdentityResolver;
        assert_eq!(
            resolver.resolve("did:key:alice").unwrap(),
            AgentId::derive(b"did:key:alice")
        );
        assert!(resolver.resolve("  ").is_err());
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticIdentityResolver::new();
        let bob = AgentId::derive(b"bob");
        resolver.insert("bob", bob);
        assert_eq!(resolver.resolve("bob").unwrap(), bob);
        assert!(matches!(
            resolver.resolve("carol"),
            Err(CrpcError::IdentityResolution(_))
        ));
    }
}
