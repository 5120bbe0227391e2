// System identity resolution.
//
// Resolving the control plane's own identity is a read-only operation and
// the single sanctioned user of the UnsafeRead lock bypass. Resolution is
// idempotent: the same caller context always yields the same identity.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::UserDocument;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity resolution failed: {0}")]
    ResolutionFailed(String),
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_system_identity(&self) -> Result<UserDocument, IdentityError>;
}

/// Resolver backed by a fixed identity, used when the hosting environment
/// injects the system principal at startup.
pub struct StaticIdentityResolver {
    identity: UserDocument,
}

impl StaticIdentityResolver {
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            identity: UserDocument::system(system_id),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve_system_identity(&self) -> Result<UserDocument, IdentityError> {
        Ok(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UserRole, UserType};

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let resolver = StaticIdentityResolver::new("system-principal");
        let first = resolver.resolve_system_identity().await.unwrap();
        let second = resolver.resolve_system_identity().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.role, UserRole::Admin);
        assert_eq!(first.user_type, UserType::System);
    }
}
