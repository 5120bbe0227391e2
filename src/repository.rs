// Repository collaborator contracts.
//
// The engine consumes these, it never owns the store. Every operation
// fails with a distinguishable NotFound instead of a generic error so the
// orchestrator can reject missing references before a workflow starts.
// The in-memory implementation backs tests and local integration runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::model::{ProjectDocument, ProviderDataDocument, ProviderDocument, UserDocument};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} '{id}' already exists")]
    Conflict { entity: &'static str, id: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict { .. })
    }
}

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<ProjectDocument, RepositoryError>;
    async fn list(&self) -> Result<Vec<ProjectDocument>, RepositoryError>;
    async fn add(&self, project: ProjectDocument) -> Result<ProjectDocument, RepositoryError>;
    async fn update(&self, project: ProjectDocument) -> Result<ProjectDocument, RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<UserDocument, RepositoryError>;
    async fn list(&self) -> Result<Vec<UserDocument>, RepositoryError>;
    async fn add(&self, user: UserDocument) -> Result<UserDocument, RepositoryError>;
    async fn update(&self, user: UserDocument) -> Result<UserDocument, RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<ProviderDocument, RepositoryError>;
    async fn list(&self) -> Result<Vec<ProviderDocument>, RepositoryError>;
    async fn add(&self, provider: ProviderDocument) -> Result<ProviderDocument, RepositoryError>;
    async fn update(&self, provider: ProviderDocument)
        -> Result<ProviderDocument, RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ProviderDataRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<ProviderDataDocument, RepositoryError>;
    /// Project-scoped items for one provider, optionally including shared
    /// system-scoped items
    async fn list(
        &self,
        provider_id: &str,
        project_id: Option<&str>,
        include_shared: bool,
    ) -> Result<Vec<ProviderDataDocument>, RepositoryError>;
    async fn add(
        &self,
        data: ProviderDataDocument,
    ) -> Result<ProviderDataDocument, RepositoryError>;
    async fn update(
        &self,
        data: ProviderDataDocument,
    ) -> Result<ProviderDataDocument, RepositoryError>;
    async fn delete(&self, id: &str) -> Result<(), RepositoryError>;
}

/// Bundle of repository handles the engine carries around
#[derive(Clone)]
pub struct Repositories {
    pub projects: Arc<dyn ProjectRepository>,
    pub users: Arc<dyn UserRepository>,
    pub providers: Arc<dyn ProviderRepository>,
    pub provider_data: Arc<dyn ProviderDataRepository>,
}

impl Repositories {
    /// Fully in-memory bundle for tests and local runs
    pub fn in_memory() -> Self {
        Self {
            projects: Arc::new(InMemoryProjectRepository::default()),
            users: Arc::new(InMemoryUserRepository::default()),
            providers: Arc::new(InMemoryProviderRepository::default()),
            provider_data: Arc::new(InMemoryProviderDataRepository::default()),
        }
    }
}

macro_rules! in_memory_repository {
    ($name:ident, $doc:ty, $entity:literal) => {
        #[derive(Default)]
        pub struct $name {
            items: RwLock<HashMap<String, $doc>>,
        }

        impl $name {
            async fn get_inner(&self, id: &str) -> Result<$doc, RepositoryError> {
                self.items.read().await.get(id).cloned().ok_or_else(|| {
                    RepositoryError::NotFound {
                        entity: $entity,
                        id: id.to_string(),
                    }
                })
            }

            async fn add_inner(&self, doc: $doc) -> Result<$doc, RepositoryError> {
                let mut items = self.items.write().await;
                if items.contains_key(&doc.id) {
                    return Err(RepositoryError::Conflict {
                        entity: $entity,
                        id: doc.id.clone(),
                    });
                }
                items.insert(doc.id.clone(), doc.clone());
                Ok(doc)
            }

            async fn update_inner(&self, doc: $doc) -> Result<$doc, RepositoryError> {
                let mut items = self.items.write().await;
                if !items.contains_key(&doc.id) {
                    return Err(RepositoryError::NotFound {
                        entity: $entity,
                        id: doc.id.clone(),
                    });
                }
                items.insert(doc.id.clone(), doc.clone());
                Ok(doc)
            }

            async fn delete_inner(&self, id: &str) -> Result<(), RepositoryError> {
                let mut items = self.items.write().await;
                items
                    .remove(id)
                    .map(|_| ())
                    .ok_or_else(|| RepositoryError::NotFound {
                        entity: $entity,
                        id: id.to_string(),
                    })
            }
        }
    };
}

in_memory_repository!(InMemoryProjectRepository, ProjectDocument, "project");
in_memory_repository!(InMemoryUserRepository, UserDocument, "user");
in_memory_repository!(InMemoryProviderRepository, ProviderDocument, "provider");
in_memory_repository!(
    InMemoryProviderDataRepository,
    ProviderDataDocument,
    "provider_data"
);

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn get(&self, id: &str) -> Result<ProjectDocument, RepositoryError> {
        self.get_inner(id).await
    }

    async fn list(&self) -> Result<Vec<ProjectDocument>, RepositoryError> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn add(&self, project: ProjectDocument) -> Result<ProjectDocument, RepositoryError> {
        self.add_inner(project).await
    }

    async fn update(&self, project: ProjectDocument) -> Result<ProjectDocument, RepositoryError> {
        self.update_inner(project).await
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.delete_inner(id).await
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn get(&self, id: &str) -> Result<UserDocument, RepositoryError> {
        self.get_inner(id).await
    }

    async fn list(&self) -> Result<Vec<UserDocument>, RepositoryError> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn add(&self, user: UserDocument) -> Result<UserDocument, RepositoryError> {
        self.add_inner(user).await
    }

    async fn update(&self, user: UserDocument) -> Result<UserDocument, RepositoryError> {
        self.update_inner(user).await
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.delete_inner(id).await
    }
}

#[async_trait]
impl ProviderRepository for InMemoryProviderRepository {
    async fn get(&self, id: &str) -> Result<ProviderDocument, RepositoryError> {
        self.get_inner(id).await
    }

    async fn list(&self) -> Result<Vec<ProviderDocument>, RepositoryError> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn add(&self, provider: ProviderDocument) -> Result<ProviderDocument, RepositoryError> {
        self.add_inner(provider).await
    }

    async fn update(
        &self,
        provider: ProviderDocument,
    ) -> Result<ProviderDocument, RepositoryError> {
        self.update_inner(provider).await
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.delete_inner(id).await
    }
}

#[async_trait]
impl ProviderDataRepository for InMemoryProviderDataRepository {
    async fn get(&self, id: &str) -> Result<ProviderDataDocument, RepositoryError> {
        self.get_inner(id).await
    }

    async fn list(
        &self,
        provider_id: &str,
        project_id: Option<&str>,
        include_shared: bool,
    ) -> Result<Vec<ProviderDataDocument>, RepositoryError> {
        use crate::model::ProviderDataScope;
        let items = self.items.read().await;
        Ok(items
            .values()
            .filter(|d| d.provider_id == provider_id)
            .filter(|d| match d.scope {
                ProviderDataScope::Project => d.project_id.as_deref() == project_id,
                ProviderDataScope::System => include_shared,
            })
            .cloned()
            .collect())
    }

    async fn add(
        &self,
        data: ProviderDataDocument,
    ) -> Result<ProviderDataDocument, RepositoryError> {
        self.add_inner(data).await
    }

    async fn update(
        &self,
        data: ProviderDataDocument,
    ) -> Result<ProviderDataDocument, RepositoryError> {
        self.update_inner(data).await
    }

    async fn delete(&self, id: &str) -> Result<(), RepositoryError> {
        self.delete_inner(id).await
    }
}
