// Commit handlers, one per command family.
//
// A handler applies the control-plane mutation for a command kind against
// the repository collaborator, after authorizing every entity it writes
// against the instance's lock set. Commits are idempotent under replay: a
// retried create that already landed reads back as applied instead of
// failing, and a retried delete of an already-removed document is applied
// too. Handlers are resolved by command name from an explicit registry
// that fails closed on unknown names.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::activity::ActivityFailure;
use crate::lock::{EntityKind, LockError, LockSet};
use crate::model::{CommandKind, ProjectDocument, UserDocument};
use crate::repository::{Repositories, RepositoryError};

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Apply the command's mutation. Every entity the handler writes must
    /// be covered by a live token in `locks`; without one the commit is
    /// refused before any repository call. Returns the committed document
    /// as the workflow result payload.
    async fn commit(
        &self,
        repos: &Repositories,
        kind: &CommandKind,
        locks: &LockSet,
    ) -> Result<serde_json::Value, ActivityFailure>;
}

fn storage_failure(err: RepositoryError) -> ActivityFailure {
    match err {
        RepositoryError::Storage(message) => ActivityFailure::transient(message),
        other => ActivityFailure::permanent(other.to_string()),
    }
}

// A lost or missing lock cannot be cured by retrying inside the instance
fn lock_failure(err: LockError) -> ActivityFailure {
    ActivityFailure::permanent(err.to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ActivityFailure> {
    serde_json::to_value(value).map_err(|e| ActivityFailure::permanent(e.to_string()))
}

/// Project create, update and delete
pub struct ProjectHandler;

#[async_trait]
impl CommandHandler for ProjectHandler {
    async fn commit(
        &self,
        repos: &Repositories,
        kind: &CommandKind,
        locks: &LockSet,
    ) -> Result<serde_json::Value, ActivityFailure> {
        if let Some(project_id) = kind.target_project_id() {
            locks
                .authorize_write(EntityKind::Project, project_id)
                .await
                .map_err(lock_failure)?;
        }
        match kind {
            CommandKind::ProjectCreate(project) => {
                match repos.projects.add(project.clone()).await {
                    Ok(stored) => to_value(&stored),
                    // A replayed commit that already landed
                    Err(err) if err.is_conflict() => {
                        debug!(project = %project.id, "create already applied");
                        let stored = repos
                            .projects
                            .get(&project.id)
                            .await
                            .map_err(storage_failure)?;
                        to_value(&stored)
                    }
                    Err(err) => Err(storage_failure(err)),
                }
            }
            CommandKind::ProjectUpdate(project) => {
                let stored = repos
                    .projects
                    .update(project.clone())
                    .await
                    .map_err(storage_failure)?;
                to_value(&stored)
            }
            CommandKind::ProjectDelete(project) => {
                match repos.projects.delete(&project.id).await {
                    Ok(()) => {}
                    // Already removed by an earlier attempt
                    Err(err) if err.is_not_found() => {
                        debug!(project = %project.id, "delete already applied");
                    }
                    Err(err) => return Err(storage_failure(err)),
                }
                Ok(serde_json::json!({ "deleted": project.id }))
            }
            other => Err(ActivityFailure::permanent(format!(
                "project handler cannot commit '{}'",
                other.name()
            ))),
        }
    }
}

/// Project membership mutations. The project document's user list is
/// authoritative; the user repository is upserted to match.
pub struct ProjectUserHandler;

impl ProjectUserHandler {
    async fn upsert_user(
        repos: &Repositories,
        user: &UserDocument,
    ) -> Result<(), ActivityFailure> {
        match repos.users.update(user.clone()).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => match repos.users.add(user.clone()).await {
                Ok(_) => Ok(()),
                Err(err) if err.is_conflict() => Ok(()),
                Err(err) => Err(storage_failure(err)),
            },
            Err(err) => Err(storage_failure(err)),
        }
    }

    async fn load_project(
        repos: &Repositories,
        project_id: &str,
    ) -> Result<ProjectDocument, ActivityFailure> {
        repos.projects.get(project_id).await.map_err(storage_failure)
    }
}

#[async_trait]
impl CommandHandler for ProjectUserHandler {
    async fn commit(
        &self,
        repos: &Repositories,
        kind: &CommandKind,
        locks: &LockSet,
    ) -> Result<serde_json::Value, ActivityFailure> {
        // Membership commits write both the project document and the user
        // document; each needs its own live token.
        if let CommandKind::ProjectUserCreate { project_id, user }
        | CommandKind::ProjectUserUpdate { project_id, user }
        | CommandKind::ProjectUserDelete { project_id, user } = kind
        {
            locks
                .authorize_write(EntityKind::Project, project_id)
                .await
                .map_err(lock_failure)?;
            locks
                .authorize_write(EntityKind::User, &user.id)
                .await
                .map_err(lock_failure)?;
        }
        match kind {
            CommandKind::ProjectUserCreate { project_id, user }
            | CommandKind::ProjectUserUpdate { project_id, user } => {
                let mut project = Self::load_project(repos, project_id).await?;
                match project.users.iter_mut().find(|u| u.id == user.id) {
                    Some(existing) => *existing = user.clone(),
                    None => project.users.push(user.clone()),
                }
                let stored = repos
                    .projects
                    .update(project)
                    .await
                    .map_err(storage_failure)?;
                Self::upsert_user(repos, user).await?;
                info!(project = %project_id, user = %user.id, "project membership committed");
                to_value(&stored)
            }
            CommandKind::ProjectUserDelete { project_id, user } => {
                let mut project = Self::load_project(repos, project_id).await?;
                // Absence means an earlier attempt already removed it
                project.users.retain(|u| u.id != user.id);
                let stored = repos
                    .projects
                    .update(project)
                    .await
                    .map_err(storage_failure)?;
                to_value(&stored)
            }
            other => Err(ActivityFailure::permanent(format!(
                "project user handler cannot commit '{}'",
                other.name()
            ))),
        }
    }
}

/// Provider data create, update and delete
pub struct ProviderDataHandler;

#[async_trait]
impl CommandHandler for ProviderDataHandler {
    async fn commit(
        &self,
        repos: &Repositories,
        kind: &CommandKind,
        locks: &LockSet,
    ) -> Result<serde_json::Value, ActivityFailure> {
        if let CommandKind::ProviderDataCreate(data)
        | CommandKind::ProviderDataUpdate(data)
        | CommandKind::ProviderDataDelete(data) = kind
        {
            locks
                .authorize_write(EntityKind::ProviderData, &data.id)
                .await
                .map_err(lock_failure)?;
        }
        match kind {
            CommandKind::ProviderDataCreate(data) => {
                match repos.provider_data.add(data.clone()).await {
                    Ok(stored) => to_value(&stored),
                    Err(err) if err.is_conflict() => {
                        debug!(data = %data.id, "create already applied");
                        let stored = repos
                            .provider_data
                            .get(&data.id)
                            .await
                            .map_err(storage_failure)?;
                        to_value(&stored)
                    }
                    Err(err) => Err(storage_failure(err)),
                }
            }
            CommandKind::ProviderDataUpdate(data) => {
                let stored = repos
                    .provider_data
                    .update(data.clone())
                    .await
                    .map_err(storage_failure)?;
                to_value(&stored)
            }
            CommandKind::ProviderDataDelete(data) => {
                match repos.provider_data.delete(&data.id).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        debug!(data = %data.id, "delete already applied");
                    }
                    Err(err) => return Err(storage_failure(err)),
                }
                Ok(serde_json::json!({ "deleted": data.id }))
            }
            other => Err(ActivityFailure::permanent(format!(
                "provider data handler cannot commit '{}'",
                other.name()
            ))),
        }
    }
}

/// Provider registration create, update and delete. Registrations never
/// fan out; a provider is not told about its own lifecycle.
pub struct ProviderHandler;

#[async_trait]
impl CommandHandler for ProviderHandler {
    async fn commit(
        &self,
        repos: &Repositories,
        kind: &CommandKind,
        locks: &LockSet,
    ) -> Result<serde_json::Value, ActivityFailure> {
        if let CommandKind::ProviderCreate(provider)
        | CommandKind::ProviderUpdate(provider)
        | CommandKind::ProviderDelete(provider) = kind
        {
            locks
                .authorize_write(EntityKind::Provider, &provider.id)
                .await
                .map_err(lock_failure)?;
        }
        match kind {
            CommandKind::ProviderCreate(provider) => {
                match repos.providers.add(provider.clone()).await {
                    Ok(stored) => to_value(&stored),
                    Err(err) if err.is_conflict() => {
                        debug!(provider = %provider.id, "registration already applied");
                        let stored = repos
                            .providers
                            .get(&provider.id)
                            .await
                            .map_err(storage_failure)?;
                        to_value(&stored)
                    }
                    Err(err) => Err(storage_failure(err)),
                }
            }
            CommandKind::ProviderUpdate(provider) => {
                let stored = repos
                    .providers
                    .update(provider.clone())
                    .await
                    .map_err(storage_failure)?;
                to_value(&stored)
            }
            CommandKind::ProviderDelete(provider) => {
                match repos.providers.delete(&provider.id).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        debug!(provider = %provider.id, "unregistration already applied");
                    }
                    Err(err) => return Err(storage_failure(err)),
                }
                info!(provider = %provider.id, "provider unregistered");
                Ok(serde_json::json!({ "deleted": provider.id }))
            }
            other => Err(ActivityFailure::permanent(format!(
                "provider handler cannot commit '{}'",
                other.name()
            ))),
        }
    }
}

/// Explicit name-to-handler map. Lookup fails closed: an unregistered
/// command name is an engine error, never a silent no-op.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry covering every built-in command kind
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let project: Arc<dyn CommandHandler> = Arc::new(ProjectHandler);
        let project_user: Arc<dyn CommandHandler> = Arc::new(ProjectUserHandler);
        let provider: Arc<dyn CommandHandler> = Arc::new(ProviderHandler);
        let provider_data: Arc<dyn CommandHandler> = Arc::new(ProviderDataHandler);

        registry.register("project_create", project.clone());
        registry.register("project_update", project.clone());
        registry.register("project_delete", project);
        registry.register("project_user_create", project_user.clone());
        registry.register("project_user_update", project_user.clone());
        registry.register("project_user_delete", project_user);
        registry.register("provider_create", provider.clone());
        registry.register("provider_update", provider.clone());
        registry.register("provider_delete", provider);
        registry.register("provider_data_create", provider_data.clone());
        registry.register("provider_data_update", provider_data.clone());
        registry.register("provider_data_delete", provider_data);
        registry
    }

    pub fn register(&mut self, name: &'static str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{EntityLockManager, LockKey, LockMode, WaitPolicy};
    use crate::model::{ProjectType, ProviderDataDocument, ProviderDocument, UserRole};
    use uuid::Uuid;

    fn sample_project() -> ProjectDocument {
        ProjectDocument::new("proj-1", "Sample", ProjectType::new("default", vec![]))
    }

    async fn granted(kind: &CommandKind) -> LockSet {
        let locks = EntityLockManager::new();
        let instance = Uuid::new_v4();
        let mut tokens = Vec::new();
        for (entity, id) in kind.lock_targets() {
            tokens.push(
                locks
                    .acquire(
                        LockKey::new(entity, id),
                        LockMode::Exclusive,
                        instance,
                        WaitPolicy::FailFast,
                    )
                    .await
                    .unwrap(),
            );
        }
        LockSet::new(locks, tokens)
    }

    fn no_locks() -> LockSet {
        LockSet::new(EntityLockManager::new(), Vec::new())
    }

    #[test]
    fn default_registry_covers_all_kinds() {
        let registry = HandlerRegistry::with_defaults();
        for name in [
            "project_create",
            "project_update",
            "project_delete",
            "project_user_create",
            "project_user_update",
            "project_user_delete",
            "provider_create",
            "provider_update",
            "provider_delete",
            "provider_data_create",
            "provider_data_update",
            "provider_data_delete",
        ] {
            assert!(registry.get(name).is_some(), "missing handler for {name}");
        }
        assert!(registry.get("unknown_command").is_none());
    }

    #[tokio::test]
    async fn project_create_commit_is_idempotent() {
        let repos = Repositories::in_memory();
        let kind = CommandKind::ProjectCreate(sample_project());
        let grant = granted(&kind).await;

        let first = ProjectHandler.commit(&repos, &kind, &grant).await.unwrap();
        let second = ProjectHandler.commit(&repos, &kind, &grant).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(repos.projects.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn project_delete_commit_is_idempotent() {
        let repos = Repositories::in_memory();
        let project = sample_project();
        repos.projects.add(project.clone()).await.unwrap();
        let kind = CommandKind::ProjectDelete(project);
        let grant = granted(&kind).await;

        ProjectHandler.commit(&repos, &kind, &grant).await.unwrap();
        ProjectHandler.commit(&repos, &kind, &grant).await.unwrap();
        assert!(repos.projects.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn project_update_of_missing_project_fails() {
        let repos = Repositories::in_memory();
        let kind = CommandKind::ProjectUpdate(sample_project());
        let grant = granted(&kind).await;
        let err = ProjectHandler.commit(&repos, &kind, &grant).await.unwrap_err();
        assert_eq!(err.kind, crate::activity::FailureKind::Permanent);
    }

    #[tokio::test]
    async fn commit_without_lock_token_is_refused() {
        let repos = Repositories::in_memory();
        let kind = CommandKind::ProjectCreate(sample_project());

        let err = ProjectHandler.commit(&repos, &kind, &no_locks()).await.unwrap_err();
        assert_eq!(err.kind, crate::activity::FailureKind::Permanent);
        assert!(err.message.contains("no lock token"));
        // Nothing was written
        assert!(repos.projects.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn membership_commit_requires_a_token_per_entity() {
        let repos = Repositories::in_memory();
        repos.projects.add(sample_project()).await.unwrap();
        let kind = CommandKind::ProjectUserCreate {
            project_id: "proj-1".to_string(),
            user: UserDocument::new("u1", UserRole::Member),
        };

        // Token for the project only; the user entity is uncovered
        let locks = EntityLockManager::new();
        let token = locks
            .acquire(
                LockKey::new(EntityKind::Project, "proj-1"),
                LockMode::Exclusive,
                Uuid::new_v4(),
                WaitPolicy::FailFast,
            )
            .await
            .unwrap();
        let partial = LockSet::new(locks, vec![token]);

        let err = ProjectUserHandler.commit(&repos, &kind, &partial).await.unwrap_err();
        assert!(err.message.contains("no lock token"));
        assert!(repos.projects.get("proj-1").await.unwrap().users.is_empty());
    }

    #[tokio::test]
    async fn membership_create_updates_project_and_user_repo() {
        let repos = Repositories::in_memory();
        repos.projects.add(sample_project()).await.unwrap();
        let user = UserDocument::new("u1", UserRole::Member);
        let kind = CommandKind::ProjectUserCreate {
            project_id: "proj-1".to_string(),
            user: user.clone(),
        };
        let grant = granted(&kind).await;

        ProjectUserHandler.commit(&repos, &kind, &grant).await.unwrap();

        let project = repos.projects.get("proj-1").await.unwrap();
        assert_eq!(project.users, vec![user.clone()]);
        assert_eq!(repos.users.get("u1").await.unwrap(), user);
    }

    #[tokio::test]
    async fn membership_create_replay_does_not_duplicate() {
        let repos = Repositories::in_memory();
        repos.projects.add(sample_project()).await.unwrap();
        let kind = CommandKind::ProjectUserCreate {
            project_id: "proj-1".to_string(),
            user: UserDocument::new("u1", UserRole::Member),
        };
        let grant = granted(&kind).await;

        ProjectUserHandler.commit(&repos, &kind, &grant).await.unwrap();
        ProjectUserHandler.commit(&repos, &kind, &grant).await.unwrap();

        let project = repos.projects.get("proj-1").await.unwrap();
        assert_eq!(project.users.len(), 1);
    }

    #[tokio::test]
    async fn membership_delete_removes_user_from_project() {
        let repos = Repositories::in_memory();
        let mut project = sample_project();
        let user = UserDocument::new("u1", UserRole::Member);
        project.users.push(user.clone());
        repos.projects.add(project).await.unwrap();

        let kind = CommandKind::ProjectUserDelete {
            project_id: "proj-1".to_string(),
            user,
        };
        let grant = granted(&kind).await;
        ProjectUserHandler.commit(&repos, &kind, &grant).await.unwrap();
        assert!(repos.projects.get("proj-1").await.unwrap().users.is_empty());
    }

    #[tokio::test]
    async fn provider_data_create_commit_is_idempotent() {
        let repos = Repositories::in_memory();
        let data = ProviderDataDocument::project_scoped(
            "d1",
            "p1",
            "proj-1",
            "endpoint",
            serde_json::json!("value"),
        );
        let kind = CommandKind::ProviderDataCreate(data);
        let grant = granted(&kind).await;

        ProviderDataHandler.commit(&repos, &kind, &grant).await.unwrap();
        ProviderDataHandler.commit(&repos, &kind, &grant).await.unwrap();
        assert_eq!(
            repos
                .provider_data
                .list("p1", Some("proj-1"), false)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn handler_rejects_foreign_kind() {
        let repos = Repositories::in_memory();
        let kind = CommandKind::ProjectCreate(sample_project());
        let grant = granted(&kind).await;
        let err = ProviderDataHandler.commit(&repos, &kind, &grant).await.unwrap_err();
        assert_eq!(err.kind, crate::activity::FailureKind::Permanent);
    }

    #[tokio::test]
    async fn provider_registration_commit_is_idempotent() {
        let repos = Repositories::in_memory();
        let kind = CommandKind::ProviderCreate(ProviderDocument::new("p1", "http://p1.local"));
        let grant = granted(&kind).await;

        let first = ProviderHandler.commit(&repos, &kind, &grant).await.unwrap();
        let second = ProviderHandler.commit(&repos, &kind, &grant).await.unwrap();
        assert_eq!(first, second);
        assert!(repos.providers.get("p1").await.is_ok());
    }

    #[tokio::test]
    async fn provider_unregistration_commit_is_idempotent() {
        let repos = Repositories::in_memory();
        let provider = ProviderDocument::new("p1", "http://p1.local");
        repos.providers.add(provider.clone()).await.unwrap();
        let kind = CommandKind::ProviderDelete(provider);
        let grant = granted(&kind).await;

        ProviderHandler.commit(&repos, &kind, &grant).await.unwrap();
        ProviderHandler.commit(&repos, &kind, &grant).await.unwrap();
        assert!(repos.providers.get("p1").await.is_err());
    }
}
