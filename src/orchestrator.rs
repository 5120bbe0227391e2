// Command orchestrator, the boundary of the control plane.
//
// Validates referential integrity before any workflow instance starts, so
// a command that names a missing project or an unsubscribed provider is
// rejected synchronously instead of failing halfway through execution.
// Accepted commands run as background instances; callers follow progress
// through a CommandHandle. Submitting a correlation id that is already
// running or recorded joins the existing instance instead of starting a
// duplicate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};
use uuid::Uuid;

use crate::model::{
    Command, CommandKind, CommandResult, ProjectDocument, ProviderDataDocument,
    ProviderDataScope, ProviderDocument, UserDocument,
};
use crate::repository::{Repositories, RepositoryError};
use crate::workflow::history::HistoryError;
use crate::workflow::WorkflowEngine;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} '{id}' not found")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Caller-side view of a running or finished instance
#[derive(Debug, Clone)]
pub struct CommandHandle {
    correlation_id: Uuid,
    status: watch::Receiver<CommandResult>,
}

impl CommandHandle {
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Latest published result, terminal or not
    pub fn latest(&self) -> CommandResult {
        self.status.borrow().clone()
    }

    /// Wait until the instance reaches a terminal status
    pub async fn wait(&mut self) -> CommandResult {
        if let Ok(result) = self.status.wait_for(|result| result.is_terminal()).await {
            return result.clone();
        }
        // Publisher gone; the last published value is all there is
        self.status.borrow().clone()
    }
}

struct InstanceEntry {
    status: watch::Receiver<CommandResult>,
    cancel: watch::Sender<bool>,
}

pub struct Orchestrator {
    engine: Arc<WorkflowEngine>,
    repos: Repositories,
    base_endpoint: String,
    /// Only instances still running; terminal instances are pruned and
    /// durable history answers for them from then on
    instances: Arc<Mutex<HashMap<Uuid, InstanceEntry>>>,
}

impl Orchestrator {
    pub fn new(engine: Arc<WorkflowEngine>, repos: Repositories, base_endpoint: impl Into<String>) -> Self {
        Self {
            engine,
            repos,
            base_endpoint: base_endpoint.into(),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Assemble the full engine stack from configuration, with the static
    /// system identity the configuration names. History goes to the
    /// configured directory unless persistence is disabled, in which case
    /// instances do not survive a restart.
    pub fn from_config(config: &crate::config::GroundworkConfig, repos: Repositories) -> Self {
        let identity: Arc<dyn crate::identity::IdentityResolver> = Arc::new(
            crate::identity::StaticIdentityResolver::new(config.orchestration.system_identity.as_str()),
        );
        let store: Arc<dyn crate::workflow::HistoryStore> = if config.persistence.enable_persistence
        {
            Arc::new(crate::workflow::FileSystemHistoryStore::new(
                config.persistence.directory.clone(),
            ))
        } else {
            Arc::new(crate::workflow::InMemoryHistoryStore::default())
        };

        let engine = WorkflowEngine::new(
            repos.clone(),
            identity,
            crate::lock::EntityLockManager::new(),
            crate::dispatch::ProviderDispatcher::new(config.dispatch_config()),
            crate::activity::ActivityRunner::new(config.retry_config()),
            store,
            Arc::new(crate::workflow::HandlerRegistry::with_defaults()),
            config.lock_wait_policy(),
            config.instance_timeout(),
        );

        Self::new(
            Arc::new(engine),
            repos,
            config.orchestration.base_endpoint.clone(),
        )
    }

    // Project operations

    pub async fn create_project(
        &self,
        actor: UserDocument,
        project: ProjectDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        self.require_referenced_providers(&project).await?;
        match self.repos.projects.get(&project.id).await {
            Ok(_) => {
                return Err(OrchestratorError::Validation(format!(
                    "project '{}' already exists",
                    project.id
                )))
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProjectCreate(project)))
            .await)
    }

    pub async fn update_project(
        &self,
        actor: UserDocument,
        project: ProjectDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        self.require_project(&project.id).await?;
        self.require_referenced_providers(&project).await?;
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProjectUpdate(project)))
            .await)
    }

    pub async fn delete_project(
        &self,
        actor: UserDocument,
        project_id: &str,
    ) -> Result<CommandHandle, OrchestratorError> {
        // Delete targets the stored document, not a caller-supplied copy
        let project = self.require_project(project_id).await?;
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProjectDelete(project)))
            .await)
    }

    // Project membership operations

    pub async fn create_project_user(
        &self,
        actor: UserDocument,
        project_id: &str,
        user: UserDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        if user.id.is_empty() {
            return Err(OrchestratorError::Validation("user id must not be empty".into()));
        }
        self.require_project(project_id).await?;
        Ok(self
            .submit(Command::new(
                actor,
                &self.base_endpoint,
                CommandKind::ProjectUserCreate {
                    project_id: project_id.to_string(),
                    user,
                },
            ))
            .await)
    }

    pub async fn update_project_user(
        &self,
        actor: UserDocument,
        project_id: &str,
        user: UserDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        let project = self.require_project(project_id).await?;
        if !project.users.iter().any(|u| u.id == user.id) {
            return Err(OrchestratorError::EntityNotFound {
                entity: "project user",
                id: user.id,
            });
        }
        Ok(self
            .submit(Command::new(
                actor,
                &self.base_endpoint,
                CommandKind::ProjectUserUpdate {
                    project_id: project_id.to_string(),
                    user,
                },
            ))
            .await)
    }

    pub async fn delete_project_user(
        &self,
        actor: UserDocument,
        project_id: &str,
        user: UserDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        self.require_project(project_id).await?;
        Ok(self
            .submit(Command::new(
                actor,
                &self.base_endpoint,
                CommandKind::ProjectUserDelete {
                    project_id: project_id.to_string(),
                    user,
                },
            ))
            .await)
    }

    // Provider registration operations

    pub async fn create_provider(
        &self,
        actor: UserDocument,
        provider: ProviderDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        match self.repos.providers.get(&provider.id).await {
            Ok(_) => {
                return Err(OrchestratorError::Validation(format!(
                    "provider '{}' already registered",
                    provider.id
                )))
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProviderCreate(provider)))
            .await)
    }

    pub async fn update_provider(
        &self,
        actor: UserDocument,
        provider: ProviderDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        self.require_provider(&provider.id).await?;
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProviderUpdate(provider)))
            .await)
    }

    /// Unregister a provider. Refused while any project type still
    /// subscribes to it, so orphaned subscriptions cannot appear.
    pub async fn delete_provider(
        &self,
        actor: UserDocument,
        provider_id: &str,
    ) -> Result<CommandHandle, OrchestratorError> {
        let provider = self.require_provider(provider_id).await?;
        for project in self.repos.projects.list().await? {
            if project.project_type.subscribes_to(provider_id) {
                return Err(OrchestratorError::Validation(format!(
                    "provider '{}' is still subscribed to by project '{}'",
                    provider_id, project.id
                )));
            }
        }
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProviderDelete(provider)))
            .await)
    }

    // Provider data operations

    pub async fn create_provider_data(
        &self,
        actor: UserDocument,
        data: ProviderDataDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        self.validate_provider_data(&data).await?;
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProviderDataCreate(data)))
            .await)
    }

    pub async fn update_provider_data(
        &self,
        actor: UserDocument,
        data: ProviderDataDocument,
    ) -> Result<CommandHandle, OrchestratorError> {
        self.validate_provider_data(&data).await?;
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProviderDataUpdate(data)))
            .await)
    }

    pub async fn delete_provider_data(
        &self,
        actor: UserDocument,
        data_id: &str,
    ) -> Result<CommandHandle, OrchestratorError> {
        let data = self.repos.provider_data.get(data_id).await.map_err(|err| {
            if err.is_not_found() {
                OrchestratorError::EntityNotFound {
                    entity: "provider data",
                    id: data_id.to_string(),
                }
            } else {
                err.into()
            }
        })?;
        // System-scoped data is shared across projects and cannot be
        // removed through this surface.
        if data.scope == ProviderDataScope::System {
            return Err(OrchestratorError::Validation(format!(
                "provider data '{}' is system scoped and cannot be deleted here",
                data.id
            )));
        }
        Ok(self
            .submit(Command::new(actor, &self.base_endpoint, CommandKind::ProviderDataDelete(data)))
            .await)
    }

    // Instance management

    /// Hand a validated command to the engine. One instance per
    /// correlation id; a repeated submission joins the existing one.
    pub async fn submit(&self, command: Command) -> CommandHandle {
        let correlation_id = command.correlation_id;
        let mut instances = self.instances.lock().await;
        if let Some(entry) = instances.get(&correlation_id) {
            return CommandHandle {
                correlation_id,
                status: entry.status.clone(),
            };
        }

        let (status_tx, status_rx) = watch::channel(CommandResult::pending(correlation_id));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        instances.insert(
            correlation_id,
            InstanceEntry {
                status: status_rx.clone(),
                cancel: cancel_tx,
            },
        );

        let engine = self.engine.clone();
        let instances_for_task = Arc::clone(&self.instances);
        tokio::spawn(async move {
            if let Err(err) = engine.execute(command, status_tx, cancel_rx).await {
                error!(instance = %correlation_id, error = %err, "instance execution error");
            }
            // Terminal instances leave the in-memory map; resubmission of
            // the same correlation id is answered from durable history.
            instances_for_task.lock().await.remove(&correlation_id);
        });

        CommandHandle {
            correlation_id,
            status: status_rx,
        }
    }

    /// Request cancellation of a running instance. Returns whether the
    /// instance was still running; a finished instance has already left
    /// the map and reports false.
    pub async fn cancel(&self, correlation_id: Uuid) -> bool {
        match self.instances.lock().await.get(&correlation_id) {
            Some(entry) => {
                entry.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Number of instances currently running
    pub async fn active_instances(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Resume every non-terminal instance found in durable history,
    /// typically called once at startup. The persisted lock table is
    /// restored first, dropping entries whose holder has no active
    /// history; resumed instances then re-acquire their own entries
    /// re-entrantly.
    pub async fn recover(&self) -> Result<Vec<CommandHandle>, OrchestratorError> {
        let histories = self.engine.store().list_active().await?;
        let active: HashSet<Uuid> = histories.iter().map(|h| h.instance_id).collect();
        if let Some(snapshot) = self.engine.store().load_locks().await? {
            self.engine.locks().restore(snapshot, &active).await;
        }

        let mut handles = Vec::new();
        for history in histories {
            info!(instance = %history.instance_id, phase = %history.phase, "resuming recovered instance");
            handles.push(self.submit(history.command).await);
        }
        Ok(handles)
    }

    async fn require_project(&self, id: &str) -> Result<ProjectDocument, OrchestratorError> {
        self.repos.projects.get(id).await.map_err(|err| {
            if err.is_not_found() {
                OrchestratorError::EntityNotFound {
                    entity: "project",
                    id: id.to_string(),
                }
            } else {
                err.into()
            }
        })
    }

    async fn require_provider(&self, id: &str) -> Result<ProviderDocument, OrchestratorError> {
        self.repos.providers.get(id).await.map_err(|err| {
            if err.is_not_found() {
                OrchestratorError::EntityNotFound {
                    entity: "provider",
                    id: id.to_string(),
                }
            } else {
                err.into()
            }
        })
    }

    async fn require_referenced_providers(
        &self,
        project: &ProjectDocument,
    ) -> Result<(), OrchestratorError> {
        for reference in &project.project_type.providers {
            self.require_provider(&reference.id).await?;
        }
        Ok(())
    }

    async fn validate_provider_data(
        &self,
        data: &ProviderDataDocument,
    ) -> Result<(), OrchestratorError> {
        self.require_provider(&data.provider_id).await?;
        match (data.scope, &data.project_id) {
            (ProviderDataScope::Project, None) => {
                return Err(OrchestratorError::Validation(
                    "project-scoped provider data requires a project id".into(),
                ))
            }
            (ProviderDataScope::System, Some(_)) => {
                return Err(OrchestratorError::Validation(
                    "system-scoped provider data cannot carry a project id".into(),
                ))
            }
            (ProviderDataScope::Project, Some(project_id)) => {
                let project = self.require_project(project_id).await?;
                if !project.project_type.subscribes_to(&data.provider_id) {
                    return Err(OrchestratorError::Validation(format!(
                        "project '{}' does not subscribe to provider '{}'",
                        project_id, data.provider_id
                    )));
                }
            }
            (ProviderDataScope::System, None) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityRunner, RetryConfig};
    use crate::dispatch::{DispatchConfig, ProviderDispatcher};
    use crate::identity::StaticIdentityResolver;
    use crate::lock::{EntityLockManager, WaitPolicy};
    use crate::model::{CommandStatus, ProjectType, ProviderReference, UserRole};
    use crate::workflow::history::InMemoryHistoryStore;
    use crate::workflow::HandlerRegistry;
    use std::time::Duration;

    fn test_orchestrator() -> (Orchestrator, Repositories) {
        let repos = Repositories::in_memory();
        let retry = RetryConfig::fast(2);
        let engine = WorkflowEngine::new(
            repos.clone(),
            Arc::new(StaticIdentityResolver::new("system")),
            EntityLockManager::new(),
            ProviderDispatcher::new(DispatchConfig {
                request_timeout: Duration::from_secs(1),
                retry: retry.clone(),
            }),
            ActivityRunner::new(retry),
            Arc::new(InMemoryHistoryStore::default()),
            Arc::new(HandlerRegistry::with_defaults()),
            WaitPolicy::FailFast,
            Duration::from_secs(30),
        );
        (
            Orchestrator::new(Arc::new(engine), repos.clone(), "http://localhost:8080"),
            repos,
        )
    }

    fn actor() -> UserDocument {
        UserDocument::new("actor", UserRole::Admin)
    }

    fn bare_project(id: &str) -> ProjectDocument {
        ProjectDocument::new(id, "Sample", ProjectType::new("default", vec![]))
    }

    #[tokio::test]
    async fn create_project_runs_to_success() {
        let (orchestrator, repos) = test_orchestrator();
        let mut handle = orchestrator
            .create_project(actor(), bare_project("proj-1"))
            .await
            .unwrap();

        let result = handle.wait().await;
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert!(repos.projects.get("proj-1").await.is_ok());
    }

    #[tokio::test]
    async fn create_project_rejects_unknown_provider_reference() {
        let (orchestrator, _repos) = test_orchestrator();
        let project = ProjectDocument::new(
            "proj-1",
            "Sample",
            ProjectType::new("default", vec![ProviderReference::new("ghost")]),
        );
        let err = orchestrator.create_project(actor(), project).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::EntityNotFound { entity: "provider", .. }));
    }

    #[tokio::test]
    async fn project_user_create_requires_project() {
        let (orchestrator, _repos) = test_orchestrator();
        let err = orchestrator
            .create_project_user(actor(), "absent", UserDocument::new("u1", UserRole::Member))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EntityNotFound { entity: "project", .. }));
    }

    #[tokio::test]
    async fn provider_data_requires_subscription() {
        let (orchestrator, repos) = test_orchestrator();
        repos
            .providers
            .add(ProviderDocument::new("p1", "http://provider.local"))
            .await
            .unwrap();
        repos.projects.add(bare_project("proj-1")).await.unwrap();

        let data = ProviderDataDocument::project_scoped(
            "d1",
            "p1",
            "proj-1",
            "endpoint",
            serde_json::json!("value"),
        );
        let err = orchestrator.create_provider_data(actor(), data).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn system_scoped_delete_is_refused() {
        let (orchestrator, repos) = test_orchestrator();
        repos
            .providers
            .add(ProviderDocument::new("p1", "http://provider.local"))
            .await
            .unwrap();
        let mut data = ProviderDataDocument::project_scoped(
            "d1",
            "p1",
            "proj-1",
            "shared-cert",
            serde_json::json!("value"),
        );
        data.scope = ProviderDataScope::System;
        data.project_id = None;
        repos.provider_data.add(data).await.unwrap();

        let err = orchestrator.delete_provider_data(actor(), "d1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_submission_joins_existing_instance() {
        let (orchestrator, repos) = test_orchestrator();
        let command = Command::new(
            actor(),
            "http://localhost:8080",
            CommandKind::ProjectCreate(bare_project("proj-1")),
        );

        let mut first = orchestrator.submit(command.clone()).await;
        let mut second = orchestrator.submit(command).await;
        assert_eq!(first.correlation_id(), second.correlation_id());

        first.wait().await;
        second.wait().await;
        assert_eq!(repos.projects.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn from_config_assembles_a_working_stack() {
        let mut config = crate::config::GroundworkConfig::default();
        config.persistence.enable_persistence = false;
        let repos = Repositories::in_memory();
        let orchestrator = Orchestrator::from_config(&config, repos.clone());

        let mut handle = orchestrator
            .create_project(actor(), bare_project("proj-1"))
            .await
            .unwrap();
        assert_eq!(handle.wait().await.status, CommandStatus::Succeeded);
        assert!(repos.projects.get("proj-1").await.is_ok());
    }

    #[tokio::test]
    async fn cancel_unknown_instance_reports_false() {
        let (orchestrator, _repos) = test_orchestrator();
        assert!(!orchestrator.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn wait_returns_last_published_value_when_sender_is_gone() {
        let id = Uuid::new_v4();
        let (tx, rx) = watch::channel(CommandResult::pending(id));
        let mut handle = CommandHandle {
            correlation_id: id,
            status: rx,
        };

        let mut published = CommandResult::pending(id);
        published.advance(CommandStatus::Running);
        tx.send_replace(published);
        drop(tx);

        // Never reaches a terminal status; the handle falls back to the
        // last value the instance managed to publish.
        assert_eq!(handle.wait().await.status, CommandStatus::Running);
    }

    #[tokio::test]
    async fn terminal_instances_are_pruned_from_the_map() {
        let (orchestrator, _repos) = test_orchestrator();
        let mut handle = orchestrator
            .create_project(actor(), bare_project("proj-1"))
            .await
            .unwrap();
        handle.wait().await;

        // The spawned task removes its entry just after publishing the
        // terminal result.
        for _ in 0..100 {
            if orchestrator.active_instances().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(orchestrator.active_instances().await, 0);
        assert!(!orchestrator.cancel(handle.correlation_id()).await);
    }

    #[tokio::test]
    async fn provider_registration_lifecycle() {
        let (orchestrator, repos) = test_orchestrator();

        let mut handle = orchestrator
            .create_provider(actor(), ProviderDocument::new("p1", "http://p1.local"))
            .await
            .unwrap();
        assert_eq!(handle.wait().await.status, CommandStatus::Succeeded);
        assert!(repos.providers.get("p1").await.is_ok());

        // Re-registration of a live provider is refused at the boundary
        let err = orchestrator
            .create_provider(actor(), ProviderDocument::new("p1", "http://other.local"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        // Unregistration is refused while a project still subscribes
        let project = ProjectDocument::new(
            "proj-1",
            "Sample",
            ProjectType::new("default", vec![ProviderReference::new("p1")]),
        );
        repos.projects.add(project).await.unwrap();
        let err = orchestrator.delete_provider(actor(), "p1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        repos.projects.delete("proj-1").await.unwrap();
        let mut handle = orchestrator.delete_provider(actor(), "p1").await.unwrap();
        assert_eq!(handle.wait().await.status, CommandStatus::Succeeded);
        assert!(repos.providers.get("p1").await.is_err());
    }
}
