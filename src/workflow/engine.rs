// Durable workflow engine.
//
// Each command runs as one instance keyed by its correlation id. Progress
// is a persisted step log: before a step executes, its recorded outcome is
// replayed if present, so a resumed instance never repeats a side effect.
// Entity locks are taken in the fixed global order before execution and
// released on every exit path, including cancellation and timeout.

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn, Instrument};

use super::handlers::HandlerRegistry;
use super::history::{HistoryError, HistoryStore, StepOutcome, WorkflowHistory};
use super::instance::WorkflowPhase;
use crate::activity::{ActivityError, ActivityFailure, ActivityRunner};
use crate::dispatch::{DispatchReport, ProviderDispatcher};
use crate::identity::IdentityResolver;
use crate::lock::{
    EntityKind, EntityLockManager, LockError, LockKey, LockMode, LockSet, WaitPolicy,
};
use crate::model::{
    Command, CommandError, CommandKind, CommandResult, CommandStatus, ProjectDocument,
    ProviderDocument,
};
use crate::repository::{Repositories, RepositoryError};
use crate::telemetry::create_command_span;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("history diverged at step {index}: expected '{expected}', found '{found}'")]
    HistoryDivergence {
        index: u32,
        expected: String,
        found: String,
    },

    #[error("{failed} of {total} provider dispatches failed")]
    ProviderDispatch { failed: usize, total: usize },

    #[error("command cancelled")]
    Cancelled,

    #[error("instance exceeded its execution bound")]
    InstanceTimeout,

    #[error("{0}")]
    Fatal(String),
}

fn repo_failure(err: RepositoryError) -> ActivityFailure {
    match err {
        RepositoryError::Storage(message) => ActivityFailure::transient(message),
        other => ActivityFailure::permanent(other.to_string()),
    }
}

/// Replay position in the persisted step log. A step whose outcome is
/// already recorded is replayed from the log; an unrecorded step executes,
/// records its outcome and persists the history before continuing.
struct StepCursor {
    next: usize,
}

impl StepCursor {
    fn new() -> Self {
        Self { next: 0 }
    }

    async fn step<T, F, Fut>(
        &mut self,
        history: &mut WorkflowHistory,
        store: &dyn HistoryStore,
        name: &str,
        op: F,
    ) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        if let Some(record) = history.steps.get(self.next) {
            if record.name != name {
                return Err(WorkflowError::HistoryDivergence {
                    index: self.next as u32,
                    expected: name.to_string(),
                    found: record.name.clone(),
                });
            }
            let replayed = match &record.outcome {
                StepOutcome::Completed { value } => serde_json::from_value(value.clone())
                    .map_err(|e| WorkflowError::Fatal(format!("corrupt step record '{name}': {e}"))),
                StepOutcome::Failed { error } => Err(WorkflowError::StepFailed {
                    step: name.to_string(),
                    message: error.clone(),
                }),
            };
            self.next += 1;
            return replayed;
        }

        match op().await {
            Ok(value) => {
                let recorded = serde_json::to_value(&value)
                    .map_err(|e| WorkflowError::Fatal(format!("unserializable step '{name}': {e}")))?;
                history.record_step(name, StepOutcome::Completed { value: recorded });
                self.next += 1;
                store.save(history).await?;
                Ok(value)
            }
            Err(err) => {
                history.record_step(
                    name,
                    StepOutcome::Failed {
                        error: err.to_string(),
                    },
                );
                self.next += 1;
                store.save(history).await?;
                Err(err)
            }
        }
    }
}

/// Entity state resolved before execution, recorded as a step so replay
/// sees the same view the original run saw.
#[derive(Debug, Serialize, Deserialize)]
struct ExecutionState {
    project: Option<ProjectDocument>,
    /// Subscribed providers in subscription order, empty when the command
    /// does not fan out
    providers: Vec<ProviderDocument>,
}

pub struct WorkflowEngine {
    repos: Repositories,
    identity: Arc<dyn IdentityResolver>,
    locks: Arc<EntityLockManager>,
    dispatcher: ProviderDispatcher,
    runner: ActivityRunner,
    store: Arc<dyn HistoryStore>,
    registry: Arc<HandlerRegistry>,
    wait_policy: WaitPolicy,
    instance_timeout: Duration,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        identity: Arc<dyn IdentityResolver>,
        locks: Arc<EntityLockManager>,
        dispatcher: ProviderDispatcher,
        runner: ActivityRunner,
        store: Arc<dyn HistoryStore>,
        registry: Arc<HandlerRegistry>,
        wait_policy: WaitPolicy,
        instance_timeout: Duration,
    ) -> Self {
        Self {
            repos,
            identity,
            locks,
            dispatcher,
            runner,
            store,
            registry,
            wait_policy,
            instance_timeout,
        }
    }

    pub fn locks(&self) -> &Arc<EntityLockManager> {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// Run a command to a terminal result.
    ///
    /// A command whose correlation id matches an existing instance resumes
    /// that instance; if it already finished, the recorded result is
    /// returned without re-executing anything.
    pub async fn execute(
        &self,
        command: Command,
        status_tx: watch::Sender<CommandResult>,
        cancel: watch::Receiver<bool>,
    ) -> Result<CommandResult, WorkflowError> {
        let instance_id = command.correlation_id;
        let span = create_command_span(
            command.kind.name(),
            &instance_id,
            "command",
            command.kind.target_project_id().unwrap_or(""),
        );

        async {
            let mut history = match self.store.load(instance_id).await? {
                Some(existing) if existing.is_terminal() => {
                    info!(instance = %instance_id, "instance already terminal, returning recorded result");
                    status_tx.send_replace(existing.result.clone());
                    return Ok(existing.result);
                }
                Some(existing) => {
                    info!(instance = %instance_id, phase = %existing.phase, "resuming instance");
                    existing
                }
                None => {
                    let history = WorkflowHistory::new(command.clone());
                    self.store.save(&history).await?;
                    history
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = Self::cancelled(cancel) => Err(WorkflowError::Cancelled),
                _ = tokio::time::sleep(self.instance_timeout) => Err(WorkflowError::InstanceTimeout),
                // A panicking step still releases locks and records Failed
                caught = AssertUnwindSafe(self.run_instance(&mut history, &status_tx)).catch_unwind() => {
                    match caught {
                        Ok(result) => result,
                        Err(panic) => {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "instance panicked".to_string());
                            Err(WorkflowError::Fatal(message))
                        }
                    }
                }
            };

            // Locks never outlive the instance, whichever way it ended.
            self.locks.release_all(instance_id).await;
            if let Err(err) = self.store.save_locks(&self.locks.snapshot().await).await {
                warn!(instance = %instance_id, error = %err, "lock snapshot save failed");
            }

            if let Err(err) = outcome {
                warn!(instance = %instance_id, error = %err, "instance failed");
                if history.phase.can_transition_to(WorkflowPhase::Failed) {
                    history.phase = WorkflowPhase::Failed;
                }
                history.result.advance(CommandStatus::Failed);
                if history.result.errors.is_empty() {
                    history.result.push_error(CommandError::engine(err.to_string()));
                }
                self.store.save(&history).await?;
                status_tx.send_replace(history.result.clone());
            }

            Ok(history.result)
        }
        .instrument(span)
        .await
    }

    async fn cancelled(mut cancel: watch::Receiver<bool>) {
        // A dropped sender means nobody can cancel anymore
        if cancel.wait_for(|flagged| *flagged).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    async fn run_instance(
        &self,
        history: &mut WorkflowHistory,
        status_tx: &watch::Sender<CommandResult>,
    ) -> Result<(), WorkflowError> {
        let instance_id = history.instance_id;
        let command = history.command.clone();
        let mut cursor = StepCursor::new();

        if history.result.advance(CommandStatus::Running) {
            status_tx.send_replace(history.result.clone());
        }

        self.transition(history, WorkflowPhase::LockAcquisition).await?;

        // Acquisition follows the fixed global entity order. Re-acquiring
        // after a resume is a no-op grant.
        let mut tokens = Vec::new();
        for (kind, id) in command.kind.lock_targets() {
            let token = self
                .locks
                .acquire(LockKey::new(kind, id), LockMode::Exclusive, instance_id, self.wait_policy)
                .await?;
            tokens.push(token);
        }
        let grant = LockSet::new(self.locks.clone(), tokens);
        // The lock table is durable state; it is persisted whenever it
        // changes and restored before any instance resumes.
        self.store.save_locks(&self.locks.snapshot().await).await?;

        self.transition(history, WorkflowPhase::Executing).await?;

        let command = &command;
        let grant = &grant;
        let system = cursor
            .step(history, self.store.as_ref(), "resolve_system_identity", || async move {
                let identity = self
                    .identity
                    .resolve_system_identity()
                    .await
                    .map_err(|e| WorkflowError::Fatal(e.to_string()))?;
                // Reading the system principal is the one sanctioned lock
                // bypass; the token it yields can never authorize a write.
                let _read = self
                    .locks
                    .acquire(
                        LockKey::new(EntityKind::User, identity.id.clone()),
                        LockMode::UnsafeRead,
                        instance_id,
                        WaitPolicy::FailFast,
                    )
                    .await?;
                Ok(identity)
            })
            .await?;
        info!(instance = %instance_id, system = %system.id, "system identity resolved");

        let state = cursor
            .step(history, self.store.as_ref(), "load_entity_state", || async move {
                let outcome = self
                    .runner
                    .run("load_entity_state", |_| self.load_state(command))
                    .await?;
                Ok(outcome.value)
            })
            .await?;

        let report = cursor
            .step(history, self.store.as_ref(), "dispatch_providers", || async move {
                if state.providers.is_empty() {
                    return Ok(DispatchReport { outcomes: Vec::new() });
                }
                Ok(self.dispatcher.dispatch(command, &state.providers, grant).await?)
            })
            .await?;

        self.transition(history, WorkflowPhase::Aggregating).await?;

        // Assigned rather than appended so a replayed aggregation does not
        // duplicate error entries.
        history.result.errors = report.errors();
        let policy = command.kind.failure_policy();
        if !report.succeeded(policy) {
            let failed = report.outcomes.iter().filter(|o| !o.is_success()).count();
            return Err(WorkflowError::ProviderDispatch {
                failed,
                total: report.outcomes.len(),
            });
        }

        self.transition(history, WorkflowPhase::Committing).await?;

        // The commit only proceeds while every lock this instance took is
        // still live; the handler re-authorizes each entity it writes.
        grant.authorize_all().await?;

        let handler = self.registry.get(command.kind.name()).ok_or_else(|| {
            WorkflowError::Fatal(format!("no handler registered for '{}'", command.kind.name()))
        })?;

        let committed = cursor
            .step(history, self.store.as_ref(), "commit", || async move {
                let outcome = self
                    .runner
                    .run("commit", |_| handler.commit(&self.repos, &command.kind, grant))
                    .await?;
                Ok(outcome.value)
            })
            .await?;

        self.transition(history, WorkflowPhase::Completed).await?;
        history.result.result = Some(committed);
        history.result.advance(CommandStatus::Succeeded);
        self.store.save(history).await?;
        status_tx.send_replace(history.result.clone());
        info!(instance = %instance_id, "instance completed");
        Ok(())
    }

    /// Advance the phase machine, persisting the new phase. A resumed
    /// instance that already passed the phase skips the transition.
    async fn transition(
        &self,
        history: &mut WorkflowHistory,
        next: WorkflowPhase,
    ) -> Result<(), WorkflowError> {
        if history.phase.has_reached(next) {
            return Ok(());
        }
        if !history.phase.can_transition_to(next) {
            return Err(WorkflowError::Fatal(format!(
                "illegal phase transition {} -> {}",
                history.phase, next
            )));
        }
        history.phase = next;
        self.store.save(history).await?;
        Ok(())
    }

    /// Resolve the entities the command touches. Missing references are
    /// permanent failures; storage errors retry through the activity layer.
    async fn load_state(&self, command: &Command) -> Result<ExecutionState, ActivityFailure> {
        let kind = &command.kind;

        let project = match kind {
            // The created document does not exist yet; the payload is the
            // authoritative view.
            CommandKind::ProjectCreate(p) => Some(p.clone()),
            _ => match kind.target_project_id() {
                Some(id) => Some(self.repos.projects.get(id).await.map_err(repo_failure)?),
                None => None,
            },
        };

        if let CommandKind::ProviderDataCreate(d)
        | CommandKind::ProviderDataUpdate(d)
        | CommandKind::ProviderDataDelete(d) = kind
        {
            self.repos
                .providers
                .get(&d.provider_id)
                .await
                .map_err(repo_failure)?;
        }

        let mut providers = Vec::new();
        if kind.fans_out() {
            if let Some(project) = &project {
                for reference in &project.project_type.providers {
                    providers.push(
                        self.repos
                            .providers
                            .get(&reference.id)
                            .await
                            .map_err(repo_failure)?,
                    );
                }
            }
        }

        Ok(ExecutionState { project, providers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::RetryConfig;
    use crate::dispatch::DispatchConfig;
    use crate::identity::{IdentityError, IdentityResolver, StaticIdentityResolver};
    use crate::model::{ProjectType, UserDocument, UserRole};
    use crate::workflow::history::InMemoryHistoryStore;
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        Resolver {}

        #[async_trait]
        impl IdentityResolver for Resolver {
            async fn resolve_system_identity(&self) -> Result<UserDocument, IdentityError>;
        }
    }

    fn test_engine(repos: Repositories) -> WorkflowEngine {
        let retry = RetryConfig::fast(2);
        WorkflowEngine::new(
            repos,
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
        )
    }

    fn project_create(id: &str) -> Command {
        Command::new(
            UserDocument::new("actor", UserRole::Admin),
            "http://localhost:8080",
            CommandKind::ProjectCreate(ProjectDocument::new(
                id,
                "Sample",
                ProjectType::new("default", vec![]),
            )),
        )
    }

    fn channels() -> (watch::Sender<CommandResult>, watch::Receiver<bool>, watch::Sender<bool>) {
        let (status_tx, _) = watch::channel(CommandResult::pending(uuid::Uuid::new_v4()));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (status_tx, cancel_rx, cancel_tx)
    }

    #[tokio::test]
    async fn project_create_runs_to_completion() {
        let repos = Repositories::in_memory();
        let engine = test_engine(repos.clone());
        let command = project_create("proj-1");
        let (status_tx, cancel_rx, _cancel_tx) = channels();

        let result = engine.execute(command, status_tx, cancel_rx).await.unwrap();
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert!(result.errors.is_empty());
        assert_eq!(repos.projects.list().await.unwrap().len(), 1);
        assert!(engine.locks().is_empty().await);
    }

    #[tokio::test]
    async fn resubmission_returns_recorded_result_without_reexecution() {
        let repos = Repositories::in_memory();
        let engine = test_engine(repos.clone());
        let command = project_create("proj-1");

        let (status_tx, cancel_rx, _c) = channels();
        let first = engine
            .execute(command.clone(), status_tx, cancel_rx)
            .await
            .unwrap();

        // Same correlation id, second submission
        let (status_tx, cancel_rx, _c) = channels();
        let second = engine.execute(command, status_tx, cancel_rx).await.unwrap();

        assert_eq!(first.correlation_id, second.correlation_id);
        assert_eq!(second.status, CommandStatus::Succeeded);
        assert_eq!(repos.projects.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_project_fails_the_instance() {
        let repos = Repositories::in_memory();
        let engine = test_engine(repos);
        let command = Command::new(
            UserDocument::new("actor", UserRole::Admin),
            "http://localhost:8080",
            CommandKind::ProjectUserCreate {
                project_id: "absent".to_string(),
                user: UserDocument::new("u1", UserRole::Member),
            },
        );
        let (status_tx, cancel_rx, _c) = channels();

        let result = engine.execute(command, status_tx, cancel_rx).await.unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(!result.errors.is_empty());
        assert!(engine.locks().is_empty().await);
    }

    #[tokio::test]
    async fn cancellation_fails_the_instance_and_releases_locks() {
        let repos = Repositories::in_memory();
        let engine = test_engine(repos);
        let command = project_create("proj-1");
        let (status_tx, cancel_rx, cancel_tx) = channels();
        cancel_tx.send_replace(true);

        let result = engine.execute(command, status_tx, cancel_rx).await.unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("cancelled"));
        assert!(engine.locks().is_empty().await);
    }

    #[tokio::test]
    async fn identity_resolution_failure_fails_the_instance() {
        let repos = Repositories::in_memory();
        let mut resolver = MockResolver::new();
        resolver.expect_resolve_system_identity().returning(|| {
            Err(IdentityError::ResolutionFailed("principal store unavailable".into()))
        });

        let retry = RetryConfig::fast(2);
        let engine = WorkflowEngine::new(
            repos,
            Arc::new(resolver),
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

        let (status_tx, cancel_rx, _c) = channels();
        let result = engine
            .execute(project_create("proj-1"), status_tx, cancel_rx)
            .await
            .unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(result.errors[0].message.contains("principal store unavailable"));
        assert!(engine.locks().is_empty().await);
    }

    #[tokio::test]
    async fn failed_result_always_carries_an_error() {
        let repos = Repositories::in_memory();
        let engine = test_engine(repos);
        // Update of a project that does not exist
        let command = Command::new(
            UserDocument::new("actor", UserRole::Admin),
            "http://localhost:8080",
            CommandKind::ProjectUpdate(ProjectDocument::new(
                "absent",
                "Sample",
                ProjectType::new("default", vec![]),
            )),
        );
        let (status_tx, cancel_rx, _c) = channels();

        let result = engine.execute(command, status_tx, cancel_rx).await.unwrap();
        assert_eq!(result.status, CommandStatus::Failed);
        assert!(!result.errors.is_empty());
    }
}
