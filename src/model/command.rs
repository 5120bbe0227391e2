// Command and result contracts.
//
// One tagged variant per command kind replaces the original deep generic
// command hierarchy: every kind carries its own payload and statically
// declares its fan-out behavior and failure policy. Dispatch happens via
// exhaustive match over the tag, never via runtime type lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ProjectDocument, ProviderDataDocument, ProviderDocument, UserDocument};
use crate::lock::EntityKind;

/// Aggregation policy for provider fan-out, fixed per command kind at
/// design time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Any provider failure fails the whole command
    FailFast,
    /// Provider failures are recorded but the command still succeeds
    BestEffort,
}

/// The mutation a command performs, tagged by entity and operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    ProjectCreate(ProjectDocument),
    ProjectUpdate(ProjectDocument),
    ProjectDelete(ProjectDocument),
    ProjectUserCreate {
        project_id: String,
        user: UserDocument,
    },
    ProjectUserUpdate {
        project_id: String,
        user: UserDocument,
    },
    ProjectUserDelete {
        project_id: String,
        user: UserDocument,
    },
    ProviderCreate(ProviderDocument),
    ProviderUpdate(ProviderDocument),
    ProviderDelete(ProviderDocument),
    ProviderDataCreate(ProviderDataDocument),
    ProviderDataUpdate(ProviderDataDocument),
    ProviderDataDelete(ProviderDataDocument),
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ProjectCreate(_) => "project_create",
            CommandKind::ProjectUpdate(_) => "project_update",
            CommandKind::ProjectDelete(_) => "project_delete",
            CommandKind::ProjectUserCreate { .. } => "project_user_create",
            CommandKind::ProjectUserUpdate { .. } => "project_user_update",
            CommandKind::ProjectUserDelete { .. } => "project_user_delete",
            CommandKind::ProviderCreate(_) => "provider_create",
            CommandKind::ProviderUpdate(_) => "provider_update",
            CommandKind::ProviderDelete(_) => "provider_delete",
            CommandKind::ProviderDataCreate(_) => "provider_data_create",
            CommandKind::ProviderDataUpdate(_) => "provider_data_update",
            CommandKind::ProviderDataDelete(_) => "provider_data_delete",
        }
    }

    /// Whether this command is fanned out to the project's subscribed
    /// providers. Provider registrations and provider data mutations stay
    /// inside the control plane.
    pub fn fans_out(&self) -> bool {
        !matches!(
            self,
            CommandKind::ProviderCreate(_)
                | CommandKind::ProviderUpdate(_)
                | CommandKind::ProviderDelete(_)
                | CommandKind::ProviderDataCreate(_)
                | CommandKind::ProviderDataUpdate(_)
                | CommandKind::ProviderDataDelete(_)
        )
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            CommandKind::ProjectCreate(_)
            | CommandKind::ProjectUpdate(_)
            | CommandKind::ProjectDelete(_) => FailurePolicy::FailFast,
            // Membership propagation is advisory for providers; the
            // control-plane document remains authoritative.
            CommandKind::ProjectUserCreate { .. }
            | CommandKind::ProjectUserUpdate { .. }
            | CommandKind::ProjectUserDelete { .. } => FailurePolicy::BestEffort,
            CommandKind::ProviderCreate(_)
            | CommandKind::ProviderUpdate(_)
            | CommandKind::ProviderDelete(_) => FailurePolicy::FailFast,
            CommandKind::ProviderDataCreate(_)
            | CommandKind::ProviderDataUpdate(_)
            | CommandKind::ProviderDataDelete(_) => FailurePolicy::FailFast,
        }
    }

    /// Project the command targets, when it targets one.
    pub fn target_project_id(&self) -> Option<&str> {
        match self {
            CommandKind::ProjectCreate(p)
            | CommandKind::ProjectUpdate(p)
            | CommandKind::ProjectDelete(p) => Some(&p.id),
            CommandKind::ProjectUserCreate { project_id, .. }
            | CommandKind::ProjectUserUpdate { project_id, .. }
            | CommandKind::ProjectUserDelete { project_id, .. } => Some(project_id),
            CommandKind::ProviderCreate(_)
            | CommandKind::ProviderUpdate(_)
            | CommandKind::ProviderDelete(_) => None,
            CommandKind::ProviderDataCreate(d)
            | CommandKind::ProviderDataUpdate(d)
            | CommandKind::ProviderDataDelete(d) => d.project_id.as_deref(),
        }
    }

    /// Entities this command needs exclusive locks on, in the fixed global
    /// acquisition order (project before user before provider data).
    pub fn lock_targets(&self) -> Vec<(EntityKind, String)> {
        match self {
            CommandKind::ProjectCreate(p)
            | CommandKind::ProjectUpdate(p)
            | CommandKind::ProjectDelete(p) => {
                vec![(EntityKind::Project, p.id.clone())]
            }
            CommandKind::ProjectUserCreate { project_id, user }
            | CommandKind::ProjectUserUpdate { project_id, user }
            | CommandKind::ProjectUserDelete { project_id, user } => vec![
                (EntityKind::Project, project_id.clone()),
                (EntityKind::User, user.id.clone()),
            ],
            CommandKind::ProviderCreate(p)
            | CommandKind::ProviderUpdate(p)
            | CommandKind::ProviderDelete(p) => {
                vec![(EntityKind::Provider, p.id.clone())]
            }
            CommandKind::ProviderDataCreate(d)
            | CommandKind::ProviderDataUpdate(d)
            | CommandKind::ProviderDataDelete(d) => {
                let mut targets = Vec::new();
                if let Some(project_id) = &d.project_id {
                    targets.push((EntityKind::Project, project_id.clone()));
                }
                targets.push((EntityKind::ProviderData, d.id.clone()));
                targets
            }
        }
    }

    /// Payload forwarded to providers on fan-out.
    pub fn provider_payload(&self) -> serde_json::Value {
        match self {
            CommandKind::ProjectCreate(p)
            | CommandKind::ProjectUpdate(p)
            | CommandKind::ProjectDelete(p) => {
                serde_json::to_value(p).unwrap_or(serde_json::Value::Null)
            }
            CommandKind::ProjectUserCreate { project_id, user }
            | CommandKind::ProjectUserUpdate { project_id, user }
            | CommandKind::ProjectUserDelete { project_id, user } => serde_json::json!({
                "projectId": project_id,
                "user": user,
            }),
            CommandKind::ProviderCreate(p)
            | CommandKind::ProviderUpdate(p)
            | CommandKind::ProviderDelete(p) => {
                serde_json::to_value(p).unwrap_or(serde_json::Value::Null)
            }
            CommandKind::ProviderDataCreate(d)
            | CommandKind::ProviderDataUpdate(d)
            | CommandKind::ProviderDataDelete(d) => {
                serde_json::to_value(d).unwrap_or(serde_json::Value::Null)
            }
        }
    }
}

/// Immutable command envelope. Created at the boundary, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub correlation_id: Uuid,
    pub actor: UserDocument,
    /// Base endpoint of the control plane, forwarded to providers so they
    /// can call back with results
    pub base_endpoint: String,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
}

impl Command {
    pub fn new(actor: UserDocument, base_endpoint: impl Into<String>, kind: CommandKind) -> Self {
        Self::with_correlation_id(Uuid::new_v4(), actor, base_endpoint, kind)
    }

    /// Reuse of a correlation id resumes the workflow instance keyed by it
    /// instead of starting a duplicate.
    pub fn with_correlation_id(
        correlation_id: Uuid,
        actor: UserDocument,
        base_endpoint: impl Into<String>,
        kind: CommandKind,
    ) -> Self {
        Self {
            correlation_id,
            actor,
            base_endpoint: base_endpoint.into(),
            kind,
            issued_at: Utc::now(),
        }
    }
}

/// Per-provider projection of a command, sent over HTTP to the provider's
/// registered endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCommand {
    pub correlation_id: Uuid,
    pub provider_id: String,
    pub command: String,
    pub base_endpoint: String,
    pub payload: serde_json::Value,
}

impl ProviderCommand {
    pub fn for_provider(command: &Command, provider_id: impl Into<String>) -> Self {
        Self {
            correlation_id: command.correlation_id,
            provider_id: provider_id.into(),
            command: command.kind.name().to_string(),
            base_endpoint: command.base_endpoint.clone(),
            payload: command.kind.provider_payload(),
        }
    }
}

/// Monotonic command status. Once terminal, no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Succeeded | CommandStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            CommandStatus::Pending => 0,
            CommandStatus::Running => 1,
            CommandStatus::Succeeded | CommandStatus::Failed => 2,
        }
    }

    /// A status may only move forward, and terminal states never change.
    pub fn can_advance_to(&self, next: CommandStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Per-provider error surfaced in a command result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub provider_id: String,
    pub message: String,
}

impl CommandError {
    pub fn new(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            message: message.into(),
        }
    }

    /// Error not attributable to a single provider (lock timeout,
    /// cancellation, fatal orchestration failure).
    pub fn engine(message: impl Into<String>) -> Self {
        Self {
            provider_id: String::new(),
            message: message.into(),
        }
    }
}

/// Aggregated outcome of one command. Created `Pending` when the workflow
/// instance starts and updated only by that instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub correlation_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<CommandError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn pending(correlation_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            correlation_id,
            status: CommandStatus::Pending,
            result: None,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Advance the status, refusing regressions. Returns whether the
    /// transition was applied.
    pub fn advance(&mut self, next: CommandStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }

    pub fn push_error(&mut self, error: CommandError) {
        self.errors.push(error);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectType, UserRole};

    fn sample_project() -> ProjectDocument {
        ProjectDocument::new("proj-1", "Sample", ProjectType::new("default", vec![]))
    }

    #[test]
    fn status_never_regresses() {
        let mut result = CommandResult::pending(Uuid::new_v4());
        assert!(result.advance(CommandStatus::Running));
        assert!(result.advance(CommandStatus::Succeeded));
        assert!(!result.advance(CommandStatus::Running));
        assert!(!result.advance(CommandStatus::Failed));
        assert_eq!(result.status, CommandStatus::Succeeded);
    }

    #[test]
    fn pending_can_fail_directly() {
        let mut result = CommandResult::pending(Uuid::new_v4());
        assert!(result.advance(CommandStatus::Failed));
        assert!(result.is_terminal());
    }

    #[test]
    fn project_commands_fan_out_fail_fast() {
        let kind = CommandKind::ProjectCreate(sample_project());
        assert!(kind.fans_out());
        assert_eq!(kind.failure_policy(), FailurePolicy::FailFast);
    }

    #[test]
    fn provider_data_commands_stay_internal() {
        let data = ProviderDataDocument::project_scoped(
            "d1",
            "p1",
            "proj-1",
            "endpoint",
            serde_json::json!("value"),
        );
        let kind = CommandKind::ProviderDataCreate(data);
        assert!(!kind.fans_out());
    }

    #[test]
    fn provider_registration_commands_stay_internal() {
        let kind = CommandKind::ProviderDelete(ProviderDocument::new("p1", "http://p1.local"));
        assert!(!kind.fans_out());
        assert_eq!(kind.failure_policy(), FailurePolicy::FailFast);
        assert_eq!(kind.lock_targets(), vec![(EntityKind::Provider, "p1".to_string())]);
        assert!(kind.target_project_id().is_none());
    }

    #[test]
    fn lock_targets_follow_global_order() {
        let user = UserDocument::new("u1", UserRole::Member);
        let kind = CommandKind::ProjectUserCreate {
            project_id: "proj-1".to_string(),
            user,
        };
        let targets = kind.lock_targets();
        assert_eq!(targets[0].0, EntityKind::Project);
        assert_eq!(targets[1].0, EntityKind::User);
    }

    #[test]
    fn provider_command_carries_parent_correlation() {
        let command = Command::new(
            UserDocument::new("u1", UserRole::Admin),
            "https://control.example.com",
            CommandKind::ProjectCreate(sample_project()),
        );
        let pc = ProviderCommand::for_provider(&command, "p1");
        assert_eq!(pc.correlation_id, command.correlation_id);
        assert_eq!(pc.provider_id, "p1");
        assert_eq!(pc.command, "project_create");
    }
}
