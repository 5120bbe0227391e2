// Entity documents owned by the repository collaborator.
// The engine reads and writes these only through repository traits while
// holding the matching entity lock.

pub mod command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use command::{
    Command, CommandError, CommandKind, CommandResult, CommandStatus, FailurePolicy,
    ProviderCommand,
};

/// Role of a user inside the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Admin,
    Creator,
    Member,
}

/// Distinguishes human callers from the control plane's own identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserType {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDocument {
    pub id: String,
    pub role: UserRole,
    pub user_type: UserType,
}

impl UserDocument {
    pub fn new(id: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            role,
            user_type: UserType::User,
        }
    }

    /// The system identity used for control-plane internal operations
    pub fn system(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: UserRole::Admin,
            user_type: UserType::System,
        }
    }

    pub fn is_system(&self) -> bool {
        self.user_type == UserType::System
    }
}

/// Reference from a project type to a subscribed provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReference {
    pub id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ProviderReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            properties: HashMap::new(),
        }
    }
}

/// A project type declares which providers every project of that type
/// subscribes to. The subscription set is resolved at fan-out time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectType {
    pub id: String,
    #[serde(default)]
    pub default: bool,
    pub region: Option<String>,
    pub providers: Vec<ProviderReference>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ProjectType {
    pub fn new(id: impl Into<String>, providers: Vec<ProviderReference>) -> Self {
        Self {
            id: id.into(),
            default: false,
            region: None,
            providers,
            tags: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    pub fn subscribes_to(&self, provider_id: &str) -> bool {
        self.providers.iter().any(|p| p.id == provider_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDocument {
    pub id: String,
    pub name: String,
    /// Embedded type snapshot; carries the subscribed provider set
    pub project_type: ProjectType,
    #[serde(default)]
    pub users: Vec<UserDocument>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl ProjectDocument {
    pub fn new(id: impl Into<String>, name: impl Into<String>, project_type: ProjectType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project_type,
            users: Vec::new(),
            tags: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// An external provider service registered with the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDocument {
    pub id: String,
    /// Registered HTTP endpoint that receives provider commands
    pub url: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
}

impl ProviderDocument {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            properties: HashMap::new(),
            registered_at: Utc::now(),
        }
    }
}

/// Scope of a provider data item. System-scoped data is shared across
/// projects and must never be deleted through a project-scoped command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderDataScope {
    Project,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDataDocument {
    pub id: String,
    pub provider_id: String,
    /// Present for project-scoped data, absent for system-scoped data
    pub project_id: Option<String>,
    pub scope: ProviderDataScope,
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub is_secret: bool,
}

impl ProviderDataDocument {
    pub fn project_scoped(
        id: impl Into<String>,
        provider_id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            project_id: Some(project_id.into()),
            scope: ProviderDataScope::Project,
            name: name.into(),
            value,
            is_secret: false,
        }
    }
}
