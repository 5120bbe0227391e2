//! Groundwork: a command orchestration engine for a multi-tenant project
//! control plane.
//!
//! Every mutation enters as a [`model::Command`] and runs as a durable,
//! resumable workflow instance keyed by its correlation id. The engine
//! acquires entity locks in a fixed global order, fans the command out to
//! the project's subscribed providers over HTTP with bounded retries,
//! aggregates per-provider outcomes under the command's failure policy and
//! commits the control-plane mutation idempotently. Progress is persisted
//! as a step log so a crashed instance resumes without repeating side
//! effects.

pub mod activity;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod repository;
pub mod telemetry;
pub mod workflow;

pub use config::GroundworkConfig;
pub use model::{Command, CommandKind, CommandResult, CommandStatus};
pub use orchestrator::{CommandHandle, Orchestrator, OrchestratorError};
pub use workflow::{WorkflowEngine, WorkflowError};
