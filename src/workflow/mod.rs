// Durable workflow execution: one resumable instance per command,
// advanced through an explicit phase machine with a persisted step log.

pub mod engine;
pub mod handlers;
pub mod history;
pub mod instance;

pub use engine::{WorkflowEngine, WorkflowError};
pub use handlers::{CommandHandler, HandlerRegistry};
pub use history::{
    FileSystemHistoryStore, HistoryError, HistoryStore, InMemoryHistoryStore, StepOutcome,
    StepRecord, WorkflowHistory,
};
pub use instance::WorkflowPhase;
