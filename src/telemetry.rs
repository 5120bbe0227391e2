use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize structured logging. JSON output with span context gives the
/// correlation ids needed to trace one command across activities and
/// provider dispatches.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Groundwork telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span carrying the common command-orchestration attributes
pub fn create_command_span(
    operation: &str,
    correlation_id: &Uuid,
    entity_kind: &str,
    entity_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "command_orchestration",
        operation = operation,
        correlation.id = %correlation_id,
        entity.kind = entity_kind,
        entity.id = entity_id,
    )
}
