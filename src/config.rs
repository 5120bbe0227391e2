use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the orchestration engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroundworkConfig {
    /// Workflow orchestration settings
    pub orchestration: OrchestrationConfig,
    /// Activity retry settings
    pub retry: RetrySettings,
    /// Provider dispatch settings
    pub dispatch: DispatchSettings,
    /// Durable history persistence settings
    pub persistence: PersistenceSettings,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestrationConfig {
    /// Base endpoint providers use to call back into the control plane
    pub base_endpoint: String,
    /// Id of the control plane's system identity
    pub system_identity: String,
    /// Whole-instance bound; exceeding it forces Failed
    pub instance_timeout_seconds: u64,
    /// How long lock acquisition may wait before failing the instance
    pub lock_wait_seconds: u64,
    /// Fail immediately instead of waiting when a lock is held
    pub lock_fail_fast: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub attempt_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchSettings {
    /// Per-provider round-trip bound, independent of the provider's SLA
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceSettings {
    pub enable_persistence: bool,
    pub directory: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_output: bool,
}

impl Default for GroundworkConfig {
    fn default() -> Self {
        Self {
            orchestration: OrchestrationConfig {
                base_endpoint: "http://localhost:8080".to_string(),
                system_identity: "groundwork-system".to_string(),
                instance_timeout_seconds: 300,
                lock_wait_seconds: 30,
                lock_fail_fast: false,
            },
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                jitter: true,
                attempt_timeout_seconds: 30,
            },
            dispatch: DispatchSettings {
                request_timeout_seconds: 30,
            },
            persistence: PersistenceSettings {
                enable_persistence: true,
                directory: ".groundwork/history".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_output: true,
            },
        }
    }
}

impl GroundworkConfig {
    /// Load configuration with precedence: defaults, then groundwork.toml,
    /// then GROUNDWORK__-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("groundwork.toml").exists() {
            builder = builder.add_source(File::with_name("groundwork"));
        }

        builder = builder.add_source(
            Environment::with_prefix("GROUNDWORK")
                .separator("__")
                .try_parsing(true),
        );

        let config: GroundworkConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn retry_config(&self) -> crate::activity::RetryConfig {
        crate::activity::RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
            attempt_timeout: Some(Duration::from_secs(self.retry.attempt_timeout_seconds)),
        }
    }

    pub fn dispatch_config(&self) -> crate::dispatch::DispatchConfig {
        crate::dispatch::DispatchConfig {
            request_timeout: Duration::from_secs(self.dispatch.request_timeout_seconds),
            retry: self.retry_config(),
        }
    }

    pub fn lock_wait_policy(&self) -> crate::lock::WaitPolicy {
        if self.orchestration.lock_fail_fast {
            crate::lock::WaitPolicy::FailFast
        } else {
            crate::lock::WaitPolicy::Wait(Duration::from_secs(
                self.orchestration.lock_wait_seconds,
            ))
        }
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestration.instance_timeout_seconds)
    }
}
