// Provider fan-out dispatcher.
//
// Projects one ProviderCommand per subscribed provider and posts it to the
// provider's registered endpoint through the retrying activity layer. Each
// dispatch runs with an independent timeout; a provider that never answers
// is a per-provider failure, not an engine defect, and does not block
// collection from the others.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::activity::{ActivityError, ActivityFailure, ActivityRunner, RetryConfig};
use crate::lock::{LockError, LockSet};
use crate::model::{
    Command, CommandError, FailurePolicy, ProviderCommand, ProviderDocument,
};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bound on one provider round-trip, independent of the provider's SLA
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Terminal outcome of one provider dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOutcome {
    pub provider_id: String,
    pub result: Result<serde_json::Value, ProviderFailure>,
}

impl ProviderOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("provider '{provider_id}' failed: {message}")]
pub struct ProviderFailure {
    pub provider_id: String,
    pub message: String,
}

/// Aggregated fan-in view handed back to the workflow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub outcomes: Vec<ProviderOutcome>,
}

impl DispatchReport {
    pub fn errors(&self) -> Vec<CommandError> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err())
            .map(|f| CommandError::new(&f.provider_id, &f.message))
            .collect()
    }

    /// Apply the command kind's aggregation policy
    pub fn succeeded(&self, policy: FailurePolicy) -> bool {
        match policy {
            FailurePolicy::FailFast => self.outcomes.iter().all(ProviderOutcome::is_success),
            FailurePolicy::BestEffort => true,
        }
    }
}

pub struct ProviderDispatcher {
    client: reqwest::Client,
    runner: ActivityRunner,
    config: DispatchConfig,
}

impl ProviderDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            runner: ActivityRunner::new(config.retry.clone()),
            config,
        }
    }

    /// Fan a command out to every subscribed provider and wait for all of
    /// them to reach a terminal per-provider outcome. The outcome list
    /// preserves the subscription order.
    ///
    /// Providers mutate the command's target entities, so every lock
    /// target must be covered by a live token before any request leaves.
    pub async fn dispatch(
        &self,
        command: &Command,
        subscribed: &[ProviderDocument],
        locks: &LockSet,
    ) -> Result<DispatchReport, LockError> {
        for (kind, id) in command.kind.lock_targets() {
            locks.authorize_write(kind, &id).await?;
        }

        // The provider-command set is fixed here, at fan-out time.
        let sub_commands: Vec<(ProviderCommand, String)> = subscribed
            .iter()
            .map(|p| (ProviderCommand::for_provider(command, &p.id), p.url.clone()))
            .collect();

        info!(
            correlation_id = %command.correlation_id,
            command = command.kind.name(),
            providers = sub_commands.len(),
            "dispatching provider commands"
        );

        let dispatches = sub_commands
            .into_iter()
            .map(|(sub, url)| self.dispatch_one(sub, url));
        let outcomes = join_all(dispatches).await;

        Ok(DispatchReport { outcomes })
    }

    async fn dispatch_one(&self, sub: ProviderCommand, url: String) -> ProviderOutcome {
        let provider_id = sub.provider_id.clone();
        let activity = format!("provider_dispatch:{provider_id}");

        let result = self
            .runner
            .run(&activity, |_| {
                let client = self.client.clone();
                let sub = sub.clone();
                let url = url.clone();
                async move {
                    let response = client.post(&url).json(&sub).send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ActivityFailure::from_status(
                            status.as_u16(),
                            format!("HTTP {status}: {body}"),
                        ));
                    }
                    // Providers may answer with an empty acceptance body
                    let payload = response
                        .json::<serde_json::Value>()
                        .await
                        .unwrap_or(serde_json::Value::Null);
                    Ok(payload)
                }
            })
            .await;

        match result {
            Ok(outcome) => ProviderOutcome {
                provider_id,
                result: Ok(outcome.value),
            },
            Err(error) => {
                warn!(provider = %provider_id, error = %error, "provider dispatch failed");
                let message = match &error {
                    ActivityError::TransientExhausted { message, attempts, .. } => {
                        format!("no response after {attempts} attempts: {message}")
                    }
                    ActivityError::Permanent { message, .. } => message.clone(),
                };
                ProviderOutcome {
                    provider_id: provider_id.clone(),
                    result: Err(ProviderFailure {
                        provider_id,
                        message,
                    }),
                }
            }
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, ok: bool) -> ProviderOutcome {
        ProviderOutcome {
            provider_id: id.to_string(),
            result: if ok {
                Ok(serde_json::Value::Null)
            } else {
                Err(ProviderFailure {
                    provider_id: id.to_string(),
                    message: "boom".to_string(),
                })
            },
        }
    }

    #[test]
    fn fail_fast_fails_on_any_provider_failure() {
        let report = DispatchReport {
            outcomes: vec![outcome("p1", true), outcome("p2", false)],
        };
        assert!(!report.succeeded(FailurePolicy::FailFast));
        assert!(report.succeeded(FailurePolicy::BestEffort));
        assert_eq!(report.errors().len(), 1);
        assert_eq!(report.errors()[0].provider_id, "p2");
    }

    #[test]
    fn all_success_succeeds_under_both_policies() {
        let report = DispatchReport {
            outcomes: vec![outcome("p1", true), outcome("p2", true)],
        };
        assert!(report.succeeded(FailurePolicy::FailFast));
        assert!(report.errors().is_empty());
    }
}
