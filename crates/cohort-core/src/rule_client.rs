//! Rule Evaluation Client
//!
//! [`RuleService`] is the transport seam to the remote rule-evaluation
//! endpoint. [`RuleClient`] wraps it with the run's failure policy and
//! extracts a single named boolean from the reply.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RemotePolicy;
use crate::model::ParameterSet;

/// Error type for rule-service calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleServiceError {
    #[error("Rule service unreachable: {0}")]
    Transport(String),

    #[error("Rule service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid rule service reply: {0}")]
    Decode(String),

    #[error("Rule service call timed out after {0:?}")]
    Timeout(Duration),
}

impl RuleServiceError {
    /// Transient failures worth another attempt. Client-side statuses and
    /// undecodable replies repeat identically and fail at once.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) => false,
        }
    }
}

/// Remote library evaluation.
///
/// Calls are pure queries against external state and are safe to retry and
/// to issue concurrently.
#[async_trait]
pub trait RuleService: Send + Sync {
    /// Evaluate every expression of `library_id` with `params`
    async fn evaluate(
        &self,
        library_id: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, RuleServiceError>;
}

/// Every attempt at a leaf call failed.
#[derive(Debug, thiserror::Error)]
#[error("Evaluation of {library}.{expression} failed after {attempts} attempt(s): {source}")]
pub struct RemoteEvaluationError {
    pub library: String,
    pub expression: String,
    pub attempts: u32,
    pub source: RuleServiceError,
}

/// Leaf-call wrapper applying timeout and bounded retry uniformly.
#[derive(Clone)]
pub struct RuleClient {
    service: Arc<dyn RuleService>,
    policy: RemotePolicy,
}

impl RuleClient {
    pub fn new(service: Arc<dyn RuleService>, policy: RemotePolicy) -> Self {
        Self { service, policy }
    }

    pub fn policy(&self) -> &RemotePolicy {
        &self.policy
    }

    /// Evaluate `expression` in `library_id` for `subject`.
    ///
    /// `base_params` is cloned with the `subject` entry overwritten. A reply
    /// without a boolean entry named `expression` reads as false. Timeouts
    /// count as failures. Only [`RuleServiceError::is_retryable`] failures are
    /// retried.
    pub async fn invoke_boolean(
        &self,
        library_id: &str,
        expression: &str,
        subject: &str,
        base_params: &ParameterSet,
    ) -> Result<bool, RemoteEvaluationError> {
        let call = base_params.with_subject(subject);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::time::timeout(
                self.policy.call_timeout(),
                self.service.evaluate(library_id, &call),
            )
            .await
            .unwrap_or_else(|_| Err(RuleServiceError::Timeout(self.policy.call_timeout())));

            match result {
                Ok(reply) => {
                    let value = reply.get_bool(expression);
                    debug!(library = library_id, expression, subject, value, "Rule evaluated");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        library = library_id,
                        expression,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Rule service call failed, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                }
                Err(e) => {
                    return Err(RemoteEvaluationError {
                        library: library_id.to_string(),
                        expression: expression.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}
