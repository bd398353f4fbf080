//! Remote rule-library evaluation over HTTP.

use async_trait::async_trait;
use cohort_core::{EndpointConfig, ParameterSet, RuleService, RuleServiceError};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::{endpoint, http_client, parse_base_url, ClientError};

const FHIR_JSON: &str = "application/fhir+json";

/// Calls `POST {base}/Library/{id}/$evaluate` with a Parameters body and
/// decodes the Parameters reply.
#[derive(Clone)]
pub struct HttpRuleService {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpRuleService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: parse_base_url(base_url)?,
            timeout,
        })
    }

    pub fn from_config(config: &EndpointConfig) -> Result<Self, ClientError> {
        Self::new(&config.base_url, config.request_timeout())
    }

    fn evaluate_url(&self, library_id: &str) -> Url {
        endpoint(&self.base_url, &["Library", library_id, "$evaluate"])
    }

    fn transport_error(&self, e: reqwest::Error) -> RuleServiceError {
        if e.is_timeout() {
            RuleServiceError::Timeout(self.timeout)
        } else {
            RuleServiceError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl RuleService for HttpRuleService {
    async fn evaluate(
        &self,
        library_id: &str,
        params: &ParameterSet,
    ) -> Result<ParameterSet, RuleServiceError> {
        let url = self.evaluate_url(library_id);
        debug!(%url, parameters = params.len(), "Evaluating library");

        let response = self
            .client
            .post(url)
            .header("Content-Type", FHIR_JSON)
            .header("Accept", FHIR_JSON)
            .json(&params.to_resource())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RuleServiceError::Status { status, body });
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| RuleServiceError::Decode(e.to_string()))?;
        ParameterSet::from_resource(&reply).map_err(|e| RuleServiceError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_url() {
        let service =
            HttpRuleService::new("https://cql.example.org/fhir", Duration::from_secs(5)).unwrap();
        assert_eq!(
            service.evaluate_url("Eligibility").as_str(),
            "https://cql.example.org/fhir/Library/Eligibility/$evaluate"
        );
    }

    #[test]
    fn test_from_config() {
        let config = EndpointConfig {
            base_url: "http://localhost:9999/cql".into(),
            request_timeout_ms: 1_500,
        };
        let service = HttpRuleService::from_config(&config).unwrap();
        assert_eq!(service.timeout, Duration::from_millis(1_500));

        let bad = EndpointConfig {
            base_url: "::".into(),
            ..Default::default()
        };
        assert!(matches!(
            HttpRuleService::from_config(&bad),
            Err(ClientError::InvalidBaseUrl { .. })
        ));
    }
}
