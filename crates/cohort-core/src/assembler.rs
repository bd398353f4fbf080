//! Cohort Assembler
//!
//! Runs the evaluator over an ordered subject list and collects the
//! qualifying subjects, by pseudonymized identifier, into a [`ResultGroup`].
//!
//! Subjects are evaluated through an ordered buffered stream: up to
//! `max_concurrent_subjects` are in flight, results are consumed in input
//! order, and the first fatal error stops the run. No partial group is ever
//! returned.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::{CohortConfig, EvaluationSettings};
use crate::evaluator::{CriteriaEvaluator, EvaluationError};
use crate::fhir::identifiers_from_resource;
use crate::model::{
    strip_resource_prefix, CriteriaDefinition, Identifier, ParameterSet, ResultGroup,
    StudyMetadata,
};
use crate::pseudonym::{PseudonymError, Pseudonymizer};
use crate::resolver::ReferenceResolver;
use crate::rule_client::{RuleClient, RuleService};
use crate::store::{ResourceKind, ResourceStore};

#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("Evaluation failed for subject {subject}: {source}")]
    Evaluation {
        subject: String,
        source: EvaluationError,
    },

    #[error("Subject {subject} exceeded the {timeout:?} evaluation timeout")]
    SubjectTimeout { subject: String, timeout: Duration },

    #[error("Pseudonymization failed for subject {subject}: {source}")]
    Pseudonymization {
        subject: String,
        source: PseudonymError,
    },

    #[error("Cohort run cancelled after {completed} subject(s)")]
    Cancelled { completed: usize },
}

/// What happened to one subject.
#[derive(Debug)]
enum SubjectOutcome {
    Ineligible,
    /// Eligible, but no identifier could be obtained
    Skipped,
    Qualified(Identifier),
}

#[derive(Debug, Default)]
struct RunSummary {
    evaluated: usize,
    qualified: usize,
    skipped: usize,
}

pub struct CohortAssembler {
    evaluator: CriteriaEvaluator,
    store: Arc<dyn ResourceStore>,
    pseudonymizer: Arc<dyn Pseudonymizer>,
    settings: EvaluationSettings,
}

impl CohortAssembler {
    pub fn new(
        evaluator: CriteriaEvaluator,
        store: Arc<dyn ResourceStore>,
        pseudonymizer: Arc<dyn Pseudonymizer>,
        settings: EvaluationSettings,
    ) -> Self {
        Self {
            evaluator,
            store,
            pseudonymizer,
            settings,
        }
    }

    /// Wire resolver, rule client and assembler from one configuration.
    ///
    /// The same store serves registry lookups and identity reads.
    pub fn from_config(
        config: &CohortConfig,
        store: Arc<dyn ResourceStore>,
        rules: Arc<dyn RuleService>,
        pseudonymizer: Arc<dyn Pseudonymizer>,
    ) -> Self {
        let mut resolver = ReferenceResolver::new(store.clone());
        if !config.evaluation.cache_resolutions {
            resolver = resolver.without_cache();
        }
        let evaluator = CriteriaEvaluator::new(
            Arc::new(resolver),
            RuleClient::new(rules, config.remote.clone()),
        );
        Self::new(evaluator, store, pseudonymizer, config.evaluation.clone())
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    /// Evaluate every subject and assemble the qualifying ones.
    pub async fn evaluate_cohort(
        &self,
        study: &StudyMetadata,
        definition: &CriteriaDefinition,
        subjects: &[String],
        params: &ParameterSet,
        fallback_library: &str,
    ) -> Result<ResultGroup, CohortError> {
        self.evaluate_cohort_with_cancel(
            study,
            definition,
            subjects,
            params,
            fallback_library,
            &CancelToken::new(),
        )
        .await
    }

    #[instrument(
        skip_all,
        fields(study = %study.id, subjects = subjects.len(), run_id)
    )]
    pub async fn evaluate_cohort_with_cancel(
        &self,
        study: &StudyMetadata,
        definition: &CriteriaDefinition,
        subjects: &[String],
        params: &ParameterSet,
        fallback_library: &str,
        cancel: &CancelToken,
    ) -> Result<ResultGroup, CohortError> {
        tracing::Span::current().record("run_id", tracing::field::display(Uuid::new_v4()));
        info!(
            concurrency = self.settings.max_concurrent_subjects,
            "Starting cohort evaluation"
        );

        let outcomes = stream::iter(subjects)
            .map(|subject| self.guarded_subject(definition, subject, params, fallback_library))
            .buffered(self.settings.max_concurrent_subjects.max(1));
        let mut outcomes = std::pin::pin!(outcomes);

        let mut group = ResultGroup::for_study(study);
        let mut summary = RunSummary::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(completed = summary.evaluated, "Cohort evaluation cancelled");
                    return Err(CohortError::Cancelled { completed: summary.evaluated });
                }
                next = outcomes.next() => next,
            };
            let Some(outcome) = next else { break };

            summary.evaluated += 1;
            match outcome? {
                SubjectOutcome::Ineligible => {}
                SubjectOutcome::Skipped => summary.skipped += 1,
                SubjectOutcome::Qualified(entity) => {
                    summary.qualified += 1;
                    group.add_member(entity);
                }
            }
        }

        info!(
            evaluated = summary.evaluated,
            qualified = summary.qualified,
            skipped = summary.skipped,
            "Cohort evaluation complete"
        );
        Ok(group)
    }

    async fn guarded_subject(
        &self,
        definition: &CriteriaDefinition,
        subject: &str,
        params: &ParameterSet,
        fallback_library: &str,
    ) -> Result<SubjectOutcome, CohortError> {
        let work = self.process_subject(definition, subject, params, fallback_library);
        match self.settings.subject_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, work).await.unwrap_or_else(|_| {
                Err(CohortError::SubjectTimeout {
                    subject: subject.to_string(),
                    timeout,
                })
            }),
            None => work.await,
        }
    }

    async fn process_subject(
        &self,
        definition: &CriteriaDefinition,
        subject: &str,
        params: &ParameterSet,
        fallback_library: &str,
    ) -> Result<SubjectOutcome, CohortError> {
        let eligible = self
            .evaluator
            .eval_tree(definition, subject, params, fallback_library)
            .await
            .map_err(|source| CohortError::Evaluation {
                subject: subject.to_string(),
                source,
            })?;
        if !eligible {
            debug!(subject, "Subject not eligible");
            return Ok(SubjectOutcome::Ineligible);
        }

        let record = match self
            .store
            .read(ResourceKind::Patient, strip_resource_prefix(subject))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(subject, error = %e, "Identity lookup failed, subject skipped");
                return Ok(SubjectOutcome::Skipped);
            }
        };

        let Some(first) = identifiers_from_resource(&record).into_iter().next() else {
            debug!(subject, "Eligible subject has no identifier, skipped");
            return Ok(SubjectOutcome::Skipped);
        };

        let entity = self
            .pseudonymizer
            .pseudonymize(&first)
            .map_err(|source| CohortError::Pseudonymization {
                subject: subject.to_string(),
                source,
            })?;
        Ok(SubjectOutcome::Qualified(entity))
    }
}
