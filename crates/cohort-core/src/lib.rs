//! Cohort Core - recursive eligibility evaluation
//!
//! Decides which subjects of a population satisfy an eligibility definition
//! and assembles them, pseudonymized, into a result group.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  CohortAssembler   (subjects -> ResultGroup)             │
//! └──────────────────────────────────────────────────────────┘
//!            │ per subject                 │ qualifying only
//!            ▼                             ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │  CriteriaEvaluator       │   │  ResourceStore (identity)│
//! │  tree walk + reduce      │   │  Pseudonymizer           │
//! └──────────────────────────┘   └──────────────────────────┘
//!      │ references    │ leaves
//!      ▼               ▼
//! ┌──────────────┐ ┌──────────────────────────────────────┐
//! │ Reference    │ │ RuleClient (timeout + retry)         │
//! │ Resolver     │ │   -> RuleService (remote library)    │
//! └──────────────┘ └──────────────────────────────────────┘
//! ```
//!
//! Remote collaborators ([`ResourceStore`], [`RuleService`]) are async
//! traits; HTTP implementations live in the `cohort-client` crate and
//! [`MemoryStore`] serves embedders and tests.
//!
//! # Usage
//!
//! ```ignore
//! let config = CohortConfig::from_file("config/cohort.yaml")?;
//! let assembler = CohortAssembler::from_config(
//!     &config,
//!     store.clone(),
//!     rules,
//!     Arc::new(KeyedHashPseudonymizer::from_config(&config.pseudonymization)?),
//! );
//!
//! let definition = criteria_from_resource(&store.read(ResourceKind::EvidenceVariable, "ev-1").await?)?;
//! let study = study_from_resource(&store.read(ResourceKind::ResearchStudy, "rs-1").await?)?;
//! let group = assembler
//!     .evaluate_cohort(&study, &definition, &subjects, &ParameterSet::new(), "Eligibility")
//!     .await?;
//! ```

pub mod assembler;
pub mod cancel;
pub mod config;
pub mod evaluator;
pub mod fhir;
pub mod model;
pub mod pseudonym;
pub mod reducer;
pub mod resolver;
pub mod rule_client;
pub mod store;
pub mod telemetry;

// Re-export main types
pub use assembler::{CohortAssembler, CohortError};
pub use cancel::CancelToken;
pub use config::{
    CohortConfig, ConfigError, EndpointConfig, EvaluationSettings, PseudonymConfig, RemotePolicy,
};
pub use evaluator::{CriteriaEvaluator, EvaluationError};
pub use fhir::{criteria_from_resource, identifiers_from_resource, study_from_resource, MappingError};
pub use model::{
    Characteristic, CharacteristicKind, CriteriaDefinition, GroupMember, Identifier, Operator,
    ParameterSet, ResultGroup, StudyMetadata,
};
pub use pseudonym::{KeyedHashPseudonymizer, PseudonymError, Pseudonymizer};
pub use reducer::reduce;
pub use resolver::{LibrarySource, ReferenceResolver, ResolvedLibrary};
pub use rule_client::{RemoteEvaluationError, RuleClient, RuleService, RuleServiceError};
pub use store::{MemoryStore, ResourceKind, ResourceStore, SearchParams, StoreError};
pub use telemetry::init_tracing;
