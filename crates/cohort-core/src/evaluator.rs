//! Criteria Evaluator
//!
//! Recursive walk of a [`CriteriaDefinition`] for one subject.
//!
//! Two combination rules apply:
//! - inside a `Combination` node every child is evaluated and the results are
//!   reduced with the node's operator;
//! - at the root of a definition the top-level characteristics are joined by
//!   an implicit AND that stops at the first false sibling.
//!
//! The root rule has no declared operator. It is kept as is; a root-level
//! operator would need a new field on [`CriteriaDefinition`].
//!
//! Nested definitions are followed through the chain of canonicals currently
//! being evaluated. A reference back into that chain fails the evaluation
//! with [`EvaluationError::CyclicReference`].

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::model::{Characteristic, CharacteristicKind, CriteriaDefinition, Operator, ParameterSet};
use crate::reducer::reduce;
use crate::resolver::ReferenceResolver;
use crate::rule_client::{RemoteEvaluationError, RuleClient};

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Remote(#[from] RemoteEvaluationError),

    #[error("Cyclic definition reference: {}", chain.join(" -> "))]
    CyclicReference { chain: Vec<String> },
}

pub type Result<T> = std::result::Result<T, EvaluationError>;

/// Canonical without its `|version` suffix.
fn unversioned(canonical: &str) -> &str {
    canonical.split('|').next().unwrap_or(canonical)
}

/// Definitions entered on the way down to the current node, innermost first.
struct Chain<'a> {
    canonical: &'a str,
    parent: Option<&'a Chain<'a>>,
}

impl Chain<'_> {
    fn contains(&self, canonical: &str) -> bool {
        let mut link = Some(self);
        while let Some(current) = link {
            if current.canonical == canonical {
                return true;
            }
            link = current.parent;
        }
        false
    }

    /// Outermost first.
    fn path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut link = Some(self);
        while let Some(current) = link {
            path.push(current.canonical.to_string());
            link = current.parent;
        }
        path.reverse();
        path
    }
}

/// Per-call inputs shared by every node of one subject's evaluation.
#[derive(Clone, Copy)]
struct Call<'a> {
    subject: &'a str,
    params: &'a ParameterSet,
    fallback_library: &'a str,
    chain: Option<&'a Chain<'a>>,
}

#[derive(Clone)]
pub struct CriteriaEvaluator {
    resolver: Arc<ReferenceResolver>,
    rules: RuleClient,
}

impl CriteriaEvaluator {
    pub fn new(resolver: Arc<ReferenceResolver>, rules: RuleClient) -> Self {
        Self { resolver, rules }
    }

    pub fn resolver(&self) -> &Arc<ReferenceResolver> {
        &self.resolver
    }

    /// Evaluate a whole definition for `subject`.
    pub async fn eval_tree(
        &self,
        definition: &CriteriaDefinition,
        subject: &str,
        params: &ParameterSet,
        fallback_library: &str,
    ) -> Result<bool> {
        let root = definition.url.as_deref().map(|url| Chain {
            canonical: unversioned(url),
            parent: None,
        });
        let call = Call {
            subject,
            params,
            fallback_library,
            chain: root.as_ref(),
        };
        self.tree(definition, call).await
    }

    /// Evaluate one node with `context` as its enclosing definition.
    pub async fn eval_node(
        &self,
        context: &CriteriaDefinition,
        node: &Characteristic,
        subject: &str,
        params: &ParameterSet,
        fallback_library: &str,
    ) -> Result<bool> {
        let root = context.url.as_deref().map(|url| Chain {
            canonical: unversioned(url),
            parent: None,
        });
        let call = Call {
            subject,
            params,
            fallback_library,
            chain: root.as_ref(),
        };
        self.node(context, node, call).await
    }

    fn tree<'a>(
        &'a self,
        definition: &'a CriteriaDefinition,
        call: Call<'a>,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            match definition.characteristics.as_slice() {
                [] => Ok(true),
                [only] => self.node(definition, only, call).await,
                siblings => {
                    for (idx, node) in siblings.iter().enumerate() {
                        if !self.node(definition, node, call).await? {
                            trace!(
                                subject = call.subject,
                                skipped = siblings.len() - idx - 1,
                                "Top-level criterion false, short-circuiting"
                            );
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            }
        }
        .boxed()
    }

    fn node<'a>(
        &'a self,
        context: &'a CriteriaDefinition,
        node: &'a Characteristic,
        call: Call<'a>,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            let result = match &node.kind {
                CharacteristicKind::Combination {
                    code,
                    exclusive_or,
                    children,
                } => {
                    let op = Operator::for_combination(code.as_deref(), *exclusive_or);
                    let mut results = Vec::with_capacity(children.len());
                    for child in children {
                        results.push(self.node(context, child, call).await?);
                    }
                    reduce(&results, op)
                }

                CharacteristicKind::Expression { library, name } => {
                    if name.trim().is_empty() {
                        false
                    } else {
                        let resolved = self
                            .resolver
                            .resolve_library(
                                library.as_deref(),
                                context.library.as_deref(),
                                call.fallback_library,
                            )
                            .await;
                        self.rules
                            .invoke_boolean(&resolved.id, name, call.subject, call.params)
                            .await?
                    }
                }

                CharacteristicKind::Reference { canonical } => {
                    let link = Chain {
                        canonical: unversioned(canonical),
                        parent: call.chain,
                    };
                    if call.chain.is_some_and(|chain| chain.contains(link.canonical)) {
                        return Err(EvaluationError::CyclicReference { chain: link.path() });
                    }
                    match self.resolver.resolve_definition(canonical).await {
                        Some(nested) => {
                            let inner = Call {
                                chain: Some(&link),
                                ..call
                            };
                            self.tree(&nested, inner).await?
                        }
                        None => {
                            debug!(canonical = %canonical, "Unresolved reference evaluates to false");
                            false
                        }
                    }
                }

                CharacteristicKind::Unrecognized => false,
            };

            Ok(if node.exclude { !result } else { result })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemotePolicy;
    use crate::rule_client::{RuleService, RuleServiceError};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a fixed table keyed by expression name, and records calls.
    #[derive(Default)]
    struct TableService {
        answers: HashMap<String, bool>,
        calls: Mutex<Vec<String>>,
    }

    impl TableService {
        fn with(answers: &[(&str, bool)]) -> Arc<Self> {
            Arc::new(Self {
                answers: answers.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: Mutex::default(),
            })
        }

        /// Library ids called, in order
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuleService for TableService {
        async fn evaluate(
            &self,
            library_id: &str,
            _params: &ParameterSet,
        ) -> std::result::Result<ParameterSet, RuleServiceError> {
            let mut reply = ParameterSet::new();
            for (name, value) in &self.answers {
                reply.push(name.clone(), *value);
            }
            self.calls.lock().unwrap().push(library_id.to_string());
            Ok(reply)
        }
    }

    struct DownService;

    #[async_trait]
    impl RuleService for DownService {
        async fn evaluate(
            &self,
            _library_id: &str,
            _params: &ParameterSet,
        ) -> std::result::Result<ParameterSet, RuleServiceError> {
            Err(RuleServiceError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    fn evaluator_with(service: Arc<dyn RuleService>, store: MemoryStore) -> CriteriaEvaluator {
        let policy = RemotePolicy {
            max_attempts: 1,
            ..Default::default()
        };
        CriteriaEvaluator::new(
            Arc::new(ReferenceResolver::new(Arc::new(store))),
            RuleClient::new(service, policy),
        )
    }

    async fn eval(evaluator: &CriteriaEvaluator, def: &CriteriaDefinition) -> bool {
        evaluator
            .eval_tree(def, "Patient/1", &ParameterSet::new(), "Fallback")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_definition_is_true() {
        let service = TableService::with(&[]);
        let evaluator = evaluator_with(service.clone(), MemoryStore::new());

        assert!(eval(&evaluator, &CriteriaDefinition::new(vec![])).await);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_root_short_circuits() {
        let service = TableService::with(&[("a", true), ("b", false), ("c", true)]);
        let evaluator = evaluator_with(service.clone(), MemoryStore::new());
        let def = CriteriaDefinition::new(vec![
            Characteristic::expression("a"),
            Characteristic::expression("b"),
            Characteristic::expression("c"),
        ]);

        assert!(!eval(&evaluator, &def).await);
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_combination_evaluates_every_child() {
        let service = TableService::with(&[("a", false), ("b", true)]);
        let evaluator = evaluator_with(service.clone(), MemoryStore::new());
        let def = CriteriaDefinition::new(vec![Characteristic::all_of(vec![
            Characteristic::expression("a"),
            Characteristic::expression("b"),
        ])]);

        assert!(!eval(&evaluator, &def).await);
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_operators_and_xor_override() {
        let service = TableService::with(&[("t", true), ("f", false)]);
        let evaluator = evaluator_with(service, MemoryStore::new());
        let t = || Characteristic::expression("t");
        let f = || Characteristic::expression("f");

        let any = CriteriaDefinition::new(vec![Characteristic::any_of(vec![f(), t()])]);
        assert!(eval(&evaluator, &any).await);

        let two_true = CriteriaDefinition::new(vec![Characteristic::exactly_one_of(vec![t(), t(), f()])]);
        assert!(!eval(&evaluator, &two_true).await);

        let one_true = CriteriaDefinition::new(vec![Characteristic::exactly_one_of(vec![t(), f(), f()])]);
        assert!(eval(&evaluator, &one_true).await);

        let mut overridden = Characteristic::any_of(vec![t(), t()]);
        if let CharacteristicKind::Combination { exclusive_or, .. } = &mut overridden.kind {
            *exclusive_or = true;
        }
        assert!(!eval(&evaluator, &CriteriaDefinition::new(vec![overridden])).await);

        let unknown_code = CriteriaDefinition::new(vec![Characteristic::combination(
            Some("statistical"),
            vec![t(), f()],
        )]);
        assert!(!eval(&evaluator, &unknown_code).await);
    }

    #[tokio::test]
    async fn test_blank_expression_makes_no_call() {
        let service = TableService::with(&[("", true)]);
        let evaluator = evaluator_with(service.clone(), MemoryStore::new());

        let def = CriteriaDefinition::new(vec![Characteristic::expression("  ")]);
        assert!(!eval(&evaluator, &def).await);

        let excluded = CriteriaDefinition::new(vec![Characteristic::expression("").excluded()]);
        assert!(eval(&evaluator, &excluded).await);
        assert!(service.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_is_false_and_excludable() {
        let evaluator = evaluator_with(TableService::with(&[]), MemoryStore::new());

        let def = CriteriaDefinition::new(vec![Characteristic::unrecognized()]);
        assert!(!eval(&evaluator, &def).await);

        let def = CriteriaDefinition::new(vec![Characteristic::unrecognized().excluded()]);
        assert!(eval(&evaluator, &def).await);
    }

    #[tokio::test]
    async fn test_library_context_chain() {
        let service = TableService::with(&[("x", true)]);
        let evaluator = evaluator_with(service.clone(), MemoryStore::new());

        let def = CriteriaDefinition::new(vec![
            Characteristic::expression_in("http://x.org/Library/Leaf|1", "x"),
            Characteristic::expression("x"),
        ])
        .with_library("http://x.org/Library/Outer");
        assert!(eval(&evaluator, &def).await);

        let bare = CriteriaDefinition::new(vec![Characteristic::expression("x")]);
        assert!(eval(&evaluator, &bare).await);

        assert_eq!(service.calls(), vec!["Leaf", "Outer", "Fallback"]);
    }

    #[tokio::test]
    async fn test_reference_uses_nested_definition_as_context() {
        let store = MemoryStore::with_resources([json!({
            "resourceType": "EvidenceVariable",
            "id": "ev-nested",
            "url": "http://x.org/EvidenceVariable/nested",
            "extension": [{
                "url": crate::fhir::EXT_CQF_LIBRARY,
                "valueCanonical": "http://x.org/Library/Nested"
            }],
            "characteristic": [{"definitionExpression": {"expression": "x"}}]
        })]);
        let service = TableService::with(&[("x", true)]);
        let evaluator = evaluator_with(service.clone(), store);

        let def = CriteriaDefinition::new(vec![Characteristic::reference(
            "http://x.org/EvidenceVariable/nested",
        )])
        .with_library("http://x.org/Library/Outer");

        assert!(eval(&evaluator, &def).await);
        assert_eq!(service.calls(), vec!["Nested"]);
    }

    #[tokio::test]
    async fn test_unresolved_reference_is_false() {
        let evaluator = evaluator_with(TableService::with(&[]), MemoryStore::new());

        let def = CriteriaDefinition::new(vec![Characteristic::reference("http://x.org/EV/none")]);
        assert!(!eval(&evaluator, &def).await);

        let def = CriteriaDefinition::new(vec![
            Characteristic::reference("http://x.org/EV/none").excluded(),
        ]);
        assert!(eval(&evaluator, &def).await);
    }

    #[tokio::test]
    async fn test_remote_failure_propagates() {
        let evaluator = evaluator_with(Arc::new(DownService), MemoryStore::new());
        let def = CriteriaDefinition::new(vec![Characteristic::any_of(vec![
            Characteristic::expression("x"),
        ])]);

        let err = evaluator
            .eval_tree(&def, "1", &ParameterSet::new(), "Fallback")
            .await
            .unwrap_err();
        let EvaluationError::Remote(remote) = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(remote.expression, "x");
        assert_eq!(remote.library, "Fallback");
    }

    fn looping_variable(id: &str, target: &str) -> serde_json::Value {
        json!({
            "resourceType": "EvidenceVariable",
            "id": id,
            "url": format!("http://x.org/EV/{id}"),
            "version": "1.0",
            "characteristic": [
                {"definitionExpression": {"expression": "t"}},
                {"definitionCanonical": format!("http://x.org/EV/{target}")}
            ]
        })
    }

    async fn cycle_of(evaluator: &CriteriaEvaluator, def: &CriteriaDefinition) -> Vec<String> {
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            evaluator.eval_tree(def, "1", &ParameterSet::new(), "Fallback"),
        )
        .await
        .expect("cyclic evaluation did not terminate");
        match outcome {
            Err(EvaluationError::CyclicReference { chain }) => chain,
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_self_reference_is_a_cycle_error() {
        let store = MemoryStore::with_resources([looping_variable("loop", "loop")]);
        let service = TableService::with(&[("t", true)]);
        let evaluator = evaluator_with(service.clone(), store);

        let def = CriteriaDefinition::new(vec![Characteristic::reference("http://x.org/EV/loop")]);
        assert_eq!(
            cycle_of(&evaluator, &def).await,
            vec!["http://x.org/EV/loop", "http://x.org/EV/loop"]
        );
        // Warm cache takes the same path
        cycle_of(&evaluator, &def).await;
        assert_eq!(service.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mutual_reference_is_a_cycle_error() {
        let store = MemoryStore::with_resources([
            looping_variable("a", "b"),
            looping_variable("b", "a"),
        ]);
        let evaluator = evaluator_with(TableService::with(&[("t", true)]), store);

        let from_outside =
            CriteriaDefinition::new(vec![Characteristic::reference("http://x.org/EV/a|1.0")]);
        assert_eq!(
            cycle_of(&evaluator, &from_outside).await,
            vec!["http://x.org/EV/a", "http://x.org/EV/b", "http://x.org/EV/a"]
        );

        // A root definition that is itself part of the loop
        let root = CriteriaDefinition::new(vec![Characteristic::reference("http://x.org/EV/b")])
            .with_url("http://x.org/EV/a");
        assert_eq!(
            cycle_of(&evaluator, &root).await,
            vec!["http://x.org/EV/a", "http://x.org/EV/b", "http://x.org/EV/a"]
        );
    }

    #[tokio::test]
    async fn test_repeated_reference_is_not_a_cycle() {
        let store = MemoryStore::with_resources([json!({
            "resourceType": "EvidenceVariable",
            "id": "adult",
            "url": "http://x.org/EV/adult",
            "characteristic": [{"definitionExpression": {"expression": "t"}}]
        })]);
        let evaluator = evaluator_with(TableService::with(&[("t", true)]), store);

        let def = CriteriaDefinition::new(vec![Characteristic::all_of(vec![
            Characteristic::reference("http://x.org/EV/adult"),
            Characteristic::reference("http://x.org/EV/adult"),
        ])]);
        assert!(eval(&evaluator, &def).await);
    }

    fn leaf_strategy() -> impl Strategy<Value = Characteristic> {
        prop_oneof![
            Just(Characteristic::expression("t")),
            Just(Characteristic::expression("f")),
            Just(Characteristic::unrecognized()),
            Just(Characteristic::expression("")),
        ]
    }

    fn node_strategy() -> impl Strategy<Value = Characteristic> {
        leaf_strategy().prop_recursive(3, 16, 4, |inner| {
            (
                prop::collection::vec(inner, 0..4),
                prop_oneof![Just(Some("all-of")), Just(Some("any-of")), Just(None)],
                any::<bool>(),
                any::<bool>(),
            )
                .prop_map(|(children, code, xor, exclude)| {
                    let mut node = Characteristic::combination(code, children);
                    if let CharacteristicKind::Combination { exclusive_or, .. } = &mut node.kind {
                        *exclusive_or = xor;
                    }
                    node.exclude = exclude;
                    node
                })
        })
    }

    proptest! {
        #[test]
        fn prop_exclude_negates_node(node in node_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let evaluator = evaluator_with(
                TableService::with(&[("t", true), ("f", false)]),
                MemoryStore::new(),
            );
            let context = CriteriaDefinition::default();

            let mut plain = node.clone();
            plain.exclude = false;
            let mut negated = node;
            negated.exclude = true;

            let (a, b) = rt.block_on(async {
                let params = ParameterSet::new();
                let a = evaluator.eval_node(&context, &plain, "1", &params, "F").await.unwrap();
                let b = evaluator.eval_node(&context, &negated, "1", &params, "F").await.unwrap();
                (a, b)
            });
            prop_assert_eq!(a, !b);
        }
    }
}
