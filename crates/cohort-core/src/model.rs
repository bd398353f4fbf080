//! Criteria Model
//!
//! Typed eligibility tree, call parameters and the assembled result group.
//! Trees are built once (usually by [`crate::fhir::criteria_from_resource`])
//! and are read-only for the duration of a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root of an eligibility definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaDefinition {
    pub id: Option<String>,
    /// Canonical url this definition is published under
    pub url: Option<String>,
    pub version: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
    /// Rule-library canonical attached to the definition itself
    pub library: Option<String>,
    /// Top-level criteria, combined with an implicit AND
    pub characteristics: Vec<Characteristic>,
}

impl CriteriaDefinition {
    pub fn new(characteristics: Vec<Characteristic>) -> Self {
        Self {
            characteristics,
            ..Default::default()
        }
    }

    pub fn with_library(mut self, canonical: impl Into<String>) -> Self {
        self.library = Some(canonical.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// One criterion in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    /// Negates this node's own result, after children are reduced
    #[serde(default)]
    pub exclude: bool,
    pub kind: CharacteristicKind,
}

/// Closed set of node shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CharacteristicKind {
    /// Logical combination of nested characteristics
    Combination {
        /// Stated combination code (`all-of`, `any-of`, ...)
        code: Option<String>,
        /// Forces exactly-one-of-N semantics regardless of `code`
        #[serde(default)]
        exclusive_or: bool,
        children: Vec<Characteristic>,
    },

    /// Named boolean expression evaluated by the remote rule service
    Expression {
        library: Option<String>,
        name: String,
    },

    /// Delegation to another published definition
    Reference { canonical: String },

    /// Shape that matched none of the above; always evaluates to false
    Unrecognized,
}

impl Characteristic {
    pub fn combination(code: Option<&str>, children: Vec<Characteristic>) -> Self {
        Self {
            exclude: false,
            kind: CharacteristicKind::Combination {
                code: code.map(str::to_string),
                exclusive_or: false,
                children,
            },
        }
    }

    pub fn all_of(children: Vec<Characteristic>) -> Self {
        Self::combination(Some("all-of"), children)
    }

    pub fn any_of(children: Vec<Characteristic>) -> Self {
        Self::combination(Some("any-of"), children)
    }

    pub fn exactly_one_of(children: Vec<Characteristic>) -> Self {
        Self {
            exclude: false,
            kind: CharacteristicKind::Combination {
                code: None,
                exclusive_or: true,
                children,
            },
        }
    }

    pub fn expression(name: impl Into<String>) -> Self {
        Self {
            exclude: false,
            kind: CharacteristicKind::Expression {
                library: None,
                name: name.into(),
            },
        }
    }

    pub fn expression_in(library: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            exclude: false,
            kind: CharacteristicKind::Expression {
                library: Some(library.into()),
                name: name.into(),
            },
        }
    }

    pub fn reference(canonical: impl Into<String>) -> Self {
        Self {
            exclude: false,
            kind: CharacteristicKind::Reference {
                canonical: canonical.into(),
            },
        }
    }

    pub fn unrecognized() -> Self {
        Self {
            exclude: false,
            kind: CharacteristicKind::Unrecognized,
        }
    }

    pub fn excluded(mut self) -> Self {
        self.exclude = true;
        self
    }
}

/// Logical operator applied to a combination's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    And,
    Or,
    Xor,
}

impl Operator {
    /// Map a stated combination code. Unknown or absent codes are AND.
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some(c) if c.eq_ignore_ascii_case("any-of") => Self::Or,
            _ => Self::And,
        }
    }

    /// Operator for a combination node; the exclusive-or override wins.
    pub fn for_combination(code: Option<&str>, exclusive_or: bool) -> Self {
        if exclusive_or {
            Self::Xor
        } else {
            Self::from_code(code)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strip a resource-type prefix (`Patient/123` -> `123`).
pub fn strip_resource_prefix(subject: &str) -> &str {
    match subject.rfind('/') {
        Some(idx) => &subject[idx + 1..],
        None => subject,
    }
}

/// Ordered bag of named values sent to, and returned by, the rule service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    entries: Vec<NamedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: String,
    pub value: Value,
}

impl ParameterSet {
    pub const SUBJECT: &'static str = "subject";

    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping any existing entries of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.push(NamedValue {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Builder form of [`ParameterSet::push`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    /// Replace every entry called `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.entries.retain(|e| e.name != name);
        self.entries.push(NamedValue {
            name,
            value: value.into(),
        });
    }

    /// Clone with the `subject` entry set to the prefix-stripped subject id.
    pub fn with_subject(&self, subject: &str) -> Self {
        let mut call = self.clone();
        call.set(Self::SUBJECT, strip_resource_prefix(subject));
        call
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    /// First boolean-typed entry called `name`; anything else reads as false.
    pub fn get_bool(&self, name: &str) -> bool {
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .find_map(|e| e.value.as_bool())
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedValue> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Business identifier of a person (system + value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub system: Option<String>,
    pub value: Option<String>,
}

impl Identifier {
    pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            value: Some(value.into()),
        }
    }
}

/// Metadata of the study a cohort is assembled for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyMetadata {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl StudyMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Person,
}

/// A qualifying subject, known only by its pseudonymized identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub entity: Identifier,
}

/// Assembled cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultGroup {
    pub id: String,
    pub kind: GroupKind,
    pub active: bool,
    pub name: String,
    pub description: Option<String>,
    pub members: Vec<GroupMember>,
}

impl ResultGroup {
    /// Empty group carrying the study's metadata.
    pub fn for_study(study: &StudyMetadata) -> Self {
        Self {
            id: format!("group-{}", study.id),
            kind: GroupKind::Person,
            active: true,
            name: format!(
                "Patient Eligible for: {}",
                study.name.as_deref().unwrap_or_default()
            ),
            description: study.description.clone(),
            members: Vec::new(),
        }
    }

    pub fn add_member(&mut self, entity: Identifier) {
        self.members.push(GroupMember { entity });
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
