//! Resource Mapping
//!
//! Converts between FHIR-style JSON resources and the typed model:
//! EvidenceVariable -> [`CriteriaDefinition`], ResearchStudy -> [`StudyMetadata`],
//! Patient identifiers, Parameters <-> [`ParameterSet`], and
//! [`ResultGroup`] -> Group.
//!
//! Extensions (`cqf-library`, exclusive-or) are read once here, so the
//! evaluator never rescans raw metadata.

use serde_json::{json, Map, Value};

use crate::model::{
    Characteristic, CharacteristicKind, CriteriaDefinition, Identifier, ParameterSet,
    ResultGroup, StudyMetadata,
};

pub const EXT_CQF_LIBRARY: &str = "http://hl7.org/fhir/StructureDefinition/cqf-library";
pub const EXT_EXCLUSIVE_OR: &str =
    "https://www.centreantoinelacassagne.org/StructureDefinition/EXT-Exclusive-OR";

/// Errors raised when a resource is not of the expected type
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("Expected {expected} resource, found {found}")]
    WrongResourceType { expected: &'static str, found: String },
}

fn check_type(resource: &Value, expected: &'static str) -> Result<(), MappingError> {
    match resource.get("resourceType").and_then(Value::as_str) {
        Some(t) if t == expected => Ok(()),
        other => Err(MappingError::WrongResourceType {
            expected,
            found: other.unwrap_or("<none>").to_string(),
        }),
    }
}

fn str_field(resource: &Value, field: &str) -> Option<String> {
    resource
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extensions<'a>(element: &'a Value, url: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    element
        .get("extension")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(move |ext| ext.get("url").and_then(Value::as_str) == Some(url))
}

/// First `cqf-library` canonical on an element.
fn library_extension(element: &Value) -> Option<String> {
    extensions(element, EXT_CQF_LIBRARY)
        .find_map(|ext| ext.get("valueCanonical").and_then(Value::as_str))
        .map(str::to_string)
}

/// Value of the first boolean exclusive-or extension, false when absent.
fn exclusive_or_extension(element: &Value) -> bool {
    extensions(element, EXT_EXCLUSIVE_OR)
        .find_map(|ext| ext.get("valueBoolean").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Build a criteria tree from an EvidenceVariable resource.
pub fn criteria_from_resource(resource: &Value) -> Result<CriteriaDefinition, MappingError> {
    check_type(resource, "EvidenceVariable")?;

    Ok(CriteriaDefinition {
        id: str_field(resource, "id"),
        url: str_field(resource, "url"),
        version: str_field(resource, "version"),
        label: str_field(resource, "title").or_else(|| str_field(resource, "name")),
        description: str_field(resource, "description"),
        library: library_extension(resource),
        characteristics: characteristics(resource),
    })
}

fn characteristics(parent: &Value) -> Vec<Characteristic> {
    parent
        .get("characteristic")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(characteristic).collect())
        .unwrap_or_default()
}

fn characteristic(element: &Value) -> Characteristic {
    let exclude = element
        .get("exclude")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let kind = if let Some(comb) = element.get("definitionByCombination") {
        CharacteristicKind::Combination {
            code: str_field(comb, "code"),
            exclusive_or: exclusive_or_extension(comb),
            children: characteristics(comb),
        }
    } else if let Some(expr) = element.get("definitionExpression") {
        CharacteristicKind::Expression {
            library: library_extension(element),
            name: str_field(expr, "expression").unwrap_or_default(),
        }
    } else if let Some(canonical) = element.get("definitionCanonical").and_then(Value::as_str) {
        CharacteristicKind::Reference {
            canonical: canonical.to_string(),
        }
    } else {
        CharacteristicKind::Unrecognized
    };

    Characteristic { exclude, kind }
}

/// Study metadata from a ResearchStudy resource.
pub fn study_from_resource(resource: &Value) -> Result<StudyMetadata, MappingError> {
    check_type(resource, "ResearchStudy")?;

    Ok(StudyMetadata {
        id: str_field(resource, "id").unwrap_or_default(),
        name: str_field(resource, "name").or_else(|| str_field(resource, "title")),
        description: str_field(resource, "description"),
    })
}

/// Identifiers of a person resource, in declared order.
pub fn identifiers_from_resource(resource: &Value) -> Vec<Identifier> {
    resource
        .get("identifier")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .map(|id| Identifier {
                    system: str_field(id, "system"),
                    value: str_field(id, "value"),
                })
                .collect()
        })
        .unwrap_or_default()
}

impl ParameterSet {
    /// Encode as a Parameters resource.
    ///
    /// Booleans, strings and numbers become `valueBoolean`, `valueString`,
    /// `valueInteger`/`valueDecimal`. Objects carrying a `resourceType` are
    /// sent as `resource`; an object with a single `value[x]` key (for
    /// example `{"valueDate": "2024-01-01"}`) is passed through as typed.
    pub fn to_resource(&self) -> Value {
        let parameter: Vec<Value> = self
            .iter()
            .map(|entry| {
                let mut param = Map::new();
                param.insert("name".into(), Value::String(entry.name.clone()));
                match &entry.value {
                    Value::Null => {}
                    Value::Bool(b) => {
                        param.insert("valueBoolean".into(), Value::Bool(*b));
                    }
                    Value::String(s) => {
                        param.insert("valueString".into(), Value::String(s.clone()));
                    }
                    Value::Number(n) if n.is_f64() => {
                        param.insert("valueDecimal".into(), Value::Number(n.clone()));
                    }
                    Value::Number(n) => {
                        param.insert("valueInteger".into(), Value::Number(n.clone()));
                    }
                    Value::Object(obj) if obj.contains_key("resourceType") => {
                        param.insert("resource".into(), entry.value.clone());
                    }
                    Value::Object(obj)
                        if obj.len() == 1 && obj.keys().all(|k| k.starts_with("value")) =>
                    {
                        param.extend(obj.clone());
                    }
                    other => {
                        param.insert("valueString".into(), Value::String(other.to_string()));
                    }
                }
                Value::Object(param)
            })
            .collect();

        json!({ "resourceType": "Parameters", "parameter": parameter })
    }

    /// Decode a Parameters resource. Entries without a name are dropped;
    /// `value[x]` and `resource` become the entry value, anything else null.
    pub fn from_resource(resource: &Value) -> Result<Self, MappingError> {
        check_type(resource, "Parameters")?;

        let mut params = ParameterSet::new();
        for param in resource
            .get("parameter")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(name) = param.get("name").and_then(Value::as_str) else {
                continue;
            };
            let value = param
                .as_object()
                .and_then(|obj| {
                    obj.iter()
                        .find(|(k, _)| k.starts_with("value") || k.as_str() == "resource")
                        .map(|(_, v)| v.clone())
                })
                .unwrap_or(Value::Null);
            params.push(name, value);
        }
        Ok(params)
    }
}

impl ResultGroup {
    /// Encode as a Group resource. Members reference identifiers only.
    pub fn to_resource(&self) -> Value {
        let members: Vec<Value> = self
            .members
            .iter()
            .map(|m| {
                json!({
                    "entity": {
                        "identifier": {
                            "system": m.entity.system,
                            "value": m.entity.value,
                        }
                    }
                })
            })
            .collect();

        let mut group = json!({
            "resourceType": "Group",
            "id": self.id,
            "type": "person",
            "membership": "enumerated",
            "active": self.active,
            "name": self.name,
            "member": members,
        });
        if let Some(description) = &self.description {
            group["description"] = Value::String(description.clone());
        }
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operator;

    fn evidence_variable() -> Value {
        json!({
            "resourceType": "EvidenceVariable",
            "id": "ev-diabetes",
            "url": "http://example.org/EvidenceVariable/diabetes",
            "version": "1.0.0",
            "title": "Adults with diabetes",
            "extension": [
                {"url": EXT_CQF_LIBRARY, "valueCanonical": "http://example.org/Library/Eligibility|1.0.0"}
            ],
            "characteristic": [
                {
                    "definitionByCombination": {
                        "code": "any-of",
                        "extension": [{"url": EXT_EXCLUSIVE_OR, "valueBoolean": true}],
                        "characteristic": [
                            {"definitionExpression": {"language": "text/cql-identifier", "expression": "hasType1"}},
                            {
                                "extension": [{"url": EXT_CQF_LIBRARY, "valueCanonical": "http://example.org/Library/T2"}],
                                "definitionExpression": {"expression": "hasType2"}
                            }
                        ]
                    }
                },
                {"exclude": true, "definitionCanonical": "http://example.org/EvidenceVariable/pregnant"},
                {"description": "no definition at all"}
            ]
        })
    }

    #[test]
    fn test_criteria_from_resource() {
        let def = criteria_from_resource(&evidence_variable()).unwrap();

        assert_eq!(def.id.as_deref(), Some("ev-diabetes"));
        assert_eq!(def.label.as_deref(), Some("Adults with diabetes"));
        assert_eq!(
            def.library.as_deref(),
            Some("http://example.org/Library/Eligibility|1.0.0")
        );
        assert_eq!(def.characteristics.len(), 3);

        match &def.characteristics[0].kind {
            CharacteristicKind::Combination {
                code,
                exclusive_or,
                children,
            } => {
                assert_eq!(code.as_deref(), Some("any-of"));
                assert!(*exclusive_or);
                assert_eq!(
                    Operator::for_combination(code.as_deref(), *exclusive_or),
                    Operator::Xor
                );
                assert_eq!(children.len(), 2);
                assert_eq!(children[0], Characteristic::expression("hasType1"));
                assert_eq!(
                    children[1],
                    Characteristic::expression_in("http://example.org/Library/T2", "hasType2")
                );
            }
            other => panic!("expected combination, got {other:?}"),
        }

        assert_eq!(
            def.characteristics[1],
            Characteristic::reference("http://example.org/EvidenceVariable/pregnant").excluded()
        );
        assert_eq!(def.characteristics[2], Characteristic::unrecognized());
    }

    #[test]
    fn test_missing_expression_maps_to_blank_name() {
        let ev = json!({
            "resourceType": "EvidenceVariable",
            "characteristic": [{"definitionExpression": {"language": "text/cql"}}]
        });
        let def = criteria_from_resource(&ev).unwrap();
        assert_eq!(def.characteristics[0], Characteristic::expression(""));
    }

    #[test]
    fn test_wrong_resource_type() {
        let err = criteria_from_resource(&json!({"resourceType": "Library"})).unwrap_err();
        assert!(matches!(
            err,
            MappingError::WrongResourceType { expected: "EvidenceVariable", .. }
        ));
    }

    #[test]
    fn test_study_and_identifiers() {
        let study = study_from_resource(&json!({
            "resourceType": "ResearchStudy",
            "id": "rs-1",
            "name": "DIAB-2024",
            "description": "Diabetes study"
        }))
        .unwrap();
        assert_eq!(study.id, "rs-1");
        assert_eq!(study.name.as_deref(), Some("DIAB-2024"));

        let ids = identifiers_from_resource(&json!({
            "resourceType": "Patient",
            "identifier": [
                {"system": "urn:ins", "value": "1234"},
                {"value": "other"}
            ]
        }));
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], Identifier::new("urn:ins", "1234"));
        assert_eq!(ids[1].system, None);

        assert!(identifiers_from_resource(&json!({"resourceType": "Patient"})).is_empty());
    }

    #[test]
    fn test_parameters_encoding() {
        let params = ParameterSet::new()
            .with("subject", "42")
            .with("adult", true)
            .with("age", 18)
            .with("score", 0.5)
            .with("period", json!({"valuePeriod": {"start": "2024-01-01"}}));

        let resource = params.to_resource();
        let parameter = resource["parameter"].as_array().unwrap();

        assert_eq!(resource["resourceType"], "Parameters");
        assert_eq!(parameter[0], json!({"name": "subject", "valueString": "42"}));
        assert_eq!(parameter[1], json!({"name": "adult", "valueBoolean": true}));
        assert_eq!(parameter[2], json!({"name": "age", "valueInteger": 18}));
        assert_eq!(parameter[3], json!({"name": "score", "valueDecimal": 0.5}));
        assert_eq!(
            parameter[4],
            json!({"name": "period", "valuePeriod": {"start": "2024-01-01"}})
        );
    }

    #[test]
    fn test_parameters_decoding() {
        let reply = ParameterSet::from_resource(&json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "hasCondition", "valueBoolean": true},
                {"name": "label", "valueString": "x"},
                {"valueBoolean": false},
                {"name": "Patient", "resource": {"resourceType": "Patient", "id": "1"}}
            ]
        }))
        .unwrap();

        assert_eq!(reply.len(), 3);
        assert!(reply.get_bool("hasCondition"));
        assert!(!reply.get_bool("label"));
        assert_eq!(reply.get("Patient").unwrap()["id"], "1");
    }

    #[test]
    fn test_group_resource_has_no_raw_reference() {
        let mut group = ResultGroup::for_study(&StudyMetadata::new("rs-1"));
        group.add_member(Identifier::new("urn:ins", "ab12"));

        let resource = group.to_resource();
        assert_eq!(resource["resourceType"], "Group");
        assert_eq!(resource["type"], "person");
        assert_eq!(resource["active"], true);
        assert_eq!(
            resource["member"][0]["entity"],
            json!({"identifier": {"system": "urn:ins", "value": "ab12"}})
        );
        assert!(resource["member"][0]["entity"].get("reference").is_none());
    }
}
