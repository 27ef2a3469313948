//! Path addressing into a canonical entity document.
//!
//! Entities are `serde_json` documents; a path is a dotted list of object
//! keys (`bindings.space.F1`). Operations never index into arrays.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::mutation::{MutationError, MutationResult, Operation, Verb};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityPath(Vec<String>);

impl EntityPath {
    pub fn parse(path: &str) -> MutationResult<Self> {
        Self::from_segments(path.split('.'))
    }

    pub fn from_segments<I, S>(segments: I) -> MutationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .map(|segment| segment.as_ref().to_string())
            .collect();
        let rendered = segments.join(".");
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(MutationError::InvalidPath {
                path: rendered,
                reason: "empty segment".to_string(),
            });
        }
        if let Some(bad) = segments.iter().find(|segment| segment.contains('.')) {
            return Err(MutationError::InvalidPath {
                path: rendered.clone(),
                reason: format!("segment '{}' contains '.'", bad),
            });
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn parent(&self) -> &[String] {
        &self.0[..self.0.len() - 1]
    }

    pub fn leaf(&self) -> &str {
        // never empty: construction rejects empty paths
        &self.0[self.0.len() - 1]
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for EntityPath {
    type Err = MutationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityPath {
    type Error = MutationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityPath> for String {
    fn from(path: EntityPath) -> Self {
        path.to_string()
    }
}

pub fn get<'a>(document: &'a Value, path: &EntityPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(document, |node, segment| node.as_object()?.get(segment))
}

/// Applies `operations` in order to a copy of `document`. Either every
/// operation applies or `document` is left as it was.
pub fn apply_all(document: &Value, operations: &[Operation]) -> MutationResult<Value> {
    if operations.is_empty() {
        return Err(MutationError::Empty);
    }
    let mut working = document.clone();
    for operation in operations {
        apply(&mut working, operation)?;
    }
    Ok(working)
}

fn apply(document: &mut Value, operation: &Operation) -> MutationResult<()> {
    let path = &operation.path;
    match operation.verb {
        Verb::Add => {
            let value = required_value(operation)?;
            let parent = parent_object(document, path, true)?;
            if parent.contains_key(path.leaf()) {
                return Err(MutationError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            parent.insert(path.leaf().to_string(), value);
        }
        Verb::Modify => {
            let value = required_value(operation)?;
            let slot = parent_object(document, path, false)?
                .get_mut(path.leaf())
                .ok_or_else(|| MutationError::NotFound {
                    path: path.to_string(),
                })?;
            *slot = value;
        }
        Verb::Delete => {
            parent_object(document, path, false)?
                .remove(path.leaf())
                .ok_or_else(|| MutationError::NotFound {
                    path: path.to_string(),
                })?;
        }
    }
    Ok(())
}

fn required_value(operation: &Operation) -> MutationResult<Value> {
    operation
        .value
        .clone()
        .ok_or_else(|| MutationError::MissingValue {
            path: operation.path.to_string(),
            verb: operation.verb,
        })
}

/// Walks to the object holding `path`'s leaf. With `create`, missing
/// intermediate objects are created on the way.
fn parent_object<'a>(
    document: &'a mut Value,
    path: &EntityPath,
    create: bool,
) -> MutationResult<&'a mut Map<String, Value>> {
    let mut node = document;
    let mut walked: Vec<&str> = Vec::new();
    for segment in path.parent() {
        walked.push(segment);
        let object = node.as_object_mut().ok_or_else(|| MutationError::NotAnObject {
            path: walked[..walked.len() - 1].join("."),
        })?;
        node = if create {
            object
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()))
        } else {
            object.get_mut(segment).ok_or_else(|| MutationError::NotFound {
                path: walked.join("."),
            })?
        };
    }
    node.as_object_mut().ok_or_else(|| MutationError::NotAnObject {
        path: walked.join("."),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn path(s: &str) -> EntityPath {
        EntityPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_rejects_empty_segments() {
        assert!(EntityPath::parse("").is_err());
        assert!(EntityPath::parse("bindings..F1").is_err());
        assert!(EntityPath::parse(".bindings").is_err());
        assert!(EntityPath::from_segments(["bindings", "a.b"]).is_err());
        assert_eq!(path("bindings.space.F1").leaf(), "F1");
    }

    #[test]
    fn test_add_modify_delete() {
        let document = json!({ "bindings": { "space": {} } });

        let added = apply_all(
            &document,
            &[Operation::add(path("bindings.space.F1"), json!("jump"))],
        )
        .unwrap();
        assert_eq!(added, json!({ "bindings": { "space": { "F1": "jump" } } }));

        let modified = apply_all(
            &added,
            &[Operation::modify(path("bindings.space.F1"), json!("fly"))],
        )
        .unwrap();
        assert_eq!(get(&modified, &path("bindings.space.F1")), Some(&json!("fly")));

        let deleted = apply_all(&modified, &[Operation::delete(path("bindings.space.F1"))]).unwrap();
        assert_eq!(deleted, document);
    }

    #[test]
    fn test_verb_preconditions() {
        let document = json!({ "bindings": { "space": { "F1": "jump" } } });

        assert!(matches!(
            apply_all(&document, &[Operation::add(path("bindings.space.F1"), json!("x"))]),
            Err(MutationError::AlreadyExists { .. })
        ));
        assert!(matches!(
            apply_all(&document, &[Operation::modify(path("bindings.space.F2"), json!("x"))]),
            Err(MutationError::NotFound { .. })
        ));
        assert!(matches!(
            apply_all(&document, &[Operation::delete(path("bindings.ground.F1"))]),
            Err(MutationError::NotFound { .. })
        ));
        assert!(matches!(
            apply_all(&document, &[Operation::add(path("bindings.space.F1.deeper"), json!(1))]),
            Err(MutationError::NotAnObject { .. })
        ));
        assert!(matches!(apply_all(&document, &[]), Err(MutationError::Empty)));
    }

    #[test]
    fn test_add_creates_intermediate_objects() {
        let updated = apply_all(
            &json!({}),
            &[Operation::add(path("bindings.alias.hello"), json!("say hi"))],
        )
        .unwrap();
        assert_eq!(updated, json!({ "bindings": { "alias": { "hello": "say hi" } } }));
    }

    #[test]
    fn test_failed_batch_is_atomic() {
        let document = json!({ "bindings": { "space": { "F1": "jump" } } });
        let result = apply_all(
            &document,
            &[
                Operation::add(path("bindings.space.F2"), json!("duck")),
                Operation::delete(path("bindings.space.F9")),
            ],
        );
        assert!(result.is_err());
        assert_eq!(document, json!({ "bindings": { "space": { "F1": "jump" } } }));
    }

    #[test]
    fn test_path_serializes_as_dotted_string() {
        let operation = Operation::add(path("bindings.space.F1"), json!("jump"));
        let value = serde_json::to_value(&operation).unwrap();
        assert_eq!(value["path"], json!("bindings.space.F1"));
        assert!(serde_json::from_value::<Operation>(json!({ "verb": "delete", "path": "a..b" })).is_err());
    }

    proptest! {
        #[test]
        fn prop_add_then_delete_restores(key in "[A-Za-z][A-Za-z0-9_]{0,8}", command in "[a-z ]{0,16}") {
            let document = json!({ "bindings": { "space": { "existing": "keep" } } });
            prop_assume!(key != "existing");
            let target = EntityPath::from_segments(["bindings", "space", key.as_str()]).unwrap();

            let added = apply_all(&document, &[Operation::add(target.clone(), json!(command))]).unwrap();
            prop_assert_eq!(get(&added, &target), Some(&json!(command)));

            let restored = apply_all(&added, &[Operation::delete(target)]).unwrap();
            prop_assert_eq!(restored, document);
        }

        #[test]
        fn prop_modify_never_creates(key in "[A-Za-z][A-Za-z0-9_]{0,8}") {
            let document = json!({ "bindings": {} });
            let target = EntityPath::from_segments(["bindings", key.as_str()]).unwrap();
            let result = apply_all(&document, &[Operation::modify(target, json!(1))]);
            prop_assert!(
                matches!(result, Err(MutationError::NotFound { .. })),
                "expected NotFound error"
            );
        }
    }
}
