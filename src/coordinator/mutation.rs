use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::entity::EntityPath;
use crate::event::HandlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
    /// Create at a path that must not exist yet.
    Add,
    /// Replace the value at an existing path.
    Modify,
    /// Remove an existing path.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub verb: Verb,
    pub path: EntityPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Operation {
    pub fn add(path: EntityPath, value: Value) -> Self {
        Self {
            verb: Verb::Add,
            path,
            value: Some(value),
        }
    }

    pub fn modify(path: EntityPath, value: Value) -> Self {
        Self {
            verb: Verb::Modify,
            path,
            value: Some(value),
        }
    }

    pub fn delete(path: EntityPath) -> Self {
        Self {
            verb: Verb::Delete,
            path,
            value: None,
        }
    }
}

/// Payload of `data.update_profile`.
///
/// Without `profile_id` the current profile is targeted. With
/// `expected_revision` the batch is rejected if anything was committed since
/// the caller's snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_revision: Option<u64>,
}

impl MutationEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_profile(profile_id: &str) -> Self {
        Self {
            profile_id: Some(profile_id.to_string()),
            ..Self::default()
        }
    }

    pub fn with(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn expecting(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}

/// Wire form of `data.update_profile`. Paths stay plain strings until the
/// coordinator validates them, so a malformed path is reported as
/// `mutation.invalid_path` rather than as an undecodable payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub operations: Vec<RawOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_revision: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOperation {
    pub verb: Verb,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl TryFrom<RawOperation> for Operation {
    type Error = MutationError;

    fn try_from(raw: RawOperation) -> MutationResult<Self> {
        Ok(Self {
            verb: raw.verb,
            path: EntityPath::parse(&raw.path)?,
            value: raw.value,
        })
    }
}

impl TryFrom<UpdateRequest> for MutationEnvelope {
    type Error = MutationError;

    fn try_from(request: UpdateRequest) -> MutationResult<Self> {
        Ok(Self {
            profile_id: request.profile_id,
            operations: request
                .operations
                .into_iter()
                .map(Operation::try_from)
                .collect::<MutationResult<_>>()?,
            expected_revision: request.expected_revision,
        })
    }
}

/// Reply to a committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReceipt {
    pub revision: u64,
    pub applied: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("Path already exists: {path}")]
    AlreadyExists { path: String },
    #[error("Path not found: {path}")]
    NotFound { path: String },
    #[error("Not an object: '{path}'")]
    NotAnObject { path: String },
    #[error("{verb} at {path} requires a value")]
    MissingValue { path: String, verb: Verb },
    #[error("Mutation contains no operations")]
    Empty,
    #[error("Revision conflict: expected {expected}, current {actual}")]
    RevisionConflict { expected: u64, actual: u64 },
    #[error("Unknown profile: {profile}")]
    UnknownProfile { profile: String },
    #[error("Profile already exists: {profile}")]
    ProfileExists { profile: String },
    #[error("Invalid profile id: '{profile}'")]
    InvalidProfileId { profile: String },
    #[error("Cannot delete the last profile: {profile}")]
    LastProfile { profile: String },
}

pub type MutationResult<T> = Result<T, MutationError>;

impl MutationError {
    /// Error kind carried over the request/response channel.
    pub fn kind(&self) -> &'static str {
        match self {
            MutationError::InvalidPath { .. } => "mutation.invalid_path",
            MutationError::AlreadyExists { .. } => "mutation.already_exists",
            MutationError::NotFound { .. } => "mutation.not_found",
            MutationError::NotAnObject { .. } => "mutation.not_an_object",
            MutationError::MissingValue { .. } => "mutation.missing_value",
            MutationError::Empty => "mutation.empty",
            MutationError::RevisionConflict { .. } => "mutation.revision_conflict",
            MutationError::UnknownProfile { .. } => "mutation.unknown_profile",
            MutationError::ProfileExists { .. } => "mutation.profile_exists",
            MutationError::InvalidProfileId { .. } => "mutation.invalid_profile_id",
            MutationError::LastProfile { .. } => "mutation.last_profile",
        }
    }
}

impl From<MutationError> for HandlerError {
    fn from(err: MutationError) -> Self {
        HandlerError::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = MutationEnvelope::new()
            .with(Operation::add(
                EntityPath::parse("bindings.space.F1").unwrap(),
                json!("jump"),
            ))
            .with(Operation::delete(EntityPath::parse("bindings.space.F2").unwrap()))
            .expecting(7);

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "operations": [
                    { "verb": "add", "path": "bindings.space.F1", "value": "jump" },
                    { "verb": "delete", "path": "bindings.space.F2" }
                ],
                "expected_revision": 7
            })
        );
    }

    #[test]
    fn test_update_request_validates_paths() {
        let request: UpdateRequest = serde_json::from_value(json!({
            "operations": [
                { "verb": "add", "path": "bindings.space.F1", "value": "jump" },
                { "verb": "delete", "path": "bindings..F2" }
            ]
        }))
        .unwrap();

        let err = MutationEnvelope::try_from(request.clone()).unwrap_err();
        assert_eq!(err.kind(), "mutation.invalid_path");

        let mut valid = request;
        valid.operations.truncate(1);
        let envelope = MutationEnvelope::try_from(valid).unwrap();
        assert_eq!(envelope.operations[0].path.to_string(), "bindings.space.F1");
        assert_eq!(envelope.operations[0].value, Some(json!("jump")));
    }

    #[test]
    fn test_error_kind_travels_as_handler_error() {
        let error: HandlerError = MutationError::RevisionConflict {
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(error.kind, "mutation.revision_conflict");
        assert!(error.message.contains("expected 1"));
    }
}
