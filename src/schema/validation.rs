//! Validation of raw handler output against its declared schema
//!
//! Raw output arrives as JSON from a model completion. A field that is
//! missing, `null`, or (where required non-empty) blank fails validation and
//! the output never reaches the envelope.

use super::outputs::{
    FaqAnswer, HandlerOutput, IssueReport, LegalGuidance, OutputKind, SafetyWarning,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A raw output that does not satisfy its schema
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} failed validation at `{field}`: {message}")]
pub struct ValidationFailure {
    pub kind: OutputKind,
    pub field: String,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(kind: OutputKind, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            message: message.into(),
        }
    }
}

struct Rules {
    /// Must be present and non-null
    required: &'static [&'static str],
    /// Must be a string with non-whitespace content
    non_blank: &'static [&'static str],
}

fn rules(kind: OutputKind) -> Rules {
    match kind {
        OutputKind::IssueReport => Rules {
            required: &["assessment", "severity"],
            non_blank: &["assessment"],
        },
        OutputKind::FaqAnswer => Rules {
            required: &["answer"],
            non_blank: &["answer"],
        },
        OutputKind::LegalGuidance => Rules {
            required: &["disclaimer"],
            non_blank: &["disclaimer"],
        },
        OutputKind::SafetyWarning => Rules {
            required: &["hazard_category", "immediate_action"],
            non_blank: &["hazard_category", "immediate_action"],
        },
    }
}

/// Validate `payload` as the declared `kind`
pub fn validate(kind: OutputKind, payload: &Value) -> Result<HandlerOutput, ValidationFailure> {
    let Some(object) = payload.as_object() else {
        return Err(ValidationFailure::new(kind, "$", "expected a JSON object"));
    };

    let rules = rules(kind);
    for field in rules.required {
        if object.get(*field).map_or(true, Value::is_null) {
            return Err(ValidationFailure::new(kind, *field, "required field is missing"));
        }
    }
    for field in rules.non_blank {
        match object.get(*field).and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => {}
            Some(_) => {
                return Err(ValidationFailure::new(kind, *field, "must not be empty"));
            }
            None => {
                return Err(ValidationFailure::new(kind, *field, "expected a string"));
            }
        }
    }

    match kind {
        OutputKind::IssueReport => {
            decode::<IssueReport>(kind, payload).map(HandlerOutput::IssueReport)
        }
        OutputKind::FaqAnswer => decode::<FaqAnswer>(kind, payload).map(HandlerOutput::FaqAnswer),
        OutputKind::LegalGuidance => {
            decode::<LegalGuidance>(kind, payload).map(HandlerOutput::LegalGuidance)
        }
        OutputKind::SafetyWarning => {
            decode::<SafetyWarning>(kind, payload).map(HandlerOutput::SafetyWarning)
        }
    }
}

fn decode<T: DeserializeOwned>(kind: OutputKind, payload: &Value) -> Result<T, ValidationFailure> {
    // Required fields were checked above; anything left is a type or variant mismatch
    T::deserialize(payload).map_err(|e| ValidationFailure::new(kind, "$", e.to_string()))
}
