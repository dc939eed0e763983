//! Structured output schemas, validation, and the response envelope

mod envelope;
mod outputs;
mod validation;

pub use envelope::{EnvelopeEntry, FallbackNotice, FallbackReason, ResponseEnvelope};
pub use outputs::{
    FaqAnswer, HandlerOutput, IssueReport, LegalGuidance, OutputKind, SafetyWarning, Severity,
};
pub use validation::{validate, ValidationFailure};
