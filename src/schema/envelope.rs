//! The unified response envelope returned for every turn

use super::outputs::HandlerOutput;
use crate::handlers::{FailureReason, HandlerId};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Why a handler's slot holds a fallback instead of its output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackReason {
    HandlerFailed { reason: FailureReason },
    ValidationFailed { field: String },
}

/// User-facing notice standing in for a failed handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackNotice {
    pub handler: HandlerId,
    pub reason: FallbackReason,
    pub message: String,
}

impl FallbackNotice {
    pub fn handler_failed(handler: HandlerId, reason: FailureReason) -> Self {
        Self {
            handler,
            message: format!(
                "The {} service could not complete this request ({}). Please try again.",
                handler.display_name(),
                reason.describe()
            ),
            reason: FallbackReason::HandlerFailed { reason },
        }
    }

    pub fn validation_failed(handler: HandlerId, field: impl Into<String>) -> Self {
        Self {
            handler,
            message: format!(
                "The {} service returned an incomplete answer. Please try again.",
                handler.display_name()
            ),
            reason: FallbackReason::ValidationFailed {
                field: field.into(),
            },
        }
    }
}

/// One slot in the envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", content = "data", rename_all = "snake_case")]
pub enum EnvelopeEntry {
    Output(HandlerOutput),
    Fallback(FallbackNotice),
}

impl EnvelopeEntry {
    pub fn is_fallback(&self) -> bool {
        matches!(self, EnvelopeEntry::Fallback(_))
    }

    pub fn output(&self) -> Option<&HandlerOutput> {
        match self {
            EnvelopeEntry::Output(output) => Some(output),
            EnvelopeEntry::Fallback(_) => None,
        }
    }

    /// One-line digest for conversation history
    pub fn summary(&self) -> String {
        match self {
            EnvelopeEntry::Output(output) => output.summary(),
            EnvelopeEntry::Fallback(notice) => {
                format!("{} unavailable", notice.handler.display_name())
            }
        }
    }
}

/// Ordered outputs for one turn. A safety warning, when present, is first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// 1-based turn number within the session
    pub turn: usize,
    /// Handlers selected for this turn, in canonical order
    pub route: Vec<HandlerId>,
    pub entries: Vec<EnvelopeEntry>,
    /// Follow-up asked of the user, e.g. for a photo of the problem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
}

impl ResponseEnvelope {
    pub fn outputs(&self) -> impl Iterator<Item = &HandlerOutput> {
        self.entries.iter().filter_map(EnvelopeEntry::output)
    }

    pub fn fallbacks(&self) -> impl Iterator<Item = &FallbackNotice> {
        self.entries.iter().filter_map(|entry| match entry {
            EnvelopeEntry::Fallback(notice) => Some(notice),
            EnvelopeEntry::Output(_) => None,
        })
    }

    /// Render every entry as one markdown document
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push_str("\n---\n\n");
            }
            match entry {
                EnvelopeEntry::Output(output) => out.push_str(&output.to_markdown()),
                EnvelopeEntry::Fallback(notice) => {
                    let _ = writeln!(out, "> {}", notice.message);
                }
            }
        }
        if let Some(clarification) = &self.clarification {
            let _ = writeln!(out, "\n{clarification}");
        }
        out
    }
}
