//! Response assembly
//!
//! Validates raw handler results and folds them into one envelope plus the
//! successor conversation state.

use crate::classifier::Route;
use crate::conversation::{ContextDelta, ConversationState, Request, Turn};
use crate::handlers::{HandlerFailure, HandlerId, HandlerReply};
use crate::schema::{validate, EnvelopeEntry, FallbackNotice, ResponseEnvelope};

/// Asked when text describes a visible defect and no photo came with it
pub const PHOTO_REQUEST: &str =
    "To help with this property issue I'll need to see it. Could you upload a photo of the problem?";

/// A handler result after schema validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedResult {
    pub handler: HandlerId,
    pub entry: EnvelopeEntry,
    /// Empty unless the entry is a valid output
    pub delta: ContextDelta,
}

impl ValidatedResult {
    /// Validate one raw result, substituting a fallback notice on failure
    pub fn from_result(handler: HandlerId, result: Result<HandlerReply, HandlerFailure>) -> Self {
        let fallback = |notice| Self {
            handler,
            entry: EnvelopeEntry::Fallback(notice),
            delta: ContextDelta::new(),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(failure) => {
                tracing::warn!(
                    handler = %handler,
                    reason = ?failure.reason,
                    error = %failure.message,
                    "Handler failed"
                );
                return fallback(FallbackNotice::handler_failed(handler, failure.reason));
            }
        };

        if reply.kind != handler.output_kind() {
            tracing::warn!(
                handler = %handler,
                declared = %reply.kind,
                "Handler declared the wrong output kind"
            );
            return fallback(FallbackNotice::validation_failed(handler, "type"));
        }

        match validate(reply.kind, &reply.payload) {
            Ok(output) => Self {
                handler,
                entry: EnvelopeEntry::Output(output),
                delta: reply.context_delta,
            },
            Err(failure) => {
                tracing::warn!(
                    handler = %handler,
                    field = %failure.field,
                    error = %failure.message,
                    "Handler output failed validation"
                );
                fallback(FallbackNotice::validation_failed(handler, failure.field))
            }
        }
    }
}

/// Envelope and successor state for one turn
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub envelope: ResponseEnvelope,
    pub state: ConversationState,
}

/// Merge validated results into an envelope and the next conversation state.
///
/// Results are placed in canonical `order`, then safety warnings move to the
/// front. Fallbacks are dropped when at least one real output exists. Deltas of
/// valid outputs are applied in canonical order, last write wins. A route that
/// asked for a photo carries [`PHOTO_REQUEST`] as the envelope's clarification.
pub fn merge(
    mut validated: Vec<ValidatedResult>,
    prior: &ConversationState,
    request: &Request,
    route: &Route,
    order: &[HandlerId],
) -> Assembly {
    let rank = |id: HandlerId| order.iter().position(|h| *h == id).unwrap_or(usize::MAX);
    validated.sort_by_key(|result| rank(result.handler));

    let mut state = prior.clone();
    for result in &validated {
        state.apply_delta(&result.delta);
    }

    let mut entries: Vec<EnvelopeEntry> = validated.into_iter().map(|r| r.entry).collect();
    // Stable, so canonical order holds within each group
    entries.sort_by_key(|entry| !entry.output().is_some_and(|o| o.is_safety_warning()));
    if entries.iter().any(|entry| !entry.is_fallback()) {
        entries.retain(|entry| !entry.is_fallback());
    }

    state.turns.push(Turn {
        request: request.record(),
        entries: entries.clone(),
    });

    Assembly {
        envelope: ResponseEnvelope {
            turn: state.turns.len(),
            route: route.handlers().to_vec(),
            entries,
            clarification: route.photo_requested().then(|| PHOTO_REQUEST.to_string()),
        },
        state,
    }
}
