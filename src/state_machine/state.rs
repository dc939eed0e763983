//! Turn state types

use crate::assembler::ValidatedResult;
use crate::classifier::{Classifier, Route};
use crate::conversation::{ConversationState, Request};
use crate::handlers::{HandlerFailure, HandlerId, HandlerReply};
use crate::schema::ResponseEnvelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Immutable inputs of one turn, shared by every transition
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub request: Arc<Request>,
    /// Conversation as it stood before the turn; read-only during Dispatch
    pub snapshot: Arc<ConversationState>,
    pub classifier: Arc<Classifier>,
}

impl TurnContext {
    pub fn new(
        session_id: impl Into<String>,
        request: Arc<Request>,
        snapshot: Arc<ConversationState>,
        classifier: Arc<Classifier>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request,
            snapshot,
            classifier,
        }
    }
}

/// Terminal outcome of one handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResult {
    pub handler: HandlerId,
    pub outcome: Result<HandlerReply, HandlerFailure>,
}

impl HandlerResult {
    pub fn new(handler: HandlerId, outcome: Result<HandlerReply, HandlerFailure>) -> Self {
        Self { handler, outcome }
    }
}

/// Orchestration state for one turn.
///
/// Linear: Start, Dispatch, Collect, Validate, Merge, End. Cancelled is only
/// reachable from Dispatch. End and Cancelled are terminal.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TurnState {
    #[default]
    Start,

    /// Handlers running; leaves only when `pending` is empty
    Dispatch {
        route: Route,
        pending: Vec<HandlerId>,
        /// In completion order
        completed: Vec<HandlerResult>,
    },

    /// Every handler reached a terminal outcome
    Collect {
        route: Route,
        results: Vec<HandlerResult>,
    },

    /// Results in canonical order, awaiting validation
    Validate {
        route: Route,
        results: Vec<HandlerResult>,
    },

    Merge {
        route: Route,
        validated: Vec<ValidatedResult>,
    },

    End {
        envelope: ResponseEnvelope,
        next_state: ConversationState,
    },

    Cancelled,
}

impl TurnState {
    pub fn phase(&self) -> TurnPhase {
        match self {
            TurnState::Start => TurnPhase::Start,
            TurnState::Dispatch { .. } => TurnPhase::Dispatch,
            TurnState::Collect { .. } => TurnPhase::Collect,
            TurnState::Validate { .. } => TurnPhase::Validate,
            TurnState::Merge { .. } => TurnPhase::Merge,
            TurnState::End { .. } => TurnPhase::End,
            TurnState::Cancelled => TurnPhase::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::End { .. } | TurnState::Cancelled)
    }
}

/// Data-free view of [`TurnState`] for logs and client notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Start,
    Dispatch,
    Collect,
    Validate,
    Merge,
    End,
    Cancelled,
}

impl TurnPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnPhase::Start => "start",
            TurnPhase::Dispatch => "dispatch",
            TurnPhase::Collect => "collect",
            TurnPhase::Validate => "validate",
            TurnPhase::Merge => "merge",
            TurnPhase::End => "end",
            TurnPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
