//! Events that drive a turn

use super::state::HandlerResult;
use std::fmt;

/// Events that trigger turn transitions
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Classify the request and dispatch handlers
    Begin,
    /// A dispatched handler succeeded or failed
    HandlerFinished(HandlerResult),
    /// Move on from a phase that needs no external input
    Advance,
    /// The caller abandoned the turn
    Cancel,
}

impl fmt::Display for TurnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnEvent::Begin => f.write_str("begin"),
            TurnEvent::HandlerFinished(result) => write!(f, "handler_finished({})", result.handler),
            TurnEvent::Advance => f.write_str("advance"),
            TurnEvent::Cancel => f.write_str("cancel"),
        }
    }
}
