//! Effects produced by turn transitions

use super::state::TurnPhase;
use crate::classifier::Route;

/// Effects to be executed after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Spawn every handler of the route against the shared snapshot
    DispatchHandlers { route: Route },

    /// Cancel and abort in-flight handlers
    AbortHandlers,

    /// Store the successor conversation state
    PersistSession,

    /// Tell subscribers the turn entered a new phase
    NotifyPhase { phase: TurnPhase },
}

impl Effect {
    pub fn notify(phase: TurnPhase) -> Self {
        Effect::NotifyPhase { phase }
    }
}
