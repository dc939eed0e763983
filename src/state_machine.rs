//! Turn orchestration state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions. The
//! runtime executor performs the effects and feeds events back in.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::TurnEvent;
pub use state::{HandlerResult, TurnContext, TurnPhase, TurnState};
pub use transition::{transition, TransitionError};
