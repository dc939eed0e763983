//! Pure turn transition function

use super::state::{HandlerResult, TurnContext, TurnPhase, TurnState};
use super::{Effect, TurnEvent};
use crate::assembler::{merge, ValidatedResult};
use crate::classifier::ClassifyError;
use crate::handlers::HandlerId;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: TurnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: TurnState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ClassifyError),
    #[error("Handler {0} is not pending in this turn")]
    UnexpectedHandler(HandlerId),
    #[error("Turn already finished ({0})")]
    Terminal(TurnPhase),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
///
/// Given the same state, context and event it always produces the same
/// result. All I/O is expressed as returned effects.
pub fn transition(
    state: &TurnState,
    context: &TurnContext,
    event: TurnEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // Start + Begin -> Dispatch
        (TurnState::Start, TurnEvent::Begin) => {
            let route = context
                .classifier
                .classify(&context.request, &context.snapshot)?;
            Ok(TransitionResult::new(TurnState::Dispatch {
                route: route.clone(),
                pending: route.handlers().to_vec(),
                completed: vec![],
            })
            .with_effect(Effect::DispatchHandlers { route })
            .with_effect(Effect::notify(TurnPhase::Dispatch)))
        }

        // Dispatch + HandlerFinished -> Dispatch, or Collect once nothing is pending
        (
            TurnState::Dispatch {
                route,
                pending,
                completed,
            },
            TurnEvent::HandlerFinished(result),
        ) => {
            if !pending.contains(&result.handler) {
                return Err(TransitionError::UnexpectedHandler(result.handler));
            }
            let pending: Vec<HandlerId> = pending
                .iter()
                .copied()
                .filter(|id| *id != result.handler)
                .collect();
            let mut completed = completed.clone();
            completed.push(result);

            if pending.is_empty() {
                Ok(TransitionResult::new(TurnState::Collect {
                    route: route.clone(),
                    results: completed,
                })
                .with_effect(Effect::notify(TurnPhase::Collect)))
            } else {
                Ok(TransitionResult::new(TurnState::Dispatch {
                    route: route.clone(),
                    pending,
                    completed,
                }))
            }
        }

        // Dispatch + Cancel -> Cancelled, completed results are dropped
        (TurnState::Dispatch { .. }, TurnEvent::Cancel) => {
            Ok(TransitionResult::new(TurnState::Cancelled)
                .with_effect(Effect::AbortHandlers)
                .with_effect(Effect::notify(TurnPhase::Cancelled)))
        }

        // Collect + Advance -> Validate, results in canonical order
        (TurnState::Collect { route, results }, TurnEvent::Advance) => {
            let mut results: Vec<HandlerResult> = results.clone();
            results.sort_by_key(|r| context.classifier.rank(r.handler));
            Ok(TransitionResult::new(TurnState::Validate {
                route: route.clone(),
                results,
            })
            .with_effect(Effect::notify(TurnPhase::Validate)))
        }

        // Validate + Advance -> Merge
        (TurnState::Validate { route, results }, TurnEvent::Advance) => {
            let validated = results
                .iter()
                .map(|r| ValidatedResult::from_result(r.handler, r.outcome.clone()))
                .collect();
            Ok(TransitionResult::new(TurnState::Merge {
                route: route.clone(),
                validated,
            })
            .with_effect(Effect::notify(TurnPhase::Merge)))
        }

        // Merge + Advance -> End
        (TurnState::Merge { route, validated }, TurnEvent::Advance) => {
            let assembly = merge(
                validated.clone(),
                &context.snapshot,
                &context.request,
                route,
                context.classifier.order(),
            );
            Ok(TransitionResult::new(TurnState::End {
                envelope: assembly.envelope,
                next_state: assembly.state,
            })
            .with_effect(Effect::PersistSession)
            .with_effect(Effect::notify(TurnPhase::End)))
        }

        (state, _) if state.is_terminal() => Err(TransitionError::Terminal(state.phase())),

        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{} cannot handle {event}",
            state.phase()
        ))),
    }
}
