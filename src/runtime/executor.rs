//! Turn runtime executor

use super::traits::SessionStore;
use super::{ProgressEvent, TurnError};

use crate::conversation::ConversationState;
use crate::handlers::{HandlerFailure, HandlerId, HandlerSet};
use crate::schema::ResponseEnvelope;
use crate::state_machine::{transition, Effect, HandlerResult, TurnContext, TurnEvent, TurnState};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drives one turn through the state machine, performing its effects.
///
/// Dropping the runtime cancels and aborts any handler still running, so an
/// abandoned turn future leaves no work behind.
pub(crate) struct TurnRuntime {
    context: TurnContext,
    state: TurnState,
    handlers: HandlerSet,
    store: Arc<dyn SessionStore>,
    handler_timeout: Duration,
    event_rx: mpsc::Receiver<TurnEvent>,
    event_tx: mpsc::Sender<TurnEvent>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    /// Parent of every handler's cancellation token
    handler_cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TurnRuntime {
    pub fn new(
        context: TurnContext,
        handlers: HandlerSet,
        store: Arc<dyn SessionStore>,
        handler_timeout: Duration,
        progress_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(32);
        Self {
            context,
            state: TurnState::Start,
            handlers,
            store,
            handler_timeout,
            event_rx,
            event_tx,
            progress_tx,
            handler_cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Run the turn to End, returning the envelope and successor state
    pub async fn run(
        mut self,
        cancel: CancellationToken,
    ) -> Result<(ResponseEnvelope, ConversationState), TurnError> {
        if cancel.is_cancelled() {
            return Err(TurnError::Cancelled);
        }

        let mut begin = Some(TurnEvent::Begin);
        loop {
            let event = match begin.take() {
                Some(event) => event,
                None => match &self.state {
                    TurnState::Dispatch { .. } => {
                        tokio::select! {
                            biased;

                            () = cancel.cancelled() => {
                                tracing::info!(
                                    session_id = %self.context.session_id,
                                    "Turn cancelled during dispatch"
                                );
                                TurnEvent::Cancel
                            }

                            Some(event) = self.event_rx.recv() => event,
                        }
                    }
                    TurnState::Collect { .. }
                    | TurnState::Validate { .. }
                    | TurnState::Merge { .. } => TurnEvent::Advance,
                    TurnState::End { .. } => break,
                    TurnState::Cancelled => return Err(TurnError::Cancelled),
                    TurnState::Start => {
                        return Err(TurnError::Internal("turn did not begin".to_string()))
                    }
                },
            };
            self.process_event(event).await?;
        }

        match std::mem::take(&mut self.state) {
            TurnState::End {
                envelope,
                next_state,
            } => Ok((envelope, next_state)),
            other => Err(TurnError::Internal(format!(
                "turn stopped in {}",
                other.phase()
            ))),
        }
    }

    async fn process_event(&mut self, event: TurnEvent) -> Result<(), TurnError> {
        let result = transition(&self.state, &self.context, event)?;
        self.state = result.new_state;

        for effect in result.effects {
            self.execute_effect(effect).await?;
        }
        Ok(())
    }

    async fn execute_effect(&mut self, effect: Effect) -> Result<(), TurnError> {
        match effect {
            Effect::DispatchHandlers { route } => {
                tracing::info!(
                    session_id = %self.context.session_id,
                    route = ?route.handlers(),
                    urgent = route.urgent(),
                    "Dispatching handlers"
                );
                for id in route.handlers() {
                    self.spawn_handler(*id);
                }
                Ok(())
            }

            Effect::AbortHandlers => {
                tracing::info!(
                    session_id = %self.context.session_id,
                    in_flight = self.tasks.iter().filter(|t| !t.is_finished()).count(),
                    "Aborting handlers"
                );
                self.abort_handlers();
                Ok(())
            }

            Effect::PersistSession => {
                let TurnState::End { next_state, .. } = &self.state else {
                    return Err(TurnError::Internal(
                        "persist requested before the turn ended".to_string(),
                    ));
                };
                self.store
                    .save(&self.context.session_id, next_state)
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            session_id = %self.context.session_id,
                            error = %e,
                            "Failed to persist session"
                        );
                        TurnError::Storage(e)
                    })
            }

            Effect::NotifyPhase { phase } => {
                tracing::debug!(session_id = %self.context.session_id, %phase, "Turn phase");
                // No subscribers is fine
                let _ = self.progress_tx.send(ProgressEvent {
                    session_id: self.context.session_id.clone(),
                    phase,
                });
                Ok(())
            }
        }
    }

    /// Spawn one handler as a background task that reports back over the
    /// event channel
    fn spawn_handler(&mut self, id: HandlerId) {
        let handler = self.handlers.get(id);
        let request = self.context.request.clone();
        let snapshot = self.context.snapshot.clone();
        let cancel = self.handler_cancel.child_token();
        let event_tx = self.event_tx.clone();
        let timeout = self.handler_timeout;
        let session_id = self.context.session_id.clone();

        let task = tokio::spawn(async move {
            let start = Instant::now();
            let outcome = match handler {
                Some(handler) => {
                    // A panicking handler must still report back, or Dispatch
                    // would wait for it forever
                    let call = AssertUnwindSafe(handler.handle(&request, &snapshot, cancel))
                        .catch_unwind();
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(_)) => Err(HandlerFailure::upstream("handler panicked")),
                        Err(_) => Err(HandlerFailure::timeout(timeout)),
                    }
                }
                None => Err(HandlerFailure::upstream(format!(
                    "no handler registered for {id}"
                ))),
            };

            let duration_ms = start.elapsed().as_millis();
            match &outcome {
                Ok(reply) => {
                    tracing::info!(
                        %session_id,
                        handler = %id,
                        duration_ms = %duration_ms,
                        kind = %reply.kind,
                        "Handler finished"
                    );
                }
                Err(failure) => {
                    tracing::warn!(
                        %session_id,
                        handler = %id,
                        duration_ms = %duration_ms,
                        error = %failure,
                        "Handler failed"
                    );
                }
            }

            // The receiver is gone once the turn was cancelled or dropped
            let _ = event_tx
                .send(TurnEvent::HandlerFinished(HandlerResult::new(id, outcome)))
                .await;
        });
        self.tasks.push(task);
    }

    fn abort_handlers(&mut self) {
        self.handler_cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TurnRuntime {
    fn drop(&mut self) {
        self.abort_handlers();
    }
}
