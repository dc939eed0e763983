//! Runtime for executing turns
//!
//! The `Assistant` owns the handler set, the classifier and the session
//! store. Each turn loads the session, runs the turn machine and persists the
//! successor state. Turns of one session are serialized; turns of different
//! sessions run independently.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use traits::*;

use crate::classifier::{Classifier, ClassifyError};
use crate::conversation::{ConversationState, Request};
use crate::handlers::HandlerSet;
use crate::schema::ResponseEnvelope;
use crate::state_machine::{TransitionError, TurnContext, TurnPhase};
use executor::TurnRuntime;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a turn produced no envelope
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] ClassifyError),
    #[error("Turn cancelled")]
    Cancelled,
    #[error("Session storage failed: {0}")]
    Storage(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TransitionError> for TurnError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::InvalidRequest(e) => TurnError::InvalidRequest(e),
            other => TurnError::Internal(other.to_string()),
        }
    }
}

/// Turn progress sent to stream subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub session_id: String,
    pub phase: TurnPhase,
}

/// Entry point for processing turns
pub struct Assistant {
    classifier: Arc<Classifier>,
    handlers: HandlerSet,
    store: Arc<dyn SessionStore>,
    handler_timeout: Duration,
    /// One lock per session so concurrent turns cannot lose updates
    session_locks: SessionLocks,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl Assistant {
    pub fn new(
        classifier: Arc<Classifier>,
        handlers: HandlerSet,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(128);
        Self {
            classifier,
            handlers,
            store,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            session_locks: SessionLocks::default(),
            progress_tx,
        }
    }

    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    /// Process one request against a session's conversation.
    ///
    /// The session is created on its first turn. On any error the stored
    /// state is left as it was before the turn.
    pub async fn process_turn(
        &self,
        session_id: &str,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<ResponseEnvelope, TurnError> {
        let _guard = self.session_locks.acquire(session_id).await;

        let start = Instant::now();
        let snapshot = self
            .store
            .load(session_id)
            .await
            .map_err(|e| {
                tracing::error!(session_id, error = %e, "Failed to load session");
                TurnError::Storage(e)
            })?
            .unwrap_or_default();

        let context = TurnContext::new(
            session_id,
            Arc::new(request),
            Arc::new(snapshot),
            self.classifier.clone(),
        );
        let runtime = TurnRuntime::new(
            context,
            self.handlers.clone(),
            self.store.clone(),
            self.handler_timeout,
            self.progress_tx.clone(),
        );

        match runtime.run(cancel).await {
            Ok((envelope, _)) => {
                tracing::info!(
                    session_id,
                    turn = envelope.turn,
                    entries = envelope.entries.len(),
                    fallbacks = envelope.fallbacks().count(),
                    duration_ms = %start.elapsed().as_millis(),
                    "Turn completed"
                );
                Ok(envelope)
            }
            Err(e) => {
                tracing::info!(session_id, error = %e, "Turn ended without a response");
                Err(e)
            }
        }
    }

    /// Create a new, empty session and return its id
    pub async fn create_session(&self) -> Result<String, TurnError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.store
            .create(&session_id)
            .await
            .map_err(TurnError::Storage)?;
        tracing::info!(%session_id, "Session created");
        Ok(session_id)
    }

    /// Current conversation state of a session
    pub async fn session(&self, session_id: &str) -> Result<Option<ConversationState>, TurnError> {
        self.store.load(session_id).await.map_err(TurnError::Storage)
    }

    /// Clear a session's history and context. Returns whether it existed.
    pub async fn reset_session(&self, session_id: &str) -> Result<bool, TurnError> {
        let _guard = self.session_locks.acquire(session_id).await;

        if self.session(session_id).await?.is_none() {
            return Ok(false);
        }
        self.store
            .save(session_id, &ConversationState::default())
            .await
            .map_err(TurnError::Storage)?;
        tracing::info!(session_id, "Session reset");
        Ok(true)
    }

    /// Remove a session. Returns whether it existed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, TurnError> {
        let _guard = self.session_locks.acquire(session_id).await;

        let deleted = self
            .store
            .delete(session_id)
            .await
            .map_err(TurnError::Storage)?;
        if deleted {
            tracing::info!(session_id, "Session deleted");
        }
        Ok(deleted)
    }

    /// Subscribe to phase changes of every turn
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Sessions with a turn, reset or delete in progress or waiting
    #[cfg(test)]
    pub(crate) fn busy_sessions(&self) -> usize {
        self.session_locks.len()
    }
}

/// Per-session locks. An entry exists only while someone holds or waits for
/// it, so the map does not grow with every session id ever seen.
#[derive(Default)]
struct SessionLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> SessionGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let guard = lock.clone().lock_owned().await;
        SessionGuard {
            locks: self,
            session_id: session_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    session_id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Held only by the map and this guard: nobody is waiting
        let idle = Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.session_id)
                .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock));
        if idle {
            locks.remove(&self.session_id);
        }
    }
}
