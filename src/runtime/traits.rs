//! Trait abstractions for runtime I/O
//!
//! These traits enable testing handlers and the executor with mock
//! implementations.

use crate::conversation::ConversationState;
use crate::db::{Database, DbError};
use crate::llm::{LlmError, LlmRequest, LlmResponse, ModelRegistry, SearchResults};
use async_trait::async_trait;
use std::sync::Arc;

/// Client for making LLM requests
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete an LLM request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    #[allow(dead_code)] // API completeness
    fn model_id(&self) -> &str;
}

/// Web search that returns a summary plus the pages it relied on
#[async_trait]
pub trait SearchGrounding: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchResults, LlmError>;
}

/// Storage for per-session conversation state
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Register a new, empty session
    async fn create(&self, session_id: &str) -> Result<(), String>;

    /// Load a session's state, `None` when the session is unknown
    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>, String>;

    /// Store a session's state, creating the session if needed
    async fn save(&self, session_id: &str, state: &ConversationState) -> Result<(), String>;

    /// Remove a session. Returns whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool, String>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        (**self).complete(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

#[async_trait]
impl<T: SearchGrounding + ?Sized> SearchGrounding for Arc<T> {
    async fn search(&self, query: &str) -> Result<SearchResults, LlmError> {
        (**self).search(query).await
    }
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn create(&self, session_id: &str) -> Result<(), String> {
        (**self).create(session_id).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>, String> {
        (**self).load(session_id).await
    }

    async fn save(&self, session_id: &str, state: &ConversationState) -> Result<(), String> {
        (**self).save(session_id, state).await
    }

    async fn delete(&self, session_id: &str) -> Result<bool, String> {
        (**self).delete(session_id).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as `SessionStore`
#[derive(Clone)]
pub struct DatabaseSessionStore {
    db: Database,
}

impl DatabaseSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for DatabaseSessionStore {
    async fn create(&self, session_id: &str) -> Result<(), String> {
        self.db
            .create_session(session_id)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>, String> {
        match self.db.find_session(session_id) {
            Ok(session) => Ok(session.map(|s| s.state)),
            Err(DbError::State(e)) => {
                tracing::error!(session_id, error = %e, "Stored conversation state is corrupt");
                Err(format!("Stored state is unreadable: {e}"))
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn save(&self, session_id: &str, state: &ConversationState) -> Result<(), String> {
        self.db
            .save_session_state(session_id, state)
            .map_err(|e| e.to_string())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, String> {
        self.db.delete_session(session_id).map_err(|e| e.to_string())
    }
}

/// Adapter to use `ModelRegistry` as `LlmClient` and `SearchGrounding`
pub struct RegistryLlmClient {
    registry: Arc<ModelRegistry>,
    model_id: String,
}

impl RegistryLlmClient {
    pub fn new(registry: Arc<ModelRegistry>, model_id: String) -> Self {
        Self { registry, model_id }
    }

    fn service(&self) -> Result<Arc<dyn crate::llm::LlmService>, LlmError> {
        self.registry
            .get(&self.model_id)
            .or_else(|| self.registry.default())
            .ok_or_else(|| LlmError::network("No LLM available"))
    }
}

#[async_trait]
impl LlmClient for RegistryLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.service()?.complete(request).await
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[async_trait]
impl SearchGrounding for RegistryLlmClient {
    async fn search(&self, query: &str) -> Result<SearchResults, LlmError> {
        self.service()?.search(query).await
    }
}
