//! Handler set
//!
//! Each handler turns a request plus a read-only conversation snapshot into a
//! raw structured output and a context-delta. Handlers never see each other's
//! results and never mutate the conversation.

mod diagnosis;
mod faq;
mod legal;
mod prompt;
mod safety;

pub use diagnosis::ImageDiagnosisHandler;
pub use faq::TenancyFaqHandler;
pub use legal::LegalGuidanceHandler;
pub use safety::SafetyEscalationHandler;

use crate::classifier::Classifier;
use crate::conversation::{ContextDelta, ConversationState, Request};
use crate::llm::LlmError;
use crate::runtime::{LlmClient, SearchGrounding};
use crate::schema::OutputKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identity of a specialized handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerId {
    SafetyEscalation,
    ImageDiagnosis,
    LegalGuidance,
    TenancyFaq,
}

impl HandlerId {
    pub const ALL: [HandlerId; 4] = [
        HandlerId::SafetyEscalation,
        HandlerId::ImageDiagnosis,
        HandlerId::LegalGuidance,
        HandlerId::TenancyFaq,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HandlerId::SafetyEscalation => "safety_escalation",
            HandlerId::ImageDiagnosis => "image_diagnosis",
            HandlerId::LegalGuidance => "legal_guidance",
            HandlerId::TenancyFaq => "tenancy_faq",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            HandlerId::SafetyEscalation => "Safety escalation",
            HandlerId::ImageDiagnosis => "Image diagnosis",
            HandlerId::LegalGuidance => "Legal guidance",
            HandlerId::TenancyFaq => "Tenancy FAQ",
        }
    }

    /// The output variant this handler is declared to produce
    pub fn output_kind(self) -> OutputKind {
        match self {
            HandlerId::SafetyEscalation => OutputKind::SafetyWarning,
            HandlerId::ImageDiagnosis => OutputKind::IssueReport,
            HandlerId::LegalGuidance => OutputKind::LegalGuidance,
            HandlerId::TenancyFaq => OutputKind::FaqAnswer,
        }
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Why a handler produced no output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    UpstreamError,
    MalformedCompletion,
    MissingImage,
    MissingText,
}

impl FailureReason {
    pub fn describe(self) -> &'static str {
        match self {
            FailureReason::Timeout => "timed out",
            FailureReason::UpstreamError => "upstream service error",
            FailureReason::MalformedCompletion => "unreadable response",
            FailureReason::MissingImage => "no image attached",
            FailureReason::MissingText => "no question text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", reason.describe())]
pub struct HandlerFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            FailureReason::Timeout,
            format!("no result after {}s", after.as_secs_f64()),
        )
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FailureReason::UpstreamError, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureReason::MalformedCompletion, message)
    }

    pub fn missing_image() -> Self {
        Self::new(FailureReason::MissingImage, "request has no image")
    }

    pub fn missing_text() -> Self {
        Self::new(FailureReason::MissingText, "request has no text")
    }
}

impl From<LlmError> for HandlerFailure {
    fn from(e: LlmError) -> Self {
        Self::upstream(e.message)
    }
}

// ============================================================================
// Handler trait
// ============================================================================

/// Raw handler output, not yet validated
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerReply {
    pub kind: OutputKind,
    pub payload: Value,
    pub context_delta: ContextDelta,
}

impl HandlerReply {
    pub fn new(kind: OutputKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            context_delta: ContextDelta::new(),
        }
    }

    pub fn with_delta(mut self, delta: ContextDelta) -> Self {
        self.context_delta.extend(delta);
        self
    }
}

/// A specialized processor for one facet of a request
#[async_trait]
pub trait Handler: Send + Sync {
    fn id(&self) -> HandlerId;

    async fn handle(
        &self,
        request: &Request,
        state: &ConversationState,
        cancel: CancellationToken,
    ) -> Result<HandlerReply, HandlerFailure>;
}

#[async_trait]
impl<T: Handler + ?Sized> Handler for Arc<T> {
    fn id(&self) -> HandlerId {
        (**self).id()
    }

    async fn handle(
        &self,
        request: &Request,
        state: &ConversationState,
        cancel: CancellationToken,
    ) -> Result<HandlerReply, HandlerFailure> {
        (**self).handle(request, state, cancel).await
    }
}

/// Handlers addressable by id
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<HandlerId, Arc<dyn Handler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production set: all four handlers sharing one completion client
    pub fn standard(
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn SearchGrounding>,
        classifier: Arc<Classifier>,
    ) -> Self {
        Self::new()
            .with(SafetyEscalationHandler::new(classifier))
            .with(ImageDiagnosisHandler::new(llm.clone()))
            .with(LegalGuidanceHandler::new(llm.clone(), search.clone()))
            .with(TenancyFaqHandler::new(llm, search))
    }

    /// Register a handler under its own id, replacing any previous one
    #[must_use]
    pub fn with(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(handler.id(), Arc::new(handler));
        self
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&id).cloned()
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().collect();
        ids.sort();
        f.debug_struct("HandlerSet").field("handlers", &ids).finish()
    }
}
