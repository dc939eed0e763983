//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use crate::conversation::{ContextDelta, ConversationState, Request};
use crate::handlers::{Handler, HandlerFailure, HandlerId, HandlerReply};
use crate::llm::{LlmError, LlmRequest, LlmResponse, SearchResults};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
#[allow(dead_code)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

#[allow(dead_code)]
impl MockLlmClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a completion whose text is the given JSON
    pub fn queue_json(&self, value: Value) {
        self.queue_response(LlmResponse::from_text(value.to_string()));
    }

    /// Queue a plain-text completion
    pub fn queue_text(&self, text: &str) {
        self.queue_response(LlmResponse::from_text(text));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Static Search Grounding
// ============================================================================

/// Search grounding that always returns the same results (or always fails)
pub struct StaticGrounding {
    results: Option<SearchResults>,
    queries: Mutex<Vec<String>>,
}

impl StaticGrounding {
    pub fn new(results: SearchResults) -> Self {
        Self {
            results: Some(results),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(SearchResults::default())
    }

    pub fn failing() -> Self {
        Self {
            results: None,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchGrounding for StaticGrounding {
    async fn search(&self, query: &str) -> Result<SearchResults, LlmError> {
        self.queries.lock().unwrap().push(query.to_string());
        self.results
            .clone()
            .ok_or_else(|| LlmError::server_error("Server error: search unavailable"))
    }
}

// ============================================================================
// Stub Handler
// ============================================================================

/// A payload that passes validation for the handler's declared output
pub fn valid_payload(id: HandlerId) -> Value {
    match id {
        HandlerId::SafetyEscalation => json!({
            "hazard_category": "gas",
            "immediate_action": "Leave the property and do not use switches.",
            "contact_services": "Call 0800 111 999."
        }),
        HandlerId::ImageDiagnosis => json!({
            "assessment": "Black mould around the window frame.",
            "troubleshooting": ["Ventilate the room daily"],
            "referral": true,
            "severity": "moderate"
        }),
        HandlerId::LegalGuidance => json!({
            "citations": ["Housing Act 1988, s.13"],
            "jurisdiction": "England",
            "disclaimer": "General information, not legal advice."
        }),
        HandlerId::TenancyFaq => json!({ "answer": "Your landlord must give notice first." }),
    }
}

enum StubBehaviour {
    Reply(Value),
    Fail(HandlerFailure),
    /// Wait until cancelled
    Hang,
    Panic,
}

/// Deterministic handler with configurable latency and outcome
pub struct StubHandler {
    id: HandlerId,
    behaviour: StubBehaviour,
    delay: Duration,
    delta: ContextDelta,
    calls: AtomicUsize,
    observed_cancel: AtomicBool,
    last_token: Mutex<Option<CancellationToken>>,
    /// Notified when `handle` starts
    pub started: Arc<Notify>,
}

impl StubHandler {
    fn with_behaviour(id: HandlerId, behaviour: StubBehaviour) -> Self {
        Self {
            id,
            behaviour,
            delay: Duration::ZERO,
            delta: ContextDelta::new(),
            calls: AtomicUsize::new(0),
            observed_cancel: AtomicBool::new(false),
            last_token: Mutex::new(None),
            started: Arc::new(Notify::new()),
        }
    }

    /// Replies with [`valid_payload`]
    pub fn replying(id: HandlerId) -> Self {
        Self::with_payload(id, valid_payload(id))
    }

    pub fn with_payload(id: HandlerId, payload: Value) -> Self {
        Self::with_behaviour(id, StubBehaviour::Reply(payload))
    }

    pub fn failing(id: HandlerId, failure: HandlerFailure) -> Self {
        Self::with_behaviour(id, StubBehaviour::Fail(failure))
    }

    pub fn hanging(id: HandlerId) -> Self {
        Self::with_behaviour(id, StubBehaviour::Hang)
    }

    pub fn panicking(id: HandlerId) -> Self {
        Self::with_behaviour(id, StubBehaviour::Panic)
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_delta(mut self, key: &str, value: Value) -> Self {
        self.delta.insert(key.to_string(), value);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the handler itself saw its token fire
    pub fn observed_cancel(&self) -> bool {
        self.observed_cancel.load(Ordering::SeqCst)
    }

    /// Token passed to the most recent invocation
    pub fn last_token(&self) -> Option<CancellationToken> {
        self.last_token.lock().unwrap().clone()
    }

    async fn cancelled(&self, cancel: &CancellationToken) -> HandlerFailure {
        cancel.cancelled().await;
        self.observed_cancel.store(true, Ordering::SeqCst);
        HandlerFailure::upstream("request cancelled")
    }
}

#[async_trait]
impl Handler for StubHandler {
    fn id(&self) -> HandlerId {
        self.id
    }

    async fn handle(
        &self,
        _request: &Request,
        _state: &ConversationState,
        cancel: CancellationToken,
    ) -> Result<HandlerReply, HandlerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_token.lock().unwrap() = Some(cancel.clone());
        self.started.notify_one();

        if !self.delay.is_zero() {
            tokio::select! {
                failure = self.cancelled(&cancel) => return Err(failure),
                () = tokio::time::sleep(self.delay) => {}
            }
        }

        match &self.behaviour {
            StubBehaviour::Reply(payload) => {
                Ok(HandlerReply::new(self.id.output_kind(), payload.clone())
                    .with_delta(self.delta.clone()))
            }
            StubBehaviour::Fail(failure) => Err(failure.clone()),
            StubBehaviour::Hang => Err(self.cancelled(&cancel).await),
            StubBehaviour::Panic => panic!("{} stub panicked", self.id),
        }
    }
}

// ============================================================================
// In-Memory Session Store
// ============================================================================

/// In-memory session store for testing
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, ConversationState>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<ConversationState> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn insert(&self, session_id: &str, state: ConversationState) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), state);
    }

    /// Make every subsequent save fail
    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session_id: &str) -> Result<(), String> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(session_id) {
            return Err(format!("Session already exists: {session_id}"));
        }
        sessions.insert(session_id.to_string(), ConversationState::default());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<ConversationState>, String> {
        Ok(self.get(session_id))
    }

    async fn save(&self, session_id: &str, state: &ConversationState) -> Result<(), String> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err("disk full".to_string());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(session_id, state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, String> {
        Ok(self.sessions.lock().unwrap().remove(session_id).is_some())
    }
}

// ============================================================================
// Integration Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, RoutingPolicy};
    use crate::conversation::{ImageAttachment, PropertyContext};
    use crate::handlers::{FailureReason, HandlerSet};
    use crate::llm::{ContentBlock, LlmConfig, ModelRegistry};
    use crate::runtime::{Assistant, ProgressEvent, TurnError};
    use crate::schema::{EnvelopeEntry, FallbackReason, HandlerOutput, OutputKind};
    use crate::state_machine::TurnPhase;

    fn classifier() -> Arc<Classifier> {
        Arc::new(Classifier::new(RoutingPolicy::default()).unwrap())
    }

    fn assistant(handlers: HandlerSet) -> (Assistant, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        (Assistant::new(classifier(), handlers, store.clone()), store)
    }

    /// Production handlers backed by a mock completion client
    fn standard_assistant(llm: Arc<MockLlmClient>) -> (Assistant, Arc<InMemorySessionStore>) {
        let classifier = classifier();
        let handlers =
            HandlerSet::standard(llm, Arc::new(StaticGrounding::empty()), classifier.clone());
        let store = Arc::new(InMemorySessionStore::new());
        (Assistant::new(classifier, handlers, store.clone()), store)
    }

    fn stubs(handlers: Vec<StubHandler>) -> HandlerSet {
        handlers
            .into_iter()
            .fold(HandlerSet::new(), |set, handler| set.with(handler))
    }

    fn kinds(entries: &[EnvelopeEntry]) -> Vec<Option<OutputKind>> {
        entries
            .iter()
            .map(|entry| entry.output().map(HandlerOutput::kind))
            .collect()
    }

    fn located(text: &str, location: &str) -> Request {
        Request::text_only(text).with_context(PropertyContext {
            location: Some(location.into()),
            ..PropertyContext::default()
        })
    }

    fn photo() -> ImageAttachment {
        ImageAttachment::new(vec![0xFF, 0xD8, 0xFF], "image/jpeg")
    }

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_mock_llm_client() {
        let client = MockLlmClient::new("test-model");
        client.queue_json(json!({ "answer": "yes" }));
        client.queue_error(LlmError::rate_limit("Rate limited"));

        let request = LlmRequest::new("system").with_text("Hello");
        let response = client.complete(&request).await.unwrap();
        assert_eq!(response.text(), r#"{"answer":"yes"}"#);

        let err = client.complete(&request).await.unwrap_err();
        assert_eq!(err.message, "Rate limited");

        let err = client.complete(&request).await.unwrap_err();
        assert_eq!(err.message, "No mock response queued");
        assert_eq!(client.recorded_requests().len(), 3);
        assert_eq!(client.model_id(), "test-model");
    }

    #[tokio::test]
    async fn test_static_grounding() {
        let search = StaticGrounding::failing();
        assert!(search.search("deposit").await.is_err());
        assert_eq!(search.queries(), vec!["deposit"]);

        let search = StaticGrounding::empty();
        assert_eq!(search.search("rent").await.unwrap(), SearchResults::default());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemorySessionStore::new();
        store.create("s").await.unwrap();
        assert!(store.create("s").await.is_err());
        assert_eq!(store.load("s").await.unwrap(), Some(ConversationState::default()));

        store.fail_saves();
        assert!(store.save("s", &ConversationState::default()).await.is_err());
        assert_eq!(store.save_count(), 0);
        assert!(store.delete("s").await.unwrap());
        assert_eq!(store.load("s").await.unwrap(), None);
    }

    // ------------------------------------------------------------------------
    // Routing scenarios with the production handlers
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_image_only_turn() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_json(json!({
            "assessment": "Black mould around the window frame.",
            "troubleshooting": ["Ventilate daily", "Wipe with a mould cleaner"],
            "referral": false,
            "severity": "moderate",
            "issue_category": "damp"
        }));
        let (assistant, store) = standard_assistant(llm.clone());

        let envelope = assistant
            .process_turn(
                "s-img",
                Request::default().with_image(photo()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(envelope.route, vec![HandlerId::ImageDiagnosis]);
        assert_eq!(kinds(&envelope.entries), vec![Some(OutputKind::IssueReport)]);
        assert!(llm.recorded_requests()[0].has_image());

        let state = store.get("s-img").unwrap();
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.reported_issues(), vec!["damp"]);
        assert_eq!(state.get_str("last_severity"), Some("moderate"));
    }

    #[tokio::test]
    async fn test_london_rent_increase() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        // Legal guidance and the FAQ answer run concurrently; one completion
        // satisfying both shapes keeps the test independent of call order.
        let completion = json!({
            "answer": "Your landlord must give at least one month's notice using a section 13 notice.",
            "citations": ["Housing Act 1988, s.13"],
            "jurisdiction": "England",
            "disclaimer": "This is general information, not legal advice."
        });
        llm.queue_json(completion.clone());
        llm.queue_json(completion);
        let (assistant, store) = standard_assistant(llm.clone());

        let envelope = assistant
            .process_turn(
                "s-rent",
                located(
                    "My landlord wants to increase my rent, how much notice in London?",
                    "London",
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            envelope.route,
            vec![HandlerId::LegalGuidance, HandlerId::TenancyFaq]
        );
        assert_eq!(
            kinds(&envelope.entries),
            vec![Some(OutputKind::LegalGuidance), Some(OutputKind::FaqAnswer)]
        );
        assert_eq!(envelope.fallbacks().count(), 0);
        let Some(HandlerOutput::FaqAnswer(faq)) = envelope.entries[1].output() else {
            panic!("expected an FAQ answer second, got {:?}", envelope.entries);
        };
        assert!(faq
            .regional_note
            .as_deref()
            .is_some_and(|note| note.contains("London")));
        assert_eq!(llm.recorded_requests().len(), 2);
        assert_eq!(store.get("s-rent").unwrap().location(), Some("London"));
    }

    #[tokio::test]
    async fn test_gas_leak_is_escalated_first() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_json(json!({ "answer": "Your landlord must arrange a Gas Safe engineer." }));
        let (assistant, store) = standard_assistant(llm);

        let envelope = assistant
            .process_turn(
                "s-gas",
                Request::text_only("I smell gas near my boiler"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            envelope.route,
            vec![HandlerId::SafetyEscalation, HandlerId::TenancyFaq]
        );
        let Some(HandlerOutput::SafetyWarning(warning)) = envelope.entries[0].output() else {
            panic!("expected a safety warning first, got {:?}", envelope.entries);
        };
        assert_eq!(warning.hazard_category, "gas");

        let state = store.get("s-gas").unwrap();
        assert!(state.is_urgent());
        assert_eq!(state.get_str("hazard_category"), Some("gas"));
    }

    #[tokio::test]
    async fn test_visible_issue_without_photo_asks_for_one() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_json(json!({ "answer": "Report damp to your landlord in writing." }));
        let (assistant, _) = standard_assistant(llm);

        let envelope = assistant
            .process_turn(
                "s-mould",
                Request::text_only("There is black mould spreading on my bedroom wall"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(envelope.route, vec![HandlerId::TenancyFaq]);
        assert_eq!(kinds(&envelope.entries), vec![Some(OutputKind::FaqAnswer)]);
        assert_eq!(
            envelope.clarification.as_deref(),
            Some(crate::assembler::PHOTO_REQUEST)
        );
    }

    #[tokio::test]
    async fn test_empty_request_leaves_state_untouched() {
        let (assistant, store) = standard_assistant(Arc::new(MockLlmClient::new("mock")));
        store.insert("s-empty", ConversationState::default());

        let err = assistant
            .process_turn("s-empty", Request::text_only("   "), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::InvalidRequest(_)));
        assert_eq!(store.get("s-empty"), Some(ConversationState::default()));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_context_accumulates_across_turns() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        for answer in ["Usually the landlord.", "Check your agreement.", "Yes."] {
            llm.queue_json(json!({ "answer": answer }));
        }
        let search = Arc::new(StaticGrounding::empty());
        let classifier = classifier();
        let handlers = HandlerSet::standard(llm, search.clone(), classifier.clone());
        let store = Arc::new(InMemorySessionStore::new());
        let assistant = Assistant::new(classifier, handlers, store.clone());

        assistant
            .process_turn("s", located("Who fixes the boiler?", "London"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.get("s").unwrap().location(), Some("London"));

        let second = assistant
            .process_turn("s", Request::text_only("Who pays the bills?"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.turn, 2);
        assert_eq!(store.get("s").unwrap().location(), Some("London"));

        assistant
            .process_turn("s", located("Can I have a pet?", "Leeds"), CancellationToken::new())
            .await
            .unwrap();

        let state = store.get("s").unwrap();
        assert_eq!(state.location(), Some("Leeds"));
        assert_eq!(state.turns.len(), 3);
        assert_eq!(
            search.queries(),
            vec![
                "Who fixes the boiler? (Location: London)",
                "Who pays the bills? (Location: London)",
                "Can I have a pet? (Location: Leeds)",
            ]
        );
    }

    #[tokio::test]
    async fn test_declared_property_details_are_remembered() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_json(json!({ "answer": "Flats usually share a communal boiler." }));
        llm.queue_json(json!({
            "assessment": "Damp patch under the window.",
            "severity": "low",
            "issue_category": "damp"
        }));
        let (assistant, store) = standard_assistant(llm.clone());

        let request = Request::text_only("Who fixes the boiler?").with_context(PropertyContext {
            property_type: Some("Flat".into()),
            property_age: Some(30),
            occupancy: Some("Tenant".into()),
            ..PropertyContext::default()
        });
        assistant
            .process_turn("s-flat", request, CancellationToken::new())
            .await
            .unwrap();

        let state = store.get("s-flat").unwrap();
        assert_eq!(state.get_str("property_type"), Some("Flat"));
        assert_eq!(state.get_str("occupancy"), Some("Tenant"));
        assert_eq!(state.context["property_age"], json!(30));

        let photo_turn = Request::default()
            .with_image(photo())
            .with_context(PropertyContext {
                location: Some("Bristol".into()),
                ..PropertyContext::default()
            });
        assistant
            .process_turn("s-flat", photo_turn, CancellationToken::new())
            .await
            .unwrap();

        let state = store.get("s-flat").unwrap();
        assert_eq!(state.location(), Some("Bristol"));
        assert_eq!(state.get_str("property_type"), Some("Flat"));
        assert_eq!(state.turns.len(), 2);
    }

    #[tokio::test]
    async fn test_history_reaches_later_prompts() {
        let llm = Arc::new(MockLlmClient::new("mock"));
        llm.queue_json(json!({ "answer": "Usually the landlord." }));
        llm.queue_json(json!({ "answer": "Within a reasonable time." }));
        let (assistant, _) = standard_assistant(llm.clone());

        for text in ["Who fixes the boiler?", "How quickly must they do it?"] {
            assistant
                .process_turn("s", Request::text_only(text), CancellationToken::new())
                .await
                .unwrap();
        }

        let requests = llm.recorded_requests();
        let ContentBlock::Text { text } = &requests[1].content[0] else {
            panic!("expected text prompt");
        };
        assert!(text.contains("Conversation so far:"));
        assert!(text.contains("User: Who fixes the boiler?"));
    }

    #[tokio::test]
    async fn test_missing_models_degrade_to_fallbacks() {
        let classifier = classifier();
        let registry = Arc::new(ModelRegistry::new(&LlmConfig::default()));
        let client = Arc::new(RegistryLlmClient::new(registry, "gemini-2.0-flash".into()));
        let handlers = HandlerSet::standard(client.clone(), client, classifier.clone());
        let assistant = Assistant::new(classifier, handlers, Arc::new(InMemorySessionStore::new()));

        let envelope = assistant
            .process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let fallbacks: Vec<_> = envelope.fallbacks().collect();
        assert_eq!(fallbacks.len(), 1);
        assert_eq!(
            fallbacks[0].reason,
            FallbackReason::HandlerFailed {
                reason: FailureReason::UpstreamError
            }
        );
    }

    // ------------------------------------------------------------------------
    // Orchestration properties with stub handlers
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_safety_first_even_when_slowest() {
        let (assistant, _) = assistant(stubs(vec![
            StubHandler::replying(HandlerId::SafetyEscalation)
                .with_delay(Duration::from_millis(500)),
            StubHandler::replying(HandlerId::TenancyFaq),
        ]));

        let envelope = assistant
            .process_turn(
                "s",
                Request::text_only("There is a gas leak, who do I call?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            kinds(&envelope.entries),
            vec![Some(OutputKind::SafetyWarning), Some(OutputKind::FaqAnswer)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order_does_not_change_envelope() {
        let request = || Request::text_only("Can I be evicted without notice?");
        let run = |legal_ms: u64, faq_ms: u64| async move {
            let (assistant, store) = assistant(stubs(vec![
                StubHandler::replying(HandlerId::LegalGuidance)
                    .with_delay(Duration::from_millis(legal_ms))
                    .with_delta("jurisdiction", json!("England")),
                StubHandler::replying(HandlerId::TenancyFaq)
                    .with_delay(Duration::from_millis(faq_ms))
                    .with_delta("jurisdiction", json!("Wales")),
            ]));
            let envelope = assistant
                .process_turn("s", request(), CancellationToken::new())
                .await
                .unwrap();
            (envelope, store.get("s").unwrap())
        };

        let (legal_first, legal_first_state) = run(10, 300).await;
        let (faq_first, faq_first_state) = run(300, 10).await;

        assert_eq!(legal_first, faq_first);
        assert_eq!(legal_first_state, faq_first_state);
        // Deltas merge in route order: the FAQ comes last and wins
        assert_eq!(legal_first_state.get_str("jurisdiction"), Some("Wales"));
    }

    #[tokio::test]
    async fn test_idempotent_with_deterministic_handlers() {
        let handlers = || {
            stubs(vec![
                StubHandler::replying(HandlerId::ImageDiagnosis)
                    .with_delta("last_severity", json!("moderate")),
                StubHandler::replying(HandlerId::TenancyFaq),
            ])
        };
        let request = || Request::text_only("Is this damp serious?").with_image(photo());

        let (first, first_store) = assistant(handlers());
        let (second, second_store) = assistant(handlers());
        let a = first.process_turn("s", request(), CancellationToken::new()).await.unwrap();
        let b = second.process_turn("s", request(), CancellationToken::new()).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(first_store.get("s"), second_store.get("s"));
    }

    #[tokio::test]
    async fn test_invalid_output_becomes_fallback() {
        let (assistant, store) = assistant(stubs(vec![StubHandler::with_payload(
            HandlerId::TenancyFaq,
            json!({ "answer": "   " }),
        )
        .with_delta("location", json!("Bristol"))]));

        let envelope = assistant
            .process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(envelope.entries.len(), 1);
        let EnvelopeEntry::Fallback(notice) = &envelope.entries[0] else {
            panic!("expected fallback");
        };
        assert_eq!(notice.handler, HandlerId::TenancyFaq);
        assert_eq!(
            notice.reason,
            FallbackReason::ValidationFailed {
                field: "answer".into()
            }
        );
        // Deltas of invalid outputs are discarded
        assert_eq!(store.get("s").unwrap().location(), None);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successful_outputs() {
        let (assistant, store) = assistant(stubs(vec![
            StubHandler::failing(
                HandlerId::ImageDiagnosis,
                HandlerFailure::upstream("Server error: overloaded"),
            )
            .with_delta("last_severity", json!("urgent")),
            StubHandler::with_payload(HandlerId::LegalGuidance, json!({ "citations": [] })),
            StubHandler::replying(HandlerId::TenancyFaq),
        ]));

        let envelope = assistant
            .process_turn(
                "s",
                Request::text_only("Is my landlord liable for this?").with_image(photo()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            envelope.route,
            vec![
                HandlerId::ImageDiagnosis,
                HandlerId::LegalGuidance,
                HandlerId::TenancyFaq
            ]
        );
        assert_eq!(kinds(&envelope.entries), vec![Some(OutputKind::FaqAnswer)]);
        assert_eq!(store.get("s").unwrap().get_str("last_severity"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout() {
        let (assistant, _) = assistant(stubs(vec![StubHandler::hanging(HandlerId::TenancyFaq)]));
        let assistant = assistant.with_handler_timeout(Duration::from_secs(5));

        let envelope = assistant
            .process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let EnvelopeEntry::Fallback(notice) = &envelope.entries[0] else {
            panic!("expected fallback");
        };
        assert_eq!(
            notice.reason,
            FallbackReason::HandlerFailed {
                reason: FailureReason::Timeout
            }
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_fallback() {
        let (assistant, store) =
            assistant(stubs(vec![StubHandler::panicking(HandlerId::TenancyFaq)]));
        let assistant = assistant.with_handler_timeout(Duration::from_millis(100));

        let envelope = tokio::time::timeout(
            Duration::from_secs(3),
            assistant.process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            ),
        )
        .await
        .expect("turn must finish despite the panic")
        .unwrap();

        let EnvelopeEntry::Fallback(notice) = &envelope.entries[0] else {
            panic!("expected fallback, got {:?}", envelope.entries);
        };
        assert_eq!(
            notice.reason,
            FallbackReason::HandlerFailed {
                reason: FailureReason::UpstreamError
            }
        );
        assert_eq!(store.get("s").unwrap().turns.len(), 1);

        // The session is not left locked
        assert!(assistant.reset_session("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_discards_turn() {
        let faq = Arc::new(StubHandler::hanging(HandlerId::TenancyFaq));
        let legal = Arc::new(StubHandler::replying(HandlerId::LegalGuidance));
        let handlers = HandlerSet::new().with(faq.clone()).with(legal.clone());
        let (assistant, store) = assistant(handlers);
        store.insert("s", ConversationState::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let started = faq.started.clone();
        let (result, ()) = tokio::join!(
            assistant.process_turn(
                "s",
                Request::text_only("Can I be evicted without notice?"),
                cancel,
            ),
            async move {
                started.notified().await;
                trigger.cancel();
            }
        );

        assert!(matches!(result, Err(TurnError::Cancelled)));
        assert_eq!(store.get("s"), Some(ConversationState::default()));
        assert_eq!(store.save_count(), 0);
        assert!(faq.last_token().unwrap().is_cancelled());
        assert!(legal.calls() <= 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_turn_dispatches_nothing() {
        let faq = Arc::new(StubHandler::replying(HandlerId::TenancyFaq));
        let (assistant, _) = assistant(HandlerSet::new().with(faq.clone()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = assistant
            .process_turn("s", Request::text_only("Who fixes the boiler?"), cancel)
            .await;

        assert!(matches!(result, Err(TurnError::Cancelled)));
        assert_eq!(faq.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_turn_cancels_handlers() {
        let faq = Arc::new(StubHandler::hanging(HandlerId::TenancyFaq));
        let (assistant, store) = assistant(HandlerSet::new().with(faq.clone()));

        let turn = assistant.process_turn(
            "s",
            Request::text_only("Who fixes the boiler?"),
            CancellationToken::new(),
        );
        assert!(tokio::time::timeout(Duration::from_secs(1), turn).await.is_err());

        assert_eq!(assistant.busy_sessions(), 0);
        assert_eq!(faq.calls(), 1);
        assert!(faq.last_token().unwrap().is_cancelled());
        assert!(store.get("s").is_none());
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_prior_state() {
        let (assistant, store) =
            assistant(stubs(vec![StubHandler::replying(HandlerId::TenancyFaq)]));
        store.insert("s", ConversationState::default());
        store.fail_saves();

        let err = assistant
            .process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::Storage(_)));
        assert_eq!(store.get("s"), Some(ConversationState::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_turns_of_one_session_are_serialized() {
        let (assistant, store) = assistant(stubs(vec![
            StubHandler::replying(HandlerId::TenancyFaq).with_delay(Duration::from_millis(50)),
        ]));

        let (a, b) = tokio::join!(
            assistant.process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            ),
            assistant.process_turn(
                "s",
                Request::text_only("Who pays the bills?"),
                CancellationToken::new(),
            ),
        );

        let mut turns = vec![a.unwrap().turn, b.unwrap().turn];
        turns.sort_unstable();
        assert_eq!(turns, vec![1, 2]);
        assert_eq!(store.get("s").unwrap().turns.len(), 2);
        assert_eq!(assistant.busy_sessions(), 0);
    }

    #[tokio::test]
    async fn test_session_locks_are_released() {
        let (assistant, _) = assistant(stubs(vec![StubHandler::replying(HandlerId::TenancyFaq)]));

        for id in ["a", "b", "c"] {
            assistant
                .process_turn(
                    id,
                    Request::text_only("Who fixes the boiler?"),
                    CancellationToken::new(),
                )
                .await
                .unwrap();
        }
        for id in ["unknown-1", "unknown-2"] {
            assert!(!assistant.reset_session(id).await.unwrap());
            assert!(!assistant.delete_session(id).await.unwrap());
        }
        let _ = assistant
            .process_turn("d", Request::text_only("  "), CancellationToken::new())
            .await;

        assert_eq!(assistant.busy_sessions(), 0);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (assistant, _) = assistant(stubs(vec![StubHandler::replying(HandlerId::TenancyFaq)]));
        let mut rx = assistant.subscribe();

        assistant
            .process_turn(
                "s-progress",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut phases = Vec::new();
        while let Ok(ProgressEvent { session_id, phase }) = rx.try_recv() {
            assert_eq!(session_id, "s-progress");
            phases.push(phase);
        }
        assert_eq!(
            phases,
            vec![
                TurnPhase::Dispatch,
                TurnPhase::Collect,
                TurnPhase::Validate,
                TurnPhase::Merge,
                TurnPhase::End
            ]
        );
    }

    #[tokio::test]
    async fn test_unregistered_handler_becomes_fallback() {
        let (assistant, _) = assistant(HandlerSet::new());

        let envelope = assistant
            .process_turn(
                "s",
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(envelope.fallbacks().count(), 1);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (assistant, store) =
            assistant(stubs(vec![StubHandler::replying(HandlerId::TenancyFaq)]));

        let id = assistant.create_session().await.unwrap();
        assert_eq!(assistant.session(&id).await.unwrap(), Some(ConversationState::default()));

        assistant
            .process_turn(
                &id,
                Request::text_only("Who fixes the boiler?"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(store.get(&id).unwrap().turns.len(), 1);

        assert!(assistant.reset_session(&id).await.unwrap());
        assert_eq!(store.get(&id), Some(ConversationState::default()));

        assert!(assistant.delete_session(&id).await.unwrap());
        assert_eq!(assistant.session(&id).await.unwrap(), None);
        assert!(!assistant.reset_session(&id).await.unwrap());
        assert!(!assistant.delete_session(&id).await.unwrap());
    }
}
