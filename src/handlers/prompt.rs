//! Prompt assembly and completion plumbing shared by the model-backed handlers

use super::HandlerFailure;
use crate::conversation::{ConversationState, Request};
use crate::llm::{LlmRequest, SearchResults};
use crate::runtime::{LlmClient, SearchGrounding};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Turns of history included in prompts
const HISTORY_TURNS: usize = 3;

pub(super) const MAX_TOKENS: u32 = 2048;

/// User-facing prompt text: the request text, the declared property context,
/// and a digest of recent turns.
pub(super) fn user_prompt(text: &str, request: &Request, state: &ConversationState) -> String {
    let mut prompt = text.to_string();
    if let Some(context) = request.context.describe() {
        prompt.push_str("\n\nAdditional context: ");
        prompt.push_str(&context);
    }
    if let Some(history) = state.history_summary(HISTORY_TURNS) {
        prompt.push_str("\n\nConversation so far:\n");
        prompt.push_str(&history);
    }
    prompt
}

/// The region a question is about: declared on the request, else remembered
pub(super) fn region<'a>(request: &'a Request, state: &'a ConversationState) -> Option<&'a str> {
    request.context.location().or_else(|| state.location())
}

/// Grounding search that degrades to no sources on failure
pub(super) async fn grounded(
    search: &dyn SearchGrounding,
    query: &str,
    cancel: &CancellationToken,
) -> SearchResults {
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return SearchResults::default(),
        result = search.search(query) => result,
    };
    result.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Grounding search unavailable, answering without sources");
        SearchResults::default()
    })
}

/// Render search results as a prompt section
pub(super) fn sources_section(results: &SearchResults) -> Option<String> {
    if results.summary.trim().is_empty() && results.sources.is_empty() {
        return None;
    }
    let mut section = String::from("Web search findings:\n");
    if !results.summary.trim().is_empty() {
        section.push_str(results.summary.trim());
        section.push('\n');
    }
    for source in &results.sources {
        section.push_str("- ");
        section.push_str(&source.citation());
        section.push('\n');
    }
    Some(section)
}

/// Run a JSON completion and parse the result as an object
pub(super) async fn complete_json(
    llm: &dyn LlmClient,
    request: LlmRequest,
    cancel: &CancellationToken,
) -> Result<Map<String, Value>, HandlerFailure> {
    let request = LlmRequest {
        max_tokens: Some(MAX_TOKENS),
        ..request.json()
    };
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(HandlerFailure::upstream("request cancelled")),
        response = llm.complete(&request) => response?,
    };
    parse_object(&response.text())
}

/// Parse a completion as a JSON object, tolerating markdown code fences and
/// prose around the object.
pub(super) fn parse_object(text: &str) -> Result<Map<String, Value>, HandlerFailure> {
    let trimmed = text.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => trimmed.get(start..=end).unwrap_or(trimmed),
        _ => trimmed,
    };
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(HandlerFailure::malformed(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(HandlerFailure::malformed(format!(
            "completion is not valid JSON: {e}"
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Non-blank string field
pub(super) fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
