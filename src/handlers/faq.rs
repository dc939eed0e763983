//! Tenancy FAQ: grounded search plus one completion producing an answer

use super::prompt::{complete_json, grounded, region, sources_section, str_field, user_prompt};
use super::{Handler, HandlerFailure, HandlerId, HandlerReply};
use crate::conversation::{ConversationState, Request};
use crate::llm::LlmRequest;
use crate::runtime::{LlmClient, SearchGrounding};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SYSTEM_PROMPT: &str = r#"You are a tenancy FAQ assistant. You answer questions about renting: tenant rights, landlord responsibilities, rent, repairs, deposits and everyday rental procedures.

Give location-specific guidance when a region is known and say clearly when rules vary by jurisdiction. Be balanced between tenant and landlord perspectives and give practical next steps. Use plain language. Rely on the web search findings when they are provided.

Respond with a single JSON object with these fields:
- "answer": string, the answer to the question
- "legal_references": array of strings, statutes or regulations the answer relies on (may be empty)
- "regional_note": string or null, how the answer differs for the user's region
- "additional_resources": array of strings, official sites or organisations that can help"#;

pub struct TenancyFaqHandler {
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SearchGrounding>,
}

impl TenancyFaqHandler {
    pub fn new(llm: Arc<dyn LlmClient>, search: Arc<dyn SearchGrounding>) -> Self {
        Self { llm, search }
    }
}

#[async_trait]
impl Handler for TenancyFaqHandler {
    fn id(&self) -> HandlerId {
        HandlerId::TenancyFaq
    }

    async fn handle(
        &self,
        request: &Request,
        state: &ConversationState,
        cancel: CancellationToken,
    ) -> Result<HandlerReply, HandlerFailure> {
        let text = request.text().ok_or_else(HandlerFailure::missing_text)?;
        let region = region(request, state);

        let query = match region {
            Some(region) => format!("{text} (Location: {region})"),
            None => text.to_string(),
        };
        let results = grounded(self.search.as_ref(), &query, &cancel).await;

        let mut prompt = user_prompt(text, request, state);
        if let Some(region) = region {
            prompt.push_str(&format!("\n\nThe user's region is {region}."));
        }
        if let Some(section) = sources_section(&results) {
            prompt.push_str("\n\n");
            prompt.push_str(&section);
        }

        let llm_request = LlmRequest::new(SYSTEM_PROMPT).with_text(prompt);
        let mut answer = complete_json(self.llm.as_ref(), llm_request, &cancel).await?;

        if str_field(&answer, "regional_note").is_none() {
            if let Some(region) = region {
                answer.insert(
                    "regional_note".to_string(),
                    Value::from(format!(
                        "This answer is for {region}. Rules can differ in other jurisdictions."
                    )),
                );
            }
        }

        let has_resources = answer
            .get("additional_resources")
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty());
        if !has_resources && !results.sources.is_empty() {
            let citations: Vec<Value> = results
                .sources
                .iter()
                .map(|source| Value::from(source.citation()))
                .collect();
            answer.insert("additional_resources".to_string(), Value::Array(citations));
        }

        Ok(HandlerReply::new(self.id().output_kind(), Value::Object(answer))
            .with_delta(request.context.delta()))
    }
}
