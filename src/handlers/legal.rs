//! Legal guidance: pointers to statutes and regulations, never legal advice

use super::prompt::{complete_json, grounded, region, sources_section, str_field, user_prompt};
use super::{Handler, HandlerFailure, HandlerId, HandlerReply};
use crate::conversation::{ConversationState, Request};
use crate::llm::LlmRequest;
use crate::runtime::{LlmClient, SearchGrounding};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SYSTEM_PROMPT: &str = r#"You are a housing law research assistant. You point tenants and landlords to the legislation, regulations and official guidance relevant to their question. You do not give legal advice.

Cite specific acts, sections and regulations where possible, for the user's jurisdiction when it is known. Rely on the web search findings when they are provided.

Respond with a single JSON object with these fields:
- "citations": array of strings, each naming a statute, regulation or official guidance document and what it covers
- "jurisdiction": string, the jurisdiction the citations apply to
- "disclaimer": string, a statement that this is general information and not legal advice, recommending a qualified adviser for their situation"#;

pub struct LegalGuidanceHandler {
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SearchGrounding>,
}

impl LegalGuidanceHandler {
    pub fn new(llm: Arc<dyn LlmClient>, search: Arc<dyn SearchGrounding>) -> Self {
        Self { llm, search }
    }
}

#[async_trait]
impl Handler for LegalGuidanceHandler {
    fn id(&self) -> HandlerId {
        HandlerId::LegalGuidance
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
            Some(region) => format!("{text} housing law legislation {region}"),
            None => format!("{text} housing law legislation"),
        };
        let results = grounded(self.search.as_ref(), &query, &cancel).await;

        let mut prompt = user_prompt(text, request, state);
        if let Some(region) = region {
            prompt.push_str(&format!("\n\nJurisdiction: {region}."));
        }
        if let Some(section) = sources_section(&results) {
            prompt.push_str("\n\n");
            prompt.push_str(&section);
        }

        let llm_request = LlmRequest::new(SYSTEM_PROMPT).with_text(prompt);
        let mut guidance = complete_json(self.llm.as_ref(), llm_request, &cancel).await?;

        // The disclaimer is left exactly as the model produced it
        if str_field(&guidance, "jurisdiction").is_none() {
            if let Some(region) = region {
                guidance.insert("jurisdiction".to_string(), Value::from(region));
            }
        }

        Ok(HandlerReply::new(self.id().output_kind(), Value::Object(guidance))
            .with_delta(request.context.delta()))
    }
}
