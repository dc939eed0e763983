//! Image diagnosis: one multimodal completion producing an issue report

use super::prompt::{complete_json, str_field, user_prompt};
use super::{Handler, HandlerFailure, HandlerId, HandlerReply};
use crate::conversation::{keys, ConversationState, Request};
use crate::llm::LlmRequest;
use crate::runtime::LlmClient;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_PROMPT: &str = "Please analyze this image for property issues.";

const SYSTEM_PROMPT: &str = r#"You are a property issue detection assistant. You examine photographs of homes and rental properties together with any text from the user, identify visible problems, and give practical troubleshooting advice.

Look for moisture issues (water damage, damp, mould), structural issues (cracks, sagging, subsidence), electrical issues (exposed wiring, scorch marks), plumbing issues (leaks, corrosion), environmental issues (pests, poor ventilation) and cosmetic issues (peeling paint, damaged fixtures).

Base the assessment only on visible evidence. Say when an issue needs an in-person inspection to confirm. Do not speculate beyond what the image and text support.

Respond with a single JSON object with these fields:
- "assessment": string, clear description of every issue identified, or a statement that none is visible
- "troubleshooting": array of strings, specific actionable steps tied to the issues
- "referral": boolean, true when a professional should inspect or repair
- "severity": one of "low", "moderate", "high", "urgent"
- "trades": array of strings, professionals to contact (plumber, electrician, damp specialist, ...)
- "hazards": array of strings, health or safety hazards visible in the image (may be empty)
- "issue_category": short lowercase label for the main issue, e.g. "damp", "electrical", "structural""#;

pub struct ImageDiagnosisHandler {
    llm: Arc<dyn LlmClient>,
}

impl ImageDiagnosisHandler {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn context_delta(
        report: &Map<String, Value>,
        request: &Request,
        state: &ConversationState,
    ) -> crate::conversation::ContextDelta {
        let mut delta = request.context.delta();
        if let Some(severity) = str_field(report, "severity") {
            delta.insert(keys::LAST_SEVERITY.to_string(), Value::from(severity));
        }
        if let Some(category) = str_field(report, "issue_category") {
            let mut issues = state.reported_issues();
            if !issues.iter().any(|issue| issue == category) {
                issues.push(category.to_string());
            }
            delta.insert(keys::REPORTED_ISSUES.to_string(), Value::from(issues));
        }
        delta
    }
}

#[async_trait]
impl Handler for ImageDiagnosisHandler {
    fn id(&self) -> HandlerId {
        HandlerId::ImageDiagnosis
    }

    async fn handle(
        &self,
        request: &Request,
        state: &ConversationState,
        cancel: CancellationToken,
    ) -> Result<HandlerReply, HandlerFailure> {
        let image = request.image.as_ref().ok_or_else(HandlerFailure::missing_image)?;
        let text = request.text().unwrap_or(DEFAULT_PROMPT);

        let llm_request = LlmRequest::new(SYSTEM_PROMPT)
            .with_text(user_prompt(text, request, state))
            .with_image(image.media_type.clone(), image.to_base64());
        let report = complete_json(self.llm.as_ref(), llm_request, &cancel).await?;

        let delta = Self::context_delta(&report, request, state);
        Ok(HandlerReply::new(self.id().output_kind(), Value::Object(report)).with_delta(delta))
    }
}
