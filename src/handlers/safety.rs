//! Safety escalation: deterministic hazard warning from the routing policy

use super::{Handler, HandlerFailure, HandlerId, HandlerReply};
use crate::classifier::Classifier;
use crate::conversation::{keys, ContextDelta, ConversationState, Request};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const UNKNOWN_HAZARD: &str = "general";
const UNKNOWN_ACTION: &str =
    "Move away from the hazard and keep others clear until it has been made safe.";
const UNKNOWN_CONTACT: &str = "If anyone is in danger call 999 (or your local emergency number).";

pub struct SafetyEscalationHandler {
    classifier: Arc<Classifier>,
}

impl SafetyEscalationHandler {
    pub fn new(classifier: Arc<Classifier>) -> Self {
        Self { classifier }
    }
}

#[async_trait]
impl Handler for SafetyEscalationHandler {
    fn id(&self) -> HandlerId {
        HandlerId::SafetyEscalation
    }

    async fn handle(
        &self,
        request: &Request,
        _state: &ConversationState,
        _cancel: CancellationToken,
    ) -> Result<HandlerReply, HandlerFailure> {
        let text = request.text().ok_or_else(HandlerFailure::missing_text)?;

        let (category, action, contact) = match self.classifier.hazard_for(text) {
            Some(rule) => (
                rule.category.as_str(),
                rule.immediate_action.as_str(),
                rule.contact_services.as_str(),
            ),
            None => (UNKNOWN_HAZARD, UNKNOWN_ACTION, UNKNOWN_CONTACT),
        };
        tracing::warn!(hazard = category, "Safety escalation raised");

        let mut delta = ContextDelta::new();
        delta.insert(keys::URGENT.to_string(), Value::Bool(true));
        delta.insert(keys::HAZARD_CATEGORY.to_string(), Value::from(category));

        let payload = json!({
            "hazard_category": category,
            "immediate_action": action,
            "contact_services": contact,
        });
        Ok(HandlerReply::new(self.id().output_kind(), payload).with_delta(delta))
    }
}
