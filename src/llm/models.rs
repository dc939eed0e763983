//! Model catalog
//!
//! Every completion model the assistant can be configured with, in one place.

use super::gemini::{GeminiModel, GeminiService};
use super::LlmService;
use std::sync::Arc;

/// Model definition with metadata
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// User-facing model ID, also the provider's API name
    pub id: &'static str,
    pub description: &'static str,
    /// Factory taking the API key and optional gateway URL
    pub factory: fn(&str, Option<&str>) -> Result<Arc<dyn LlmService>, String>,
}

fn gemini(
    model: GeminiModel,
    api_key: &str,
    gateway: Option<&str>,
) -> Result<Arc<dyn LlmService>, String> {
    // "implicit" is accepted for gateway mode
    if api_key.is_empty() {
        return Err(format!("{} requires GOOGLE_API_KEY or gateway", model.api_name()));
    }
    GeminiService::new(api_key.to_string(), model, gateway)
        .map(|service| Arc::new(service) as Arc<dyn LlmService>)
        .map_err(|e| e.message)
}

/// Get all available model definitions
pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "gemini-2.0-flash",
            description: "Gemini 2.0 Flash (fast, multimodal)",
            factory: |api_key, gateway| gemini(GeminiModel::Gemini20Flash, api_key, gateway),
        },
        ModelDef {
            id: "gemini-2.5-flash",
            description: "Gemini 2.5 Flash (balanced)",
            factory: |api_key, gateway| gemini(GeminiModel::Gemini25Flash, api_key, gateway),
        },
        ModelDef {
            id: "gemini-2.5-pro",
            description: "Gemini 2.5 Pro (most capable, slower)",
            factory: |api_key, gateway| gemini(GeminiModel::Gemini25Pro, api_key, gateway),
        },
    ]
}
