//! Model registry for managing available LLM services

use super::{all_models, LlmService, LoggingService, ModelDef, RetryingService};
use std::collections::HashMap;
use std::sync::Arc;

pub const FALLBACK_DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub google_api_key: Option<String>,
    /// Gateway URL; when set, the gateway handles authentication
    pub gateway: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
    /// Extra attempts for transient provider failures
    pub max_retries: u32,
}

/// Registry of available LLM models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut services: HashMap<String, Arc<dyn LlmService>> = HashMap::new();

        for model_def in all_models() {
            if let Some(service) = Self::try_create_model(model_def, config) {
                services.insert(model_def.id.to_string(), service);
            }
        }

        let default_model = config
            .default_model
            .clone()
            .unwrap_or_else(|| FALLBACK_DEFAULT_MODEL.to_string());

        Self {
            services,
            default_model,
        }
    }

    /// Try to create a model service, validating prerequisites
    fn try_create_model(model_def: &ModelDef, config: &LlmConfig) -> Option<Arc<dyn LlmService>> {
        let api_key = if config.gateway.is_some() {
            "implicit".to_string()
        } else {
            config.google_api_key.clone().filter(|k| !k.is_empty())?
        };

        match (model_def.factory)(&api_key, config.gateway.as_deref()) {
            Ok(service) => {
                tracing::debug!(
                    model = model_def.id,
                    description = model_def.description,
                    "Model available"
                );
                let logged: Arc<dyn LlmService> = Arc::new(LoggingService::new(service));
                Some(Arc::new(RetryingService::new(logged, config.max_retries)))
            }
            Err(e) => {
                tracing::warn!(model = model_def.id, error = %e, "Model unavailable");
                None
            }
        }
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    /// Get the default model
    pub fn default(&self) -> Option<Arc<dyn LlmService>> {
        self.get(&self.default_model)
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// List all available model IDs
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }
}
