//! Process configuration read from the environment

use crate::api::DEFAULT_MAX_BODY_BYTES;
use crate::classifier::{Classifier, PolicyError, RoutingPolicy};
use crate::llm::LlmConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LLM_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
    #[error("Failed to read routing policy {path}: {source}")]
    PolicyRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse routing policy {path}: {source}")]
    PolicyParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid routing policy: {0}")]
    Policy(#[from] PolicyError),
}

/// Server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub handler_timeout: Duration,
    pub routing_policy: Option<PathBuf>,
    pub google_api_key: Option<String>,
    pub gateway: Option<String>,
    pub default_model: Option<String>,
    pub llm_retries: u32,
    /// Largest accepted HTTP request body
    pub max_body_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let db_path = var("PROPERTY_ASSIST_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".property-assist").join("sessions.db")
            },
            PathBuf::from,
        );

        let timeout_secs = number(
            "PROPERTY_ASSIST_HANDLER_TIMEOUT_SECS",
            var("PROPERTY_ASSIST_HANDLER_TIMEOUT_SECS"),
            DEFAULT_HANDLER_TIMEOUT_SECS,
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::Zero {
                var: "PROPERTY_ASSIST_HANDLER_TIMEOUT_SECS",
            });
        }

        let max_body_bytes = number(
            "PROPERTY_ASSIST_MAX_BODY_BYTES",
            var("PROPERTY_ASSIST_MAX_BODY_BYTES"),
            DEFAULT_MAX_BODY_BYTES,
        )?;
        if max_body_bytes == 0 {
            return Err(ConfigError::Zero {
                var: "PROPERTY_ASSIST_MAX_BODY_BYTES",
            });
        }

        Ok(Self {
            port: number("PROPERTY_ASSIST_PORT", var("PROPERTY_ASSIST_PORT"), DEFAULT_PORT)?,
            db_path,
            handler_timeout: Duration::from_secs(timeout_secs),
            routing_policy: var("PROPERTY_ASSIST_ROUTING_POLICY").map(PathBuf::from),
            google_api_key: var("GOOGLE_API_KEY"),
            gateway: var("LLM_GATEWAY"),
            default_model: var("DEFAULT_MODEL"),
            llm_retries: number(
                "PROPERTY_ASSIST_LLM_RETRIES",
                var("PROPERTY_ASSIST_LLM_RETRIES"),
                DEFAULT_LLM_RETRIES,
            )?,
            max_body_bytes,
        })
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            google_api_key: self.google_api_key.clone(),
            gateway: self.gateway.clone(),
            default_model: self.default_model.clone(),
            max_retries: self.llm_retries,
        }
    }

    /// The configured routing policy, or the built-in one
    pub fn routing_policy(&self) -> Result<RoutingPolicy, ConfigError> {
        match &self.routing_policy {
            Some(path) => load_routing_policy(path),
            None => Ok(RoutingPolicy::default()),
        }
    }

    pub fn classifier(&self) -> Result<Classifier, ConfigError> {
        Ok(Classifier::new(self.routing_policy()?)?)
    }
}

fn number<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

/// Read a routing policy from a JSON file. Omitted fields keep their defaults.
pub fn load_routing_policy(path: &Path) -> Result<RoutingPolicy, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::PolicyRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::PolicyParse {
        path: path.to_path_buf(),
        source,
    })
}
