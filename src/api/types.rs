//! API request and response types

use crate::conversation::{ImageAttachment, PropertyContext, Request};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One turn of user input
#[derive(Debug, Default, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<ImageInput>,
    #[serde(default)]
    pub context: Option<PropertyContext>,
}

/// Base64-encoded photo
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInput {
    pub data: String,
    pub media_type: String,
}

impl TurnRequest {
    /// Decode into a [`Request`]. Fails only on malformed image data.
    pub fn into_request(self) -> Result<Request, base64::DecodeError> {
        let image = self
            .image
            .map(|image| {
                base64::engine::general_purpose::STANDARD
                    .decode(image.data.trim())
                    .map(|bytes| ImageAttachment::new(bytes, image.media_type))
            })
            .transpose()?;
        Ok(Request::new(
            image,
            self.text,
            self.context.unwrap_or_default(),
        ))
    }
}

/// Response for session creation
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreatedResponse {
    pub session_id: String,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
