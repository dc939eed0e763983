//! Requests and per-session conversation state
//!
//! A [`Request`] is one turn of user input. [`ConversationState`] is the
//! explicit, serializable context threaded into and returned from every turn.

use crate::schema::EnvelopeEntry;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Key/value updates a handler proposes for the persisted context
pub type ContextDelta = BTreeMap<String, Value>;

/// Well-known context keys
pub mod keys {
    pub const PROPERTY_TYPE: &str = "property_type";
    pub const PROPERTY_AGE: &str = "property_age";
    pub const OCCUPANCY: &str = "occupancy";
    pub const LOCATION: &str = "location";
    pub const REPORTED_ISSUES: &str = "reported_issues";
    pub const LAST_SEVERITY: &str = "last_severity";
    pub const URGENT: &str = "urgent";
    pub const HAZARD_CATEGORY: &str = "hazard_category";
}

// ============================================================================
// Request
// ============================================================================

/// Photograph attached to a request.
///
/// The bytes are owned by the caller and shared read-only with every handler.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub data: Arc<[u8]>,
    pub media_type: String,
}

impl ImageAttachment {
    pub fn new(data: impl Into<Arc<[u8]>>, media_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            media_type: media_type.into(),
        }
    }

    /// Base64 form used by the completion providers
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

impl fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("len", &self.data.len())
            .field("media_type", &self.media_type)
            .finish()
    }
}

/// Structured property details the user declared alongside the request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl PropertyContext {
    pub fn is_empty(&self) -> bool {
        self.property_type.is_none()
            && self.property_age.is_none()
            && self.occupancy.is_none()
            && self.location.is_none()
    }

    /// Declared location, ignoring blank values
    pub fn location(&self) -> Option<&str> {
        non_blank(self.location.as_deref())
    }

    /// One-line description appended to prompts, e.g.
    /// `Location: London. Property type: Flat. Property age: 12 years.`
    pub fn describe(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(location) = self.location() {
            parts.push(format!("Location: {location}."));
        }
        if let Some(kind) = non_blank(self.property_type.as_deref()) {
            parts.push(format!("Property type: {kind}."));
        }
        if let Some(occupancy) = non_blank(self.occupancy.as_deref()) {
            parts.push(format!("Occupancy: {occupancy}."));
        }
        if let Some(age) = self.property_age.filter(|age| *age > 0) {
            parts.push(format!("Property age: {age} years."));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    /// Every declared field as a context-delta, blank values skipped
    pub fn delta(&self) -> ContextDelta {
        let mut delta = ContextDelta::new();
        if let Some(kind) = non_blank(self.property_type.as_deref()) {
            delta.insert(keys::PROPERTY_TYPE.to_string(), Value::from(kind));
        }
        if let Some(age) = self.property_age {
            delta.insert(keys::PROPERTY_AGE.to_string(), Value::from(age));
        }
        if let Some(occupancy) = non_blank(self.occupancy.as_deref()) {
            delta.insert(keys::OCCUPANCY.to_string(), Value::from(occupancy));
        }
        if let Some(location) = self.location() {
            delta.insert(keys::LOCATION.to_string(), Value::from(location));
        }
        delta
    }
}

/// One turn of user input. Immutable once created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub image: Option<ImageAttachment>,
    pub text: Option<String>,
    pub context: PropertyContext,
}

impl Request {
    pub fn new(
        image: Option<ImageAttachment>,
        text: Option<String>,
        context: PropertyContext,
    ) -> Self {
        Self {
            image,
            text,
            context,
        }
    }

    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_context(mut self, context: PropertyContext) -> Self {
        self.context = context;
        self
    }

    /// Trimmed text, `None` when absent or whitespace only
    pub fn text(&self) -> Option<&str> {
        non_blank(self.text.as_deref())
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Serializable summary kept in the conversation history
    pub fn record(&self) -> RequestRecord {
        RequestRecord {
            text: self.text().map(str::to_string),
            image_attached: self.has_image(),
            context: self.context.clone(),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

// ============================================================================
// Conversation State
// ============================================================================

/// What the history keeps of a request (image bytes are not retained)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub image_attached: bool,
    #[serde(default, skip_serializing_if = "PropertyContext::is_empty")]
    pub context: PropertyContext,
}

/// A completed request/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub request: RequestRecord,
    pub entries: Vec<EnvelopeEntry>,
}

/// Ordered turns plus accumulated context for one session.
///
/// Never pruned within a session. Carries no wall-clock data, so replaying the
/// same turn against the same state yields an identical successor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

impl ConversationState {
    /// Merge a context-delta, last write wins per key
    pub fn apply_delta(&mut self, delta: &ContextDelta) {
        for (key, value) in delta {
            self.context.insert(key.clone(), value.clone());
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn location(&self) -> Option<&str> {
        self.get_str(keys::LOCATION)
    }

    pub fn is_urgent(&self) -> bool {
        self.context
            .get(keys::URGENT)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Issue categories reported in earlier turns, oldest first
    pub fn reported_issues(&self) -> Vec<String> {
        self.context
            .get(keys::REPORTED_ISSUES)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plain-text digest of the last `max_turns` turns for prompt history
    pub fn history_summary(&self, max_turns: usize) -> Option<String> {
        let start = self.turns.len().saturating_sub(max_turns);
        let lines: Vec<String> = self.turns[start..]
            .iter()
            .map(|turn| {
                let mut user = turn.request.text.clone().unwrap_or_default();
                if turn.request.image_attached {
                    if !user.is_empty() {
                        user.push(' ');
                    }
                    user.push_str("[Image attached]");
                }
                let reply: Vec<String> = turn.entries.iter().map(EnvelopeEntry::summary).collect();
                format!("User: {user}\nAssistant: {}", reply.join(" | "))
            })
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}
