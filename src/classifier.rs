//! Request classification
//!
//! Deterministic, keyword-driven routing. Decides which handlers see a
//! request and whether it is urgent. No model call is involved, so the same
//! request always yields the same route.


use crate::conversation::{ConversationState, Request};
use crate::handlers::HandlerId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

// ============================================================================
// Route
// ============================================================================

/// Handlers selected for one request, in canonical order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    handlers: Vec<HandlerId>,
    urgent: bool,
    /// Text describes a visible defect but no photo came with it
    #[serde(default)]
    photo_requested: bool,
}

impl Route {
    pub(crate) fn new(handlers: Vec<HandlerId>, urgent: bool) -> Self {
        debug_assert!(!handlers.is_empty());
        Self {
            handlers,
            urgent,
            photo_requested: false,
        }
    }

    #[must_use]
    pub(crate) fn with_photo_request(mut self, requested: bool) -> Self {
        self.photo_requested = requested;
        self
    }

    pub fn photo_requested(&self) -> bool {
        self.photo_requested
    }

    pub fn handlers(&self) -> &[HandlerId] {
        &self.handlers
    }

    pub fn urgent(&self) -> bool {
        self.urgent
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers.contains(&id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("request has neither an image nor text")]
    EmptyRequest,
}

// ============================================================================
// Policy
// ============================================================================

/// One hazard category and the words that reveal it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HazardRule {
    pub category: String,
    pub keywords: Vec<String>,
    pub immediate_action: String,
    #[serde(default)]
    pub contact_services: String,
}

impl HazardRule {
    fn new(
        category: &str,
        keywords: &[&str],
        immediate_action: &str,
        contact_services: &str,
    ) -> Self {
        Self {
            category: category.to_string(),
            keywords: terms(keywords),
            immediate_action: immediate_action.to_string(),
            contact_services: contact_services.to_string(),
        }
    }
}

fn terms(items: &[&str]) -> Vec<String> {
    items.iter().map(|t| (*t).to_string()).collect()
}

/// Keyword lists and handler ordering used to route requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Canonical handler order for routes and envelopes
    pub order: Vec<HandlerId>,
    /// Hazards checked in order; the first match names the category
    pub hazards: Vec<HazardRule>,
    /// Terms that call for legal guidance alongside the FAQ answer
    pub legal_terms: Vec<String>,
    /// Terms that mark text as a tenancy question rather than a photo caption
    pub tenancy_terms: Vec<String>,
    /// Visible defects that need a photo to diagnose
    pub visible_issue_terms: Vec<String>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            order: HandlerId::ALL.to_vec(),
            hazards: vec![
                HazardRule::new(
                    "gas",
                    &[
                        "gas leak",
                        "leaking gas",
                        "smell gas",
                        "smell of gas",
                        "smells of gas",
                        "gas smell",
                        "smelling gas",
                    ],
                    "Do not use light switches, appliances or naked flames. Open doors and windows, turn off the gas supply at the meter if it is safe to do so, and leave the property.",
                    "Call the National Gas Emergency Service on 0800 111 999 from outside the property.",
                ),
                HazardRule::new(
                    "carbon_monoxide",
                    &["carbon monoxide", "co alarm", "co detector"],
                    "Get everyone into fresh air immediately, open windows if you can do so on the way out, and stop using fuel-burning appliances.",
                    "Call the gas emergency line on 0800 111 999 and seek medical help if anyone feels unwell.",
                ),
                HazardRule::new(
                    "fire",
                    &["fire", "smoke", "flames", "burning smell", "smell of burning"],
                    "Leave the property, close doors behind you and do not go back inside.",
                    "Call the fire service on 999.",
                ),
                HazardRule::new(
                    "electrical",
                    &[
                        "sparks",
                        "sparking",
                        "exposed wires",
                        "exposed wiring",
                        "live wire",
                        "electric shock",
                        "electrocuted",
                        "scorch marks",
                    ],
                    "Do not touch the affected fitting. Switch off the electricity at the consumer unit if it is safe to do so and keep everyone away.",
                    "Contact a registered electrician and inform your landlord or managing agent immediately.",
                ),
                HazardRule::new(
                    "structural",
                    &[
                        "collapse",
                        "collapsed",
                        "collapsing",
                        "caving in",
                        "ceiling falling",
                        "structural failure",
                    ],
                    "Keep everyone clear of the affected area and leave the building if the structure may be unstable.",
                    "Contact your local council building control team or a structural engineer, and inform your landlord.",
                ),
                HazardRule::new(
                    "flooding",
                    &["flood", "flooding", "flooded", "burst pipe", "water pouring"],
                    "Turn off the water at the stopcock and switch off electricity near the water if it is safe to do so.",
                    "Contact an emergency plumber and inform your landlord or managing agent.",
                ),
            ],
            legal_terms: terms(&[
                "notice",
                "eviction",
                "evict",
                "evicted",
                "deposit",
                "section 21",
                "section 8",
                "section 13",
                "tribunal",
                "regulation",
                "regulations",
                "legislation",
                "law",
                "legal",
                "lawful",
                "unlawful",
                "illegal",
                "rights",
                "liable",
                "liability",
                "court",
                "possession order",
                "lease",
                "contract",
                "statutory",
            ]),
            tenancy_terms: terms(&[
                "landlord",
                "landlords",
                "tenant",
                "tenants",
                "tenancy",
                "rent",
                "rental",
                "renting",
                "lease",
                "letting agent",
                "managing agent",
                "agreement",
                "deposit",
                "repair",
                "repairs",
                "bills",
                "flatmate",
                "lodger",
            ]),
            visible_issue_terms: terms(&[
                "mould",
                "mold",
                "damp",
                "condensation",
                "crack",
                "cracks",
                "cracked",
                "leak",
                "leaking",
                "leaks",
                "stain",
                "stains",
                "water damage",
                "peeling",
                "rot",
                "rotten",
                "subsidence",
                "sagging",
                "woodworm",
                "infestation",
            ]),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("handler order must list each handler exactly once, got {0:?}")]
    InvalidOrder(Vec<HandlerId>),
    #[error("hazard rule `{0}` has no keywords")]
    EmptyHazard(String),
    #[error("invalid keyword pattern: {0}")]
    Pattern(#[from] regex::Error),
}

// ============================================================================
// Classifier
// ============================================================================

/// Compiled routing policy
#[derive(Debug)]
pub struct Classifier {
    policy: RoutingPolicy,
    hazards: Vec<Regex>,
    legal: Option<Regex>,
    tenancy: Option<Regex>,
    visible_issue: Option<Regex>,
    question: Regex,
}

impl Classifier {
    pub fn new(policy: RoutingPolicy) -> Result<Self, PolicyError> {
        let unique: HashSet<_> = policy.order.iter().collect();
        if policy.order.len() != HandlerId::ALL.len() || unique.len() != HandlerId::ALL.len() {
            return Err(PolicyError::InvalidOrder(policy.order.clone()));
        }

        let mut hazards = Vec::with_capacity(policy.hazards.len());
        for rule in &policy.hazards {
            let regex = keyword_regex(&rule.keywords)?
                .ok_or_else(|| PolicyError::EmptyHazard(rule.category.clone()))?;
            hazards.push(regex);
        }
        let legal = keyword_regex(&policy.legal_terms)?;
        let tenancy = keyword_regex(&policy.tenancy_terms)?;
        let visible_issue = keyword_regex(&policy.visible_issue_terms)?;
        let question = Regex::new(
            r"(?i)^\s*(?:what|what's|how|why|when|where|who|whose|which|can|could|should|shall|is|are|am|do|does|did|will|would|may|might|must|has|have)\b",
        )?;

        Ok(Self {
            policy,
            hazards,
            legal,
            tenancy,
            visible_issue,
            question,
        })
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Canonical handler order
    pub fn order(&self) -> &[HandlerId] {
        &self.policy.order
    }

    /// Index of `id` in the canonical order
    pub fn rank(&self, id: HandlerId) -> usize {
        self.policy
            .order
            .iter()
            .position(|h| *h == id)
            .unwrap_or(usize::MAX)
    }

    /// Decide which handlers see `request`.
    ///
    /// The conversation state is accepted so policies can consider history;
    /// the keyword policy routes on the request alone.
    pub fn classify(
        &self,
        request: &Request,
        _state: &ConversationState,
    ) -> Result<Route, ClassifyError> {
        let text = request.text();
        if text.is_none() && !request.has_image() {
            return Err(ClassifyError::EmptyRequest);
        }

        let mut selected = Vec::new();
        let mut urgent = false;

        if request.has_image() {
            selected.push(HandlerId::ImageDiagnosis);
        }

        if let Some(text) = text {
            if self.hazard_for(text).is_some() {
                selected.push(HandlerId::SafetyEscalation);
                urgent = true;
            }
            if !self.is_caption(text, request.has_image()) {
                selected.push(HandlerId::TenancyFaq);
                if matches(self.legal.as_ref(), text) {
                    selected.push(HandlerId::LegalGuidance);
                }
            }
        }

        let photo_requested =
            !request.has_image() && text.is_some_and(|t| matches(self.visible_issue.as_ref(), t));

        selected.sort_by_key(|id| self.rank(*id));
        Ok(Route::new(selected, urgent).with_photo_request(photo_requested))
    }

    /// First hazard rule whose keywords appear in `text`
    pub fn hazard_for(&self, text: &str) -> Option<&HazardRule> {
        self.hazards
            .iter()
            .position(|regex| regex.is_match(text))
            .map(|i| &self.policy.hazards[i])
    }

    /// Text accompanying a photo that only describes it
    fn is_caption(&self, text: &str, has_image: bool) -> bool {
        has_image
            && !text.contains('?')
            && !self.question.is_match(text)
            && !matches(self.tenancy.as_ref(), text)
            && !matches(self.legal.as_ref(), text)
    }
}

fn matches(regex: Option<&Regex>, text: &str) -> bool {
    regex.is_some_and(|r| r.is_match(text))
}

/// Case-insensitive whole-word alternation, `None` for an empty list
fn keyword_regex(keywords: &[String]) -> Result<Option<Regex>, regex::Error> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(|k| {
            k.split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).map(Some)
}
