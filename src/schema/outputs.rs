//! Output shapes each handler must produce

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered severity of a diagnosed property issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Urgent,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Moderate => "moderate",
            Severity::High => "high",
            Severity::Urgent => "urgent",
        }
    }
}

/// Assessment of a photographed property issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    pub assessment: String,
    #[serde(default)]
    pub troubleshooting: Vec<String>,
    /// Whether a professional should be called in
    #[serde(default)]
    pub referral: bool,
    pub severity: Severity,
    /// Trades recommended when `referral` is set (plumber, electrician, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<String>,
    /// Hazards visible in the photograph
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hazards: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_category: Option<String>,
}

/// Answer to a tenancy question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaqAnswer {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub legal_references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regional_note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_resources: Vec<String>,
}

/// Legal or regulatory pointers. Never legal advice, hence the mandatory disclaimer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalGuidance {
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub jurisdiction: String,
    pub disclaimer: String,
}

/// Escalation for a hazard that needs immediate action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyWarning {
    pub hazard_category: String,
    pub immediate_action: String,
    #[serde(default)]
    pub contact_services: String,
}

/// Declared variant of a raw handler output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    IssueReport,
    FaqAnswer,
    LegalGuidance,
    SafetyWarning,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::IssueReport => "issue_report",
            OutputKind::FaqAnswer => "faq_answer",
            OutputKind::LegalGuidance => "legal_guidance",
            OutputKind::SafetyWarning => "safety_warning",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated handler output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerOutput {
    IssueReport(IssueReport),
    FaqAnswer(FaqAnswer),
    LegalGuidance(LegalGuidance),
    SafetyWarning(SafetyWarning),
}

impl HandlerOutput {
    pub fn kind(&self) -> OutputKind {
        match self {
            HandlerOutput::IssueReport(_) => OutputKind::IssueReport,
            HandlerOutput::FaqAnswer(_) => OutputKind::FaqAnswer,
            HandlerOutput::LegalGuidance(_) => OutputKind::LegalGuidance,
            HandlerOutput::SafetyWarning(_) => OutputKind::SafetyWarning,
        }
    }

    pub fn is_safety_warning(&self) -> bool {
        matches!(self, HandlerOutput::SafetyWarning(_))
    }

    /// Markdown rendering, section per field
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        match self {
            HandlerOutput::IssueReport(report) => {
                out.push_str("## Property Issue Assessment\n");
                out.push_str(&report.assessment);
                out.push_str(&format!("\n\nSeverity: {}\n", report.severity.as_str()));
                push_list(&mut out, "Troubleshooting Suggestions", &report.troubleshooting);
                if report.referral {
                    out.push_str("\n## Professional Referral\n");
                    if report.trades.is_empty() {
                        out.push_str("A qualified professional should inspect this issue.\n");
                    } else {
                        push_items(&mut out, &report.trades);
                    }
                }
                push_list(&mut out, "Safety Warnings", &report.hazards);
            }
            HandlerOutput::FaqAnswer(answer) => {
                out.push_str("## Answer\n");
                out.push_str(&answer.answer);
                out.push('\n');
                push_list(&mut out, "Legal References", &answer.legal_references);
                if let Some(note) = &answer.regional_note {
                    out.push_str("\n## Regional Information\n");
                    out.push_str(note);
                    out.push('\n');
                }
                push_list(&mut out, "Additional Resources", &answer.additional_resources);
            }
            HandlerOutput::LegalGuidance(guidance) => {
                out.push_str("## Legal Guidance");
                if !guidance.jurisdiction.is_empty() {
                    out.push_str(&format!(" ({})", guidance.jurisdiction));
                }
                out.push('\n');
                push_items(&mut out, &guidance.citations);
                out.push_str(&format!("\n_{}_\n", guidance.disclaimer));
            }
            HandlerOutput::SafetyWarning(warning) => {
                out.push_str(&format!("## Safety Warning: {}\n", warning.hazard_category));
                out.push_str(&warning.immediate_action);
                out.push('\n');
                if !warning.contact_services.is_empty() {
                    out.push('\n');
                    out.push_str(&warning.contact_services);
                    out.push('\n');
                }
            }
        }
        out
    }

    /// One-line digest for conversation history
    pub fn summary(&self) -> String {
        match self {
            HandlerOutput::IssueReport(report) => format!(
                "Issue report ({}): {}",
                report.severity.as_str(),
                first_line(&report.assessment)
            ),
            HandlerOutput::FaqAnswer(answer) => format!("Answer: {}", first_line(&answer.answer)),
            HandlerOutput::LegalGuidance(guidance) => format!(
                "Legal guidance: {} citation(s) for {}",
                guidance.citations.len(),
                if guidance.jurisdiction.is_empty() {
                    "unspecified jurisdiction"
                } else {
                    guidance.jurisdiction.as_str()
                }
            ),
            HandlerOutput::SafetyWarning(warning) => format!(
                "Safety warning ({}): {}",
                warning.hazard_category,
                first_line(&warning.immediate_action)
            ),
        }
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {title}\n"));
    push_items(out, items);
}

fn push_items(out: &mut String, items: &[String]) {
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("{}. {item}\n", i + 1));
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
