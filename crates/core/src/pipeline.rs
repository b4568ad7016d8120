//! Deterministic pre-routing pipeline: intent, risk, governance.
//!
//! These classifiers are deliberately keyword-based. The language model is a
//! translator, never a policy engine; whether a request needs human review is
//! decided here, deterministically, before any model is selected.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentResult {
    pub intent: String,
    pub agent: String,
    pub confidence: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_key(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskResult {
    pub level: RiskLevel,
    pub factors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceOutcome {
    pub requires_hitl: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> IntentResult {
        let normalized = text.to_lowercase();
        let rules: &[(&[&str], &str, &str)] = &[
            (&["terminate", "termination", "dismissal", "let go"], "employee_termination", "hr_specialist"),
            (&["payroll", "salary change", "compensation change"], "payroll_change", "finance_specialist"),
            (&["legal", "contract", "nda", "lawsuit"], "legal_review", "legal_specialist"),
            (&["fmla", "leave", "pto", "vacation", "sabbatical"], "hr_leave", "hr_specialist"),
            (&["benefits", "insurance", "401k", "dental"], "hr_benefits", "hr_specialist"),
            (&["invoice", "expense", "reimburse", "purchase order"], "finance_expense", "finance_specialist"),
            (&["password", "vpn", "laptop", "wifi", "access request"], "it_support", "it_specialist"),
        ];

        for (keywords, intent, agent) in rules {
            let matches = keywords.iter().filter(|keyword| normalized.contains(**keyword)).count();
            if matches > 0 {
                let confidence = 60 + (matches.min(4) as u8) * 10;
                return IntentResult {
                    intent: (*intent).to_string(),
                    agent: (*agent).to_string(),
                    confidence,
                };
            }
        }

        IntentResult {
            intent: "general_question".to_string(),
            agent: "general_assistant".to_string(),
            confidence: 40,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RiskAssessor;

impl RiskAssessor {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, text: &str, intent: &IntentResult) -> RiskResult {
        let normalized = text.to_lowercase();
        let mut factors = Vec::new();

        let high_risk_intents = ["employee_termination", "payroll_change", "legal_review"];
        if high_risk_intents.contains(&intent.intent.as_str()) {
            factors.push(format!("high_risk_intent:{}", intent.intent));
        }

        for marker in ["ssn", "social security", "bank account", "medical record"] {
            if normalized.contains(marker) {
                factors.push(format!("sensitive_data:{}", marker.replace(' ', "_")));
            }
        }
        for marker in ["urgent", "immediately", "confidential"] {
            if normalized.contains(marker) {
                factors.push(format!("pressure_marker:{marker}"));
            }
        }

        let level = if factors.iter().any(|factor| {
            factor.starts_with("high_risk_intent") || factor.starts_with("sensitive_data")
        }) {
            RiskLevel::High
        } else if factors.is_empty() {
            RiskLevel::Low
        } else {
            RiskLevel::Medium
        };

        RiskResult { level, factors }
    }
}

/// Decides, before model selection, whether the task must be handed to a
/// human. A mandate here overrides retry and fallback unconditionally.
#[derive(Clone, Debug)]
pub struct GovernancePolicy {
    hitl_intents: HashSet<String>,
    hitl_risk_at_or_above: RiskLevel,
}

impl Default for GovernancePolicy {
    fn default() -> Self {
        Self {
            hitl_intents: ["employee_termination", "payroll_change", "legal_review"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            hitl_risk_at_or_above: RiskLevel::High,
        }
    }
}

impl GovernancePolicy {
    pub fn new(
        hitl_intents: impl IntoIterator<Item = String>,
        hitl_risk_at_or_above: RiskLevel,
    ) -> Self {
        Self { hitl_intents: hitl_intents.into_iter().collect(), hitl_risk_at_or_above }
    }

    pub fn evaluate(&self, intent: &IntentResult, risk: &RiskResult) -> GovernanceOutcome {
        if self.hitl_intents.contains(&intent.intent) {
            return GovernanceOutcome {
                requires_hitl: true,
                reason: Some(format!("intent `{}` requires human review", intent.intent)),
            };
        }
        if risk.level >= self.hitl_risk_at_or_above {
            return GovernanceOutcome {
                requires_hitl: true,
                reason: Some(format!("risk level `{}` requires human review", risk.level.as_key())),
            };
        }
        GovernanceOutcome { requires_hitl: false, reason: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fmla_request_classifies_as_hr_leave() {
        let intent = IntentClassifier::new().classify("I need to request FMLA leave");
        assert_eq!(intent.intent, "hr_leave");
        assert_eq!(intent.agent, "hr_specialist");
        assert!(intent.confidence >= 60);
    }

    #[test]
    fn unmatched_text_falls_back_to_general_assistant() {
        let intent = IntentClassifier::new().classify("what's the cafeteria menu today?");
        assert_eq!(intent.intent, "general_question");
        assert_eq!(intent.agent, "general_assistant");
    }

    #[test]
    fn termination_outranks_leave_keywords() {
        // "let go" and "leave" can co-occur; termination rules match first.
        let intent =
            IntentClassifier::new().classify("we need to let go an employee before they leave");
        assert_eq!(intent.intent, "employee_termination");
    }

    #[test]
    fn leave_request_is_low_risk_without_hitl() {
        let classifier = IntentClassifier::new();
        let assessor = RiskAssessor::new();
        let governance = GovernancePolicy::default();

        let text = "I need to request FMLA leave";
        let intent = classifier.classify(text);
        let risk = assessor.assess(text, &intent);
        let outcome = governance.evaluate(&intent, &risk);

        assert_eq!(risk.level, RiskLevel::Low);
        assert!(!outcome.requires_hitl);
    }

    #[test]
    fn termination_is_high_risk_and_mandates_review() {
        let classifier = IntentClassifier::new();
        let assessor = RiskAssessor::new();
        let governance = GovernancePolicy::default();

        let text = "draft a termination letter for this employee";
        let intent = classifier.classify(text);
        let risk = assessor.assess(text, &intent);
        let outcome = governance.evaluate(&intent, &risk);

        assert_eq!(risk.level, RiskLevel::High);
        assert!(outcome.requires_hitl);
        assert!(outcome.reason.unwrap().contains("employee_termination"));
    }

    #[test]
    fn sensitive_data_raises_risk_even_for_benign_intents() {
        let assessor = RiskAssessor::new();
        let intent = IntentResult {
            intent: "general_question".to_string(),
            agent: "general_assistant".to_string(),
            confidence: 40,
        };
        let risk = assessor.assess("my ssn is on the form", &intent);
        assert_eq!(risk.level, RiskLevel::High);
    }

    #[test]
    fn pressure_markers_alone_are_medium_risk() {
        let assessor = RiskAssessor::new();
        let intent = IntentClassifier::new().classify("please reset the wifi urgently");
        let risk = assessor.assess("please reset the wifi urgently", &intent);
        assert_eq!(risk.level, RiskLevel::Medium);
    }
}
