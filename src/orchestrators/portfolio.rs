//! Portfolio allocation analysis

use super::{check_range, check_summary, decode, structured_prompt, DomainOrchestrator};
use crate::error::SchemaValidationError;
use crate::models::{FinancialContext, OrchestratorKind};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

const KIND: OrchestratorKind = OrchestratorKind::Portfolio;

/// Allowed drift of the allocation total from 100%.
const ALLOCATION_TOLERANCE: f64 = 1.0;

const PORTFOLIO_KEYWORDS: &[&str] = &[
    "portfolio",
    "allocation",
    "rebalanc",
    "diversif",
    "stocks",
    "bonds",
    "index fund",
    "etf",
    "asset mix",
    "risk tolerance",
    "crypto",
];

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortfolioAction {
    Hold,
    Rebalance,
    Diversify,
    ReduceRisk,
    IncreaseRisk,
}

impl PortfolioAction {
    fn label(&self) -> &'static str {
        match self {
            PortfolioAction::Hold => "Hold",
            PortfolioAction::Rebalance => "Rebalance",
            PortfolioAction::Diversify => "Diversify",
            PortfolioAction::ReduceRisk => "Reduce risk",
            PortfolioAction::IncreaseRisk => "Increase risk",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortfolioAnalysis {
    pub risk_profile: RiskProfile,
    pub action: PortfolioAction,
    /// Asset class -> percent of portfolio.
    pub target_allocation: BTreeMap<String, f64>,
    pub diversification_score: f64,
    #[serde(default)]
    pub action_items: Vec<String>,
    pub summary: String,
}

impl PortfolioAnalysis {
    pub fn check(&self) -> Result<(), SchemaValidationError> {
        if self.target_allocation.is_empty() {
            return Err(SchemaValidationError::new(
                KIND.as_str(),
                "target_allocation is empty",
            ));
        }
        for (class, pct) in &self.target_allocation {
            check_range(KIND, &format!("target_allocation.{}", class), *pct, 0.0, 100.0)?;
        }
        let total: f64 = self.target_allocation.values().sum();
        if (total - 100.0).abs() > ALLOCATION_TOLERANCE {
            return Err(SchemaValidationError::new(
                KIND.as_str(),
                format!("target_allocation sums to {:.1}, expected 100", total),
            ));
        }
        check_range(
            KIND,
            "diversification_score",
            self.diversification_score,
            0.0,
            100.0,
        )?;
        check_summary(KIND, &self.summary)
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n\n", self.summary.trim());
        out.push_str(&format!(
            "**Recommended action:** {} ({:?} profile)\n",
            self.action.label(),
            self.risk_profile
        ));
        out.push_str(&format!(
            "**Diversification score:** {:.0}/100\n",
            self.diversification_score
        ));
        out.push_str("\n**Target allocation:**\n");
        for (class, pct) in &self.target_allocation {
            out.push_str(&format!("- {}: {:.0}%\n", class, pct));
        }
        if !self.action_items.is_empty() {
            out.push_str("\n**Next steps:**\n");
            for item in &self.action_items {
                out.push_str(&format!("- {}\n", item));
            }
        }
        out.trim_end().to_string()
    }
}

pub struct PortfolioOrchestrator;

impl DomainOrchestrator for PortfolioOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        KIND
    }

    fn keywords(&self) -> &'static [&'static str] {
        PORTFOLIO_KEYWORDS
    }

    fn is_applicable(&self, context: &FinancialContext) -> bool {
        !context.assets.is_empty()
    }

    fn system_prompt(&self) -> &'static str {
        "You are a portfolio strategist. Judge the user's current holdings \
         against their goals and horizon, propose a target allocation that sums \
         to 100 percent, and answer only with the requested JSON."
    }

    fn build_prompt(&self, context: &FinancialContext, message: &str) -> String {
        let task = format!(
            "Review an allocation of {} holdings and recommend a target mix.",
            context.assets.len()
        );
        structured_prompt(
            &task,
            context,
            message,
            r#"{
  "risk_profile": "conservative" | "moderate" | "aggressive",
  "action": "hold" | "rebalance" | "diversify" | "reduce_risk" | "increase_risk",
  "target_allocation": {"asset class": percent, ...} summing to 100,
  "diversification_score": number 0-100,
  "action_items": [short steps],
  "summary": string
}"#,
        )
    }

    fn temperature(&self) -> f32 {
        0.3
    }

    fn validate(&self, value: &Value) -> Result<String, SchemaValidationError> {
        let analysis: PortfolioAnalysis = decode(KIND, value)?;
        analysis.check()?;
        Ok(analysis.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrators::fixtures::context_with;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "risk_profile": "moderate",
            "action": "rebalance",
            "target_allocation": {"us_equity": 55, "intl_equity": 15, "bonds": 25, "cash": 5},
            "diversification_score": 64,
            "summary": "You are overweight in a single tech fund; trimming it back to a broad index mix lowers concentration risk."
        })
    }

    #[test]
    fn test_valid_analysis_renders() {
        let answer = PortfolioOrchestrator.validate(&valid()).unwrap();
        assert!(answer.contains("Rebalance"));
        assert!(answer.contains("bonds: 25%"));
    }

    #[test]
    fn test_allocation_must_sum_to_100() {
        let mut value = valid();
        value["target_allocation"]["cash"] = json!(20);
        let err = PortfolioOrchestrator.validate(&value).unwrap_err();
        assert!(err.reason.contains("sums to"));
    }

    #[test]
    fn test_small_rounding_drift_is_accepted() {
        let mut value = valid();
        value["target_allocation"] = json!({"equity": 66.7, "bonds": 33.3, "cash": 0.5});
        assert!(PortfolioOrchestrator.validate(&value).is_ok());
    }

    #[test]
    fn test_score_bound() {
        let mut value = valid();
        value["diversification_score"] = json!(140);
        assert!(PortfolioOrchestrator.validate(&value).is_err());
    }

    #[test]
    fn test_requires_assets() {
        assert!(!PortfolioOrchestrator.is_applicable(&context_with(2, 0)));
        assert!(PortfolioOrchestrator.is_applicable(&context_with(0, 1)));
    }
}
