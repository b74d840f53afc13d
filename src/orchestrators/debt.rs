//! Debt payoff analysis

use super::{check_range, check_summary, decode, money, structured_prompt, DomainOrchestrator};
use crate::error::SchemaValidationError;
use crate::models::{FinancialContext, OrchestratorKind};
use serde::Deserialize;
use serde_json::Value;

const KIND: OrchestratorKind = OrchestratorKind::Debt;

/// Longest payoff horizon accepted (50 years).
pub const MAX_PAYOFF_MONTHS: u32 = 600;

const DEBT_KEYWORDS: &[&str] = &[
    "debt",
    "credit card",
    "loan",
    "pay off",
    "payoff",
    "avalanche",
    "snowball",
    "consolidat",
    "refinanc",
    "balance transfer",
    "interest",
    "minimum payment",
];

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DebtStrategy {
    Avalanche,
    Snowball,
    Consolidation,
    Refinance,
    Hybrid,
}

impl DebtStrategy {
    fn label(&self) -> &'static str {
        match self {
            DebtStrategy::Avalanche => "Avalanche (highest APR first)",
            DebtStrategy::Snowball => "Snowball (smallest balance first)",
            DebtStrategy::Consolidation => "Consolidation",
            DebtStrategy::Refinance => "Refinance",
            DebtStrategy::Hybrid => "Hybrid",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebtAnalysis {
    pub strategy: DebtStrategy,
    pub payoff_months: u32,
    pub total_interest: f64,
    pub recommended_monthly_payment: f64,
    #[serde(default)]
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    pub summary: String,
}

impl DebtAnalysis {
    pub fn check(&self) -> Result<(), SchemaValidationError> {
        if self.payoff_months == 0 || self.payoff_months > MAX_PAYOFF_MONTHS {
            return Err(SchemaValidationError::new(
                KIND.as_str(),
                format!(
                    "payoff_months = {} outside [1, {}]",
                    self.payoff_months, MAX_PAYOFF_MONTHS
                ),
            ));
        }
        check_range(KIND, "total_interest", self.total_interest, 0.0, 10_000_000.0)?;
        check_range(
            KIND,
            "recommended_monthly_payment",
            self.recommended_monthly_payment,
            0.0,
            1_000_000.0,
        )?;
        check_summary(KIND, &self.summary)
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n\n", self.summary.trim());
        out.push_str(&format!("**Strategy:** {}\n", self.strategy.label()));
        out.push_str(&format!(
            "**Debt-free in:** {} months at {} per month\n",
            self.payoff_months,
            money(self.recommended_monthly_payment)
        ));
        out.push_str(&format!(
            "**Projected interest:** {}\n",
            money(self.total_interest)
        ));

        if !self.priority_order.is_empty() {
            out.push_str("\n**Payoff order:**\n");
            for (i, name) in self.priority_order.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, name));
            }
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

pub struct DebtOrchestrator;

impl DomainOrchestrator for DebtOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        KIND
    }

    fn keywords(&self) -> &'static [&'static str] {
        DEBT_KEYWORDS
    }

    fn is_applicable(&self, context: &FinancialContext) -> bool {
        !context.debts.is_empty()
    }

    fn system_prompt(&self) -> &'static str {
        "You are a debt-reduction specialist. Compare avalanche, snowball, \
         consolidation and refinancing against the user's actual balances, APRs \
         and cash flow. Never invent debts that are not in the data. Answer only \
         with the requested JSON."
    }

    fn build_prompt(&self, context: &FinancialContext, message: &str) -> String {
        let surplus = context.income.net_monthly - context.expenses.monthly_total;
        let task = format!(
            "Build a payoff plan for {} debts totalling {} with a monthly surplus of about {}.",
            context.debts.len(),
            money(context.total_debt()),
            money(surplus.max(0.0))
        );
        structured_prompt(
            &task,
            context,
            message,
            r#"{
  "strategy": "avalanche" | "snowball" | "consolidation" | "refinance" | "hybrid",
  "payoff_months": integer 1-600,
  "total_interest": number,
  "recommended_monthly_payment": number,
  "priority_order": [debt names, first to pay],
  "action_items": [short steps],
  "summary": string
}"#,
        )
    }

    fn temperature(&self) -> f32 {
        0.2
    }

    fn validate(&self, value: &Value) -> Result<String, SchemaValidationError> {
        let analysis: DebtAnalysis = decode(KIND, value)?;
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
            "strategy": "snowball",
            "payoff_months": 36,
            "total_interest": 2400.0,
            "recommended_monthly_payment": 450.0,
            "priority_order": ["Store card", "Visa"],
            "summary": "Clear the small store card first for a quick win, then focus every spare dollar on the Visa."
        })
    }

    #[test]
    fn test_valid_analysis_renders() {
        let answer = DebtOrchestrator.validate(&valid()).unwrap();
        assert!(answer.contains("Snowball"));
        assert!(answer.contains("36 months"));
        assert!(answer.contains("1. Store card"));
    }

    #[test]
    fn test_payoff_horizon_bound() {
        let mut value = valid();
        value["payoff_months"] = json!(601);
        let err = DebtOrchestrator.validate(&value).unwrap_err();
        assert!(err.reason.contains("payoff_months"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut value = valid();
        value["strategy"] = json!("ignore_it");
        assert!(DebtOrchestrator.validate(&value).is_err());
    }

    #[test]
    fn test_short_summary_rejected() {
        let mut value = valid();
        value["summary"] = json!("Pay it off.");
        let err = DebtOrchestrator.validate(&value).unwrap_err();
        assert!(err.reason.contains("summary"));
    }

    #[test]
    fn test_prompt_mentions_totals() {
        let prompt = DebtOrchestrator.build_prompt(&context_with(2, 0), "which first?");
        assert!(prompt.contains("2 debts"));
        assert!(prompt.contains("$7,500.00"));
        assert!(prompt.contains("which first?"));
    }

    #[test]
    fn test_requires_debts() {
        assert!(!DebtOrchestrator.is_applicable(&context_with(0, 3)));
        assert!(DebtOrchestrator.is_applicable(&context_with(1, 0)));
    }
}
