//! Tax strategy analysis

use super::{check_range, check_summary, decode, money, structured_prompt, DomainOrchestrator};
use crate::error::SchemaValidationError;
use crate::models::{FinancialContext, OrchestratorKind};
use serde::Deserialize;
use serde_json::Value;

const KIND: OrchestratorKind = OrchestratorKind::Tax;

const TAX_KEYWORDS: &[&str] = &[
    "tax",
    "deduction",
    "deductible",
    "write-off",
    "capital gains",
    "harvest",
    "roth conversion",
    "withholding",
    "refund",
    "bracket",
    "itemize",
    "hsa",
];

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaxRecommendation {
    MaximizeRetirementContributions,
    TaxLossHarvesting,
    RothConversion,
    ItemizeDeductions,
    AdjustWithholding,
    NoChange,
}

impl TaxRecommendation {
    fn label(&self) -> &'static str {
        match self {
            TaxRecommendation::MaximizeRetirementContributions => {
                "Maximize pre-tax retirement contributions"
            }
            TaxRecommendation::TaxLossHarvesting => "Harvest investment losses",
            TaxRecommendation::RothConversion => "Consider a Roth conversion",
            TaxRecommendation::ItemizeDeductions => "Itemize deductions",
            TaxRecommendation::AdjustWithholding => "Adjust your withholding",
            TaxRecommendation::NoChange => "No change needed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaxAnalysis {
    pub recommendation: TaxRecommendation,
    pub estimated_annual_savings: f64,
    /// Percent, when the model could estimate it.
    #[serde(default)]
    pub effective_rate_estimate: Option<f64>,
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default)]
    pub caveats: Vec<String>,
    pub summary: String,
}

impl TaxAnalysis {
    pub fn check(&self) -> Result<(), SchemaValidationError> {
        check_range(
            KIND,
            "estimated_annual_savings",
            self.estimated_annual_savings,
            0.0,
            1_000_000.0,
        )?;
        if let Some(rate) = self.effective_rate_estimate {
            check_range(KIND, "effective_rate_estimate", rate, 0.0, 60.0)?;
        }
        check_summary(KIND, &self.summary)
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n\n", self.summary.trim());
        out.push_str(&format!(
            "**Recommendation:** {}\n",
            self.recommendation.label()
        ));
        out.push_str(&format!(
            "**Estimated annual savings:** {}\n",
            money(self.estimated_annual_savings)
        ));
        if let Some(rate) = self.effective_rate_estimate {
            out.push_str(&format!("**Estimated effective rate:** {:.1}%\n", rate));
        }
        if !self.strategies.is_empty() {
            out.push_str("\n**Strategies:**\n");
            for s in &self.strategies {
                out.push_str(&format!("- {}\n", s));
            }
        }
        if !self.caveats.is_empty() {
            out.push_str("\n**Keep in mind:**\n");
            for c in &self.caveats {
                out.push_str(&format!("- {}\n", c));
            }
        }
        out.trim_end().to_string()
    }
}

pub struct TaxOrchestrator;

impl DomainOrchestrator for TaxOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        KIND
    }

    fn keywords(&self) -> &'static [&'static str] {
        TAX_KEYWORDS
    }

    fn system_prompt(&self) -> &'static str {
        "You are a tax planning analyst for individuals. Suggest legal, \
         mainstream strategies grounded in the user's income and accounts, flag \
         anything that needs a licensed professional, and answer only with the \
         requested JSON."
    }

    fn build_prompt(&self, context: &FinancialContext, message: &str) -> String {
        let task = format!(
            "Assess tax-saving opportunities for a household earning about {} per year.",
            money(context.income.net_monthly * 12.0)
        );
        structured_prompt(
            &task,
            context,
            message,
            r#"{
  "recommendation": "maximize_retirement_contributions" | "tax_loss_harvesting" | "roth_conversion" | "itemize_deductions" | "adjust_withholding" | "no_change",
  "estimated_annual_savings": number 0-1000000,
  "effective_rate_estimate": number 0-60 or null,
  "strategies": [short strings],
  "caveats": [short strings],
  "summary": string
}"#,
        )
    }

    fn temperature(&self) -> f32 {
        0.2
    }

    fn validate(&self, value: &Value) -> Result<String, SchemaValidationError> {
        let analysis: TaxAnalysis = decode(KIND, value)?;
        analysis.check()?;
        Ok(analysis.render())
    }
}
