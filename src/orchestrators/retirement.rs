//! Retirement readiness analysis

use super::{check_range, check_summary, decode, money, structured_prompt, DomainOrchestrator};
use crate::error::SchemaValidationError;
use crate::models::{FinancialContext, OrchestratorKind};
use serde::Deserialize;
use serde_json::Value;

const KIND: OrchestratorKind = OrchestratorKind::Retirement;

pub const MAX_YEARS_TO_RETIREMENT: u32 = 70;

const RETIREMENT_KEYWORDS: &[&str] = &[
    "retire",
    "retirement",
    "401k",
    "401(k)",
    "403b",
    " ira",
    "roth ira",
    "pension",
    "social security",
    "nest egg",
    "withdrawal rate",
];

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ahead,
    OnTrack,
    SlightlyBehind,
    SignificantlyBehind,
}

impl Readiness {
    fn label(&self) -> &'static str {
        match self {
            Readiness::Ahead => "Ahead of schedule",
            Readiness::OnTrack => "On track",
            Readiness::SlightlyBehind => "Slightly behind",
            Readiness::SignificantlyBehind => "Significantly behind",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetirementAnalysis {
    pub readiness: Readiness,
    pub years_to_retirement: u32,
    pub projected_nest_egg: f64,
    pub recommended_monthly_contribution: f64,
    /// Percent of the nest egg withdrawn per year.
    pub safe_withdrawal_rate: f64,
    #[serde(default)]
    pub action_items: Vec<String>,
    pub summary: String,
}

impl RetirementAnalysis {
    pub fn check(&self) -> Result<(), SchemaValidationError> {
        if self.years_to_retirement > MAX_YEARS_TO_RETIREMENT {
            return Err(SchemaValidationError::new(
                KIND.as_str(),
                format!(
                    "years_to_retirement = {} exceeds {}",
                    self.years_to_retirement, MAX_YEARS_TO_RETIREMENT
                ),
            ));
        }
        check_range(
            KIND,
            "projected_nest_egg",
            self.projected_nest_egg,
            0.0,
            1_000_000_000.0,
        )?;
        check_range(
            KIND,
            "recommended_monthly_contribution",
            self.recommended_monthly_contribution,
            0.0,
            1_000_000.0,
        )?;
        check_range(
            KIND,
            "safe_withdrawal_rate",
            self.safe_withdrawal_rate,
            0.0,
            20.0,
        )?;
        check_summary(KIND, &self.summary)
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}\n\n", self.summary.trim());
        out.push_str(&format!("**Readiness:** {}\n", self.readiness.label()));
        out.push_str(&format!(
            "**Years to retirement:** {}\n",
            self.years_to_retirement
        ));
        out.push_str(&format!(
            "**Projected nest egg:** {}\n",
            money(self.projected_nest_egg)
        ));
        out.push_str(&format!(
            "**Suggested contribution:** {} per month\n",
            money(self.recommended_monthly_contribution)
        ));
        out.push_str(&format!(
            "**Sustainable withdrawal rate:** {:.1}%\n",
            self.safe_withdrawal_rate
        ));
        if !self.action_items.is_empty() {
            out.push_str("\n**Next steps:**\n");
            for item in &self.action_items {
                out.push_str(&format!("- {}\n", item));
            }
        }
        out.trim_end().to_string()
    }
}

pub struct RetirementOrchestrator;

impl DomainOrchestrator for RetirementOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        KIND
    }

    fn keywords(&self) -> &'static [&'static str] {
        RETIREMENT_KEYWORDS
    }

    fn system_prompt(&self) -> &'static str {
        "You are a retirement planner. Project readiness from the user's \
         savings, contributions and goals using conservative real returns, \
         state assumptions in the summary, and answer only with the requested \
         JSON."
    }

    fn build_prompt(&self, context: &FinancialContext, message: &str) -> String {
        let task = format!(
            "Evaluate retirement readiness. Current invested and cash assets total {}; \
             {} savings goals are on file.",
            money(context.total_assets()),
            context.goals.len()
        );
        structured_prompt(
            &task,
            context,
            message,
            r#"{
  "readiness": "ahead" | "on_track" | "slightly_behind" | "significantly_behind",
  "years_to_retirement": integer 0-70,
  "projected_nest_egg": number,
  "recommended_monthly_contribution": number,
  "safe_withdrawal_rate": number 0-20 (percent),
  "action_items": [short steps],
  "summary": string
}"#,
        )
    }

    fn temperature(&self) -> f32 {
        0.3
    }

    fn validate(&self, value: &Value) -> Result<String, SchemaValidationError> {
        let analysis: RetirementAnalysis = decode(KIND, value)?;
        analysis.check()?;
        Ok(analysis.render())
    }
}
