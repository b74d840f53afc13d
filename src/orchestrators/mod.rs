//! Domain orchestrators
//!
//! Each orchestrator asks the selected model for a strictly shaped JSON
//! analysis, extracts it from the reply, and validates it against its
//! schema. Validation failure is recoverable: the advice service falls back
//! to a generic chat answer.

use crate::context::context_json;
use crate::error::{OrchestrationError, SchemaValidationError};
use crate::llm::{ChatRequest, ModelClient};
use crate::models::{AIResponse, ChatMessage, FinancialContext, OrchestratorKind};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod debt;
pub mod extract;
pub mod portfolio;
pub mod retirement;
pub mod tax;

pub use debt::DebtOrchestrator;
pub use portfolio::PortfolioOrchestrator;
pub use retirement::RetirementOrchestrator;
pub use tax::TaxOrchestrator;

/// Minimum length of the natural-language summary every schema requires.
pub const MIN_SUMMARY_CHARS: usize = 50;

const STRUCTURED_MAX_TOKENS: u32 = 2048;

pub trait DomainOrchestrator: Send + Sync {
    fn kind(&self) -> OrchestratorKind;

    /// Lowercase keywords scored by the dispatcher.
    fn keywords(&self) -> &'static [&'static str];

    /// Whether the user's data makes this analysis meaningful.
    fn is_applicable(&self, _context: &FinancialContext) -> bool {
        true
    }

    fn system_prompt(&self) -> &'static str;

    fn build_prompt(&self, context: &FinancialContext, message: &str) -> String;

    fn temperature(&self) -> f32 {
        0.2
    }

    /// Check `value` against the schema and render the presentable answer.
    fn validate(&self, value: &Value) -> Result<String, SchemaValidationError>;
}

/// The four orchestrators in dispatch tie-break order.
#[derive(Clone)]
pub struct OrchestratorSet {
    orchestrators: Vec<Arc<dyn DomainOrchestrator>>,
}

impl OrchestratorSet {
    pub fn standard() -> Self {
        Self {
            orchestrators: vec![
                Arc::new(DebtOrchestrator),
                Arc::new(TaxOrchestrator),
                Arc::new(RetirementOrchestrator),
                Arc::new(PortfolioOrchestrator),
            ],
        }
    }

    pub fn get(&self, kind: OrchestratorKind) -> Option<Arc<dyn DomainOrchestrator>> {
        self.orchestrators.iter().find(|o| o.kind() == kind).cloned()
    }

    /// Highest keyword score among applicable orchestrators; ties go to the
    /// earlier one. `None` when nothing scores.
    pub fn select(
        &self,
        message: &str,
        context: &FinancialContext,
    ) -> Option<Arc<dyn DomainOrchestrator>> {
        let text = message.to_lowercase();
        let mut best: Option<(usize, &Arc<dyn DomainOrchestrator>)> = None;

        for orchestrator in &self.orchestrators {
            let score = orchestrator
                .keywords()
                .iter()
                .filter(|kw| text.contains(**kw))
                .count();

            if score == 0 || !orchestrator.is_applicable(context) {
                continue;
            }
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, orchestrator));
            }
        }

        let selected = best.map(|(_, o)| o.clone());
        debug!(orchestrator = ?selected.as_ref().map(|o| o.kind()), "orchestrator dispatch");
        selected
    }
}

impl Default for OrchestratorSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// A validated structured analysis.
#[derive(Debug, Clone)]
pub struct StructuredResult {
    pub kind: OrchestratorKind,
    /// The validated JSON exactly as the model produced it.
    pub data: Value,
    pub answer: String,
    pub response: AIResponse,
}

/// Why a structured run did not produce a result, plus any tokens it spent.
#[derive(Debug)]
pub struct StructuredFailure {
    pub error: OrchestrationError,
    pub spent: Option<AIResponse>,
}

pub async fn run_structured(
    orchestrator: &dyn DomainOrchestrator,
    client: &dyn ModelClient,
    context: &FinancialContext,
    message: &str,
) -> Result<StructuredResult, StructuredFailure> {
    let kind = orchestrator.kind();
    let request = ChatRequest::new(vec![ChatMessage::user(
        orchestrator.build_prompt(context, message),
    )])
    .with_system_prompt(orchestrator.system_prompt())
    .with_temperature(orchestrator.temperature())
    .with_max_tokens(STRUCTURED_MAX_TOKENS);

    info!(orchestrator = %kind, model = %client.access(), "running structured analysis");

    let response = client.send_chat(&request).await.map_err(|e| StructuredFailure {
        error: e.into(),
        spent: None,
    })?;

    let validated = extract::extract_json(&response.text)
        .ok_or_else(|| SchemaValidationError::new(kind.as_str(), "no JSON object in model reply"))
        .and_then(|value| orchestrator.validate(&value).map(|answer| (value, answer)));

    match validated {
        Ok((data, answer)) => Ok(StructuredResult {
            kind,
            data,
            answer,
            response,
        }),
        Err(error) => {
            warn!(orchestrator = %kind, reason = %error.reason, "structured output rejected");
            Err(StructuredFailure {
                error: error.into(),
                spent: Some(response),
            })
        }
    }
}

//
// ================= Schema helpers =================
//

pub(crate) fn decode<T: DeserializeOwned>(
    kind: OrchestratorKind,
    value: &Value,
) -> Result<T, SchemaValidationError> {
    serde_json::from_value(value.clone())
        .map_err(|e| SchemaValidationError::new(kind.as_str(), e.to_string()))
}

pub(crate) fn check_summary(kind: OrchestratorKind, summary: &str) -> Result<(), SchemaValidationError> {
    let len = summary.trim().chars().count();
    if len < MIN_SUMMARY_CHARS {
        return Err(SchemaValidationError::new(
            kind.as_str(),
            format!("summary has {} chars, need at least {}", len, MIN_SUMMARY_CHARS),
        ));
    }
    Ok(())
}

pub(crate) fn check_range(
    kind: OrchestratorKind,
    field: &str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), SchemaValidationError> {
    if !value.is_finite() || value < min || value > max {
        return Err(SchemaValidationError::new(
            kind.as_str(),
            format!("{} = {} outside [{}, {}]", field, value, min, max),
        ));
    }
    Ok(())
}

/// Shared prompt skeleton: task, user question, data, and the JSON contract.
pub(crate) fn structured_prompt(
    task: &str,
    context: &FinancialContext,
    message: &str,
    schema: &str,
) -> String {
    format!(
        "{task}\n\nUser question:\n{message}\n\nFinancial data (JSON):\n{data}\n\n\
         Respond with a single JSON object inside a ```json code block, matching:\n{schema}\n\
         The \"summary\" must be at least {min} characters of plain language.",
        task = task,
        message = message,
        data = context_json(context),
        schema = schema,
        min = MIN_SUMMARY_CHARS,
    )
}

pub(crate) fn money(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let whole = (cents / 100).abs();
    let digits = whole.to_string();

    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if cents < 0 { "-" } else { "" };
    format!("{}${}.{:02}", sign, grouped, (cents % 100).abs())
}


#[cfg(test)]
mod tests {
    use super::fixtures::context_with;
    use super::*;
    use crate::error::AiErrorKind;
    use crate::llm::testing::{Scripted, ScriptedModel};
    use crate::models::ModelAccess;
    use serde_json::json;

    #[test]
    fn test_dispatch_by_keywords() {
        let set = OrchestratorSet::standard();
        let ctx = context_with(2, 2);

        let pick = |m: &str| set.select(m, &ctx).map(|o| o.kind());
        assert_eq!(pick("Create a 10-year retirement plan"), Some(OrchestratorKind::Retirement));
        assert_eq!(pick("Avalanche or snowball for my credit card debt?"), Some(OrchestratorKind::Debt));
        assert_eq!(pick("How do I lower my tax bill with deductions?"), Some(OrchestratorKind::Tax));
        assert_eq!(pick("Should I rebalance my portfolio?"), Some(OrchestratorKind::Portfolio));
        assert_eq!(pick("What's the weather like?"), None);
    }

    #[test]
    fn test_dispatch_respects_applicability() {
        let set = OrchestratorSet::standard();
        let no_debts = context_with(0, 0);
        assert!(set.select("pay off my credit card debt", &no_debts).is_none());
        assert!(set.select("rebalance my portfolio", &no_debts).is_none());
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(1234567.891), "$1,234,567.89");
        assert_eq!(money(12.5), "$12.50");
        assert_eq!(money(0.0), "$0.00");
    }

    #[tokio::test]
    async fn test_valid_output_round_trips_unchanged() {
        let data = json!({
            "strategy": "avalanche",
            "payoff_months": 28,
            "total_interest": 1830.5,
            "recommended_monthly_payment": 600,
            "priority_order": ["Card 2", "Card 1"],
            "action_items": ["Pay $600/month"],
            "summary": "Pay the 19% card first, then roll its payment into the 18% card to be debt-free in 28 months.",
            "extra_field_from_model": {"kept": true}
        });
        let reply = format!("Here is the plan:\n```json\n{}\n```", data);
        let model = ScriptedModel::replying(ModelAccess::Cfo, &[&reply]);

        let result = run_structured(&DebtOrchestrator, &model, &context_with(2, 0), "avalanche?")
            .await
            .unwrap();

        assert_eq!(result.data, data);
        assert_eq!(result.kind, OrchestratorKind::Debt);
        assert!(result.answer.contains("28 months"));

        let request = &model.requests.lock().await[0];
        assert!(request.temperature <= 0.3);
    }

    #[tokio::test]
    async fn test_invalid_output_reports_spent_tokens() {
        let model = ScriptedModel::replying(
            ModelAccess::Cfo,
            &["```json\n{\"strategy\": \"yolo\", \"summary\": \"short\"}\n```"],
        );

        let failure = run_structured(&DebtOrchestrator, &model, &context_with(1, 0), "help")
            .await
            .unwrap_err();

        assert!(matches!(failure.error, OrchestrationError::SchemaValidation(_)));
        assert!(failure.spent.is_some());
    }

    #[tokio::test]
    async fn test_model_failure_has_no_spend() {
        let model = ScriptedModel::new(ModelAccess::Cfo, vec![Scripted::Fail(AiErrorKind::Timeout)]);
        let failure = run_structured(&TaxOrchestrator, &model, &context_with(0, 0), "taxes")
            .await
            .unwrap_err();
        assert!(matches!(failure.error, OrchestrationError::Model(_)));
        assert!(failure.spent.is_none());
    }
}
