//! System prompt for generic advice turns

use crate::context::context_json;
use crate::models::FinancialContext;

const BASE_PROMPT: &str = r#"You are a professional financial advisor and analyst.

Guidelines:
- Provide accurate and educational financial information
- Ground every recommendation in the user's own numbers below
- Be structured and concise
- Show the arithmetic when comparing options
- Emphasize risk awareness and suggest a licensed professional for legal or tax filings
- Never invent accounts, debts, or balances that are not in the data

Format: Provide structured answers suitable for financial decision-making."#;

/// Build the system prompt with the user's financial snapshot attached.
pub fn build_system_prompt(context: &FinancialContext) -> String {
    let greeting = context
        .display_name
        .as_deref()
        .map(|name| format!("\n\nYou are speaking with {}.", name))
        .unwrap_or_default();

    format!(
        "{}{}\n\nUser financial data (JSON):\n{}",
        BASE_PROMPT,
        greeting,
        context_json(context)
    )
}
