//! Complexity Router
//!
//! Decides whether a query stays on the fast model or escalates to the top
//! tier. Pure and deterministic: the decision depends only on the
//! [`ComplexitySignals`] passed in.
//!
//! Rules are evaluated in priority order and the first one that fires
//! supplies the reason.

use crate::models::{ComplexitySignals, RouteDecision, RouteTier};

/// Static keyword tables, zero allocation
const MULTI_YEAR_PHRASES: &[&str] = &[
    "decade",
    "long-term plan",
    "long term plan",
    "years from now",
    "lifetime",
];

const INVEST_VS_PAYOFF_PHRASES: &[&str] = &[
    "invest or pay",
    "pay off or invest",
    "payoff or invest",
    "invest instead of paying",
    "invest vs pay",
    "invest versus pay",
    "pay down debt or invest",
    "pay off debt or invest",
    "invest or pay off",
    "extra payments or invest",
    "pay off my mortgage early or invest",
];

const TAX_KEYWORDS: &[&str] = &[
    "tax strategy",
    "tax planning",
    "tax-loss",
    "tax loss harvesting",
    "capital gains",
    "roth conversion",
    "deduction",
    "tax bracket",
    "minimize taxes",
    "reduce my taxes",
    "tax efficient",
    "tax-efficient",
    "write-off",
];

const RETIREMENT_KEYWORDS: &[&str] = &[
    "retire",
    "retirement",
    "401(k)",
    "pension",
    "social security",
    "nest egg",
    "fire movement",
];

/// Short account names, matched as whole words only ("ira" is not "spiraling").
const RETIREMENT_WORDS: &[&str] = &["ira", "iras", "401k", "403b", "457b"];

const PORTFOLIO_KEYWORDS: &[&str] = &[
    "portfolio",
    "asset allocation",
    "allocation",
    "rebalance",
    "rebalancing",
    "diversify",
    "diversification",
    "stocks and bonds",
    "index fund",
];

const SCENARIO_MARKERS: &[&str] = &[
    "option 1",
    "option 2",
    "option 3",
    "option a",
    "option b",
    "scenario 1",
    "scenario 2",
    "scenario a",
    "scenario b",
    "plan a",
    "plan b",
    "alternatively",
];

/// Any of these implies at least two scenarios are on the table.
const SCENARIO_PAIRINGS: &[&str] = &[" or ", " versus ", " vs ", " vs. "];

const OPTIMIZATION_KEYWORDS: &[&str] = &[
    "optimize",
    "optimise",
    "maximize",
    "maximise",
    "minimize",
    "minimise",
    "best way",
    "most efficient",
    "fastest way",
];

const LONG_MESSAGE_CHARS: usize = 220;
const LARGE_CONTEXT_TOKENS: usize = 2000;
const DEBT_COUNT_ESCALATION: usize = 3;

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

fn contains_word(text: &str, words: &[&str]) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| words.contains(&token))
}

/// Does the text mention an N-year horizon with N >= 2 ("10-year", "5 years")?
fn mentions_multi_year_number(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        // Skip digits that are the tail of a word such as "401k".
        if start > 0 && bytes[start - 1].is_ascii_alphabetic() {
            continue;
        }

        let years: u32 = text[start..i].parse().unwrap_or(0);
        let rest = &text[i..];
        let rest = rest
            .strip_prefix('-')
            .or_else(|| rest.strip_prefix(' '))
            .unwrap_or(rest);

        if years >= 2 && (rest.starts_with("year") || rest.starts_with("yr")) {
            return true;
        }
    }

    false
}

fn mentions_multi_year(text: &str) -> bool {
    contains_any(text, MULTI_YEAR_PHRASES) || mentions_multi_year_number(text)
}

/// Distinct scenario markers, floored at 2 when a pairing word appears.
fn scenario_count(text: &str) -> usize {
    let markers = SCENARIO_MARKERS
        .iter()
        .filter(|marker| text.contains(**marker))
        .count();

    if contains_any(text, SCENARIO_PAIRINGS) {
        markers.max(2)
    } else {
        markers
    }
}

/// Evaluate the escalation rules in priority order.
///
/// Returns the reason of the first rule that fires, or `None`.
fn first_escalation_reason(signals: &ComplexitySignals) -> Option<String> {
    let text = signals.message.to_lowercase();
    let has_financial_data = signals.debts_count > 0 || signals.assets_count > 0;

    if mentions_multi_year(&text) {
        return Some("Multi-year planning horizon detected (long-range projection)".to_string());
    }

    if signals.debts_count >= DEBT_COUNT_ESCALATION {
        return Some(format!(
            "User has {} debts (auto-escalated for complex liability structure)",
            signals.debts_count
        ));
    }

    if contains_any(&text, INVEST_VS_PAYOFF_PHRASES) {
        return Some("Invest-vs-payoff tradeoff requires comparative analysis".to_string());
    }

    if contains_any(&text, TAX_KEYWORDS) {
        return Some("Tax strategy question".to_string());
    }

    if contains_any(&text, RETIREMENT_KEYWORDS) || contains_word(&text, RETIREMENT_WORDS) {
        return Some("Retirement planning question".to_string());
    }

    if contains_any(&text, PORTFOLIO_KEYWORDS) && signals.assets_count > 0 {
        return Some(format!(
            "Portfolio allocation question across {} assets",
            signals.assets_count
        ));
    }

    let scenarios = scenario_count(&text);
    if scenarios >= 2 {
        return Some(format!("Compares {} scenarios", scenarios));
    }

    if contains_any(&text, OPTIMIZATION_KEYWORDS) && has_financial_data {
        return Some("Optimization request over existing debts or assets".to_string());
    }

    if signals.message_length > LONG_MESSAGE_CHARS && has_financial_data {
        return Some(format!(
            "Detailed question ({} chars) with financial data",
            signals.message_length
        ));
    }

    if signals.context_tokens > LARGE_CONTEXT_TOKENS {
        return Some(format!(
            "Large financial context (~{} tokens)",
            signals.context_tokens
        ));
    }

    None
}

pub fn should_escalate(signals: &ComplexitySignals) -> bool {
    first_escalation_reason(signals).is_some()
}

pub fn route_to_model(signals: &ComplexitySignals) -> RouteTier {
    if should_escalate(signals) {
        RouteTier::Top
    } else {
        RouteTier::Fast
    }
}

pub fn routing_reason(signals: &ComplexitySignals) -> String {
    first_escalation_reason(signals)
        .unwrap_or_else(|| "Simple query handled by fast model".to_string())
}

/// Tier plus reason in one evaluation.
pub fn decide(signals: &ComplexitySignals) -> RouteDecision {
    match first_escalation_reason(signals) {
        Some(reason) => RouteDecision {
            tier: RouteTier::Top,
            reason: Some(reason),
        },
        None => RouteDecision {
            tier: RouteTier::Fast,
            reason: None,
        },
    }
}
