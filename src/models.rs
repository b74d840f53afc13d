//! Core data models for the advice orchestrator

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

//
// ================= Model Access =================
//

/// Backend capability classes, declared cheapest/fastest first.
///
/// The derived ordering is the capability (and cost) ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ModelAccess {
    Fast,
    Reasoning,
    Math,
    Cfo,
}

impl ModelAccess {
    pub const ALL: [ModelAccess; 4] = [
        ModelAccess::Fast,
        ModelAccess::Reasoning,
        ModelAccess::Math,
        ModelAccess::Cfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelAccess::Fast => "fast",
            ModelAccess::Reasoning => "reasoning",
            ModelAccess::Math => "math",
            ModelAccess::Cfo => "cfo",
        }
    }

    /// Name shown to end users in notices.
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelAccess::Fast => "Quick Answers",
            ModelAccess::Reasoning => "Deep Reasoning",
            ModelAccess::Math => "Financial Math",
            ModelAccess::Cfo => "CFO-Level",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "fast" => Some(ModelAccess::Fast),
            "reasoning" => Some(ModelAccess::Reasoning),
            "math" => Some(ModelAccess::Math),
            "cfo" => Some(ModelAccess::Cfo),
            _ => None,
        }
    }
}

impl fmt::Display for ModelAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Subscription Tier =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Pro,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Premium => "premium",
        }
    }

    /// The tier a user would upgrade to, if any.
    pub fn next(&self) -> Option<SubscriptionTier> {
        match self {
            SubscriptionTier::Free => Some(SubscriptionTier::Basic),
            SubscriptionTier::Basic => Some(SubscriptionTier::Pro),
            SubscriptionTier::Pro => Some(SubscriptionTier::Premium),
            SubscriptionTier::Premium => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "free" => Some(SubscriptionTier::Free),
            "basic" => Some(SubscriptionTier::Basic),
            "pro" => Some(SubscriptionTier::Pro),
            "premium" => Some(SubscriptionTier::Premium),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Financial Context =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Cash,
    Equity,
    Crypto,
    Bond,
    RealEstate,
    Vehicle,
    Other,
}

impl AssetType {
    /// Lenient mapping from whatever label the storage layer carries.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "cash" | "checking" | "savings" | "money_market" => AssetType::Cash,
            "equity" | "stock" | "stocks" | "etf" | "mutual_fund" | "brokerage" => AssetType::Equity,
            "crypto" | "cryptocurrency" | "bitcoin" => AssetType::Crypto,
            "bond" | "bonds" | "treasury" | "fixed_income" => AssetType::Bond,
            "real_estate" | "property" | "home" | "house" => AssetType::RealEstate,
            "vehicle" | "car" | "auto" => AssetType::Vehicle,
            _ => AssetType::Other,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IncomeSource {
    pub name: String,
    pub monthly_amount: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IncomeSummary {
    pub net_monthly: f64,
    pub sources: Vec<IncomeSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpenseSummary {
    pub monthly_total: f64,
    pub categories: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DebtSummary {
    pub name: String,
    pub balance: f64,
    pub apr: f64,
    pub minimum_payment: f64,
    pub monthly_payment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetSummary {
    pub name: String,
    pub value: f64,
    pub asset_type: AssetType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalSummary {
    pub name: String,
    pub horizon_months: u32,
    pub target: f64,
    pub current: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionSample {
    pub date: Option<NaiveDate>,
    pub description: String,
    pub amount: f64,
    pub category: Option<String>,
}

/// Normalized per-request snapshot of a user's finances.
///
/// Rebuilt for every request and never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialContext {
    pub user_id: Uuid,
    pub display_name: Option<String>,
    pub income: IncomeSummary,
    pub expenses: ExpenseSummary,
    pub debts: Vec<DebtSummary>,
    pub assets: Vec<AssetSummary>,
    pub goals: Vec<GoalSummary>,
    pub recent_transactions: Vec<TransactionSample>,
}

impl FinancialContext {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            display_name: None,
            income: IncomeSummary::default(),
            expenses: ExpenseSummary::default(),
            debts: Vec::new(),
            assets: Vec::new(),
            goals: Vec::new(),
            recent_transactions: Vec::new(),
        }
    }

    pub fn total_debt(&self) -> f64 {
        self.debts.iter().map(|d| d.balance).sum()
    }

    pub fn total_assets(&self) -> f64 {
        self.assets.iter().map(|a| a.value).sum()
    }
}

//
// ================= Routing =================
//

/// Cheap features used to decide escalation without invoking a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexitySignals {
    pub message: String,
    pub message_length: usize,
    pub debts_count: usize,
    pub assets_count: usize,
    pub goals_count: usize,
    pub context_tokens: usize,
}

impl ComplexitySignals {
    pub fn new(message: &str, context: &FinancialContext, context_tokens: usize) -> Self {
        Self {
            message: message.to_string(),
            message_length: message.chars().count(),
            debts_count: context.debts.len(),
            assets_count: context.assets.len(),
            goals_count: context.goals.len(),
            context_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    Fast,
    Top,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteDecision {
    pub tier: RouteTier,
    pub reason: Option<String>,
}

impl RouteDecision {
    pub fn escalated(&self) -> bool {
        self.tier == RouteTier::Top
    }
}

//
// ================= Chat =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A function the model may ask to invoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// A tool invocation requested by a backend, arguments already coerced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Uniform result of a chat call, whichever backend served it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AIResponse {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub backend: ModelAccess,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

//
// ================= Orchestrators =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorKind {
    Debt,
    Tax,
    Retirement,
    Portfolio,
}

impl OrchestratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorKind::Debt => "debt",
            OrchestratorKind::Tax => "tax",
            OrchestratorKind::Retirement => "retirement",
            OrchestratorKind::Portfolio => "portfolio",
        }
    }
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Final Result =================
//

/// Response contract shared by the generic and structured paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdviceResponse {
    pub answer: String,
    pub model_used: ModelAccess,
    pub model_id: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_used: Option<OrchestratorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}
