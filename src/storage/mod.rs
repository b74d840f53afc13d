//! Storage collaborator interfaces
//!
//! The orchestrator never owns domain entities or usage counters. It reads
//! them through [`FinancialDataSource`] and asks a [`UsageLedger`] to count
//! and log completed queries.

use crate::models::{ModelAccess, SubscriptionTier};
use crate::Result;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgUsageLedger;

//
// ================= Raw Records =================
//
// Amounts arrive exactly as stored (free-form strings such as "$1,250.00").
// The context builder is responsible for best-effort parsing.
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomeSourceRecord {
    pub name: String,
    pub monthly_amount: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub monthly_income: Option<String>,
    pub monthly_expenses: Option<String>,
    #[serde(default)]
    pub income_sources: Vec<IncomeSourceRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpenseCategoryRecord {
    pub category: String,
    pub monthly_amount: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebtRecord {
    pub name: String,
    pub balance: Option<String>,
    pub apr: Option<String>,
    pub minimum_payment: Option<String>,
    pub monthly_payment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetRecord {
    pub name: String,
    pub value: Option<String>,
    pub asset_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalRecord {
    pub name: String,
    pub target_amount: Option<String>,
    pub current_amount: Option<String>,
    pub target_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub date: Option<NaiveDate>,
    pub description: String,
    pub amount: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

//
// ================= Subscription & Usage =================
//

/// Combined subscription, usage, and plan-limit read for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionUsage {
    pub subscription_id: Option<Uuid>,
    pub tier: SubscriptionTier,
    /// First day of the current counting period.
    pub period_start: NaiveDate,
    pub usage: HashMap<ModelAccess, u32>,
    /// Per-model plan limits overriding the tier defaults. `None` is unlimited.
    #[serde(default)]
    pub limits: HashMap<ModelAccess, Option<u32>>,
}

impl SubscriptionUsage {
    pub fn free(period_start: NaiveDate) -> Self {
        Self {
            subscription_id: None,
            tier: SubscriptionTier::Free,
            period_start,
            usage: HashMap::new(),
            limits: HashMap::new(),
        }
    }

    pub fn used(&self, model: ModelAccess) -> u32 {
        self.usage.get(&model).copied().unwrap_or(0)
    }
}

/// Audit entry appended after every completed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiUsageLogEntry {
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub query: String,
    pub answer: String,
    pub model_used: ModelAccess,
    pub model_id: String,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub orchestrator: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub tier: SubscriptionTier,
    pub created_at: DateTime<Utc>,
}

//
// ================= Traits =================
//

/// Read access to a user's financial records.
///
/// Every method is independently failable; callers degrade per call.
#[async_trait::async_trait]
pub trait FinancialDataSource: Send + Sync {
    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>>;
    async fn fetch_expense_categories(&self, user_id: Uuid) -> Result<Vec<ExpenseCategoryRecord>>;
    async fn fetch_debts(&self, user_id: Uuid) -> Result<Vec<DebtRecord>>;
    async fn fetch_assets(&self, user_id: Uuid) -> Result<Vec<AssetRecord>>;
    async fn fetch_goals(&self, user_id: Uuid) -> Result<Vec<GoalRecord>>;
    /// Most recent first, at most `limit` rows.
    async fn fetch_recent_transactions(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>>;
    async fn fetch_user(&self, user_id: Uuid) -> Result<Option<UserRecord>>;
}

/// Owner of subscription state and per-model usage counters.
#[async_trait::async_trait]
pub trait UsageLedger: Send + Sync {
    async fn fetch_subscription_usage(&self, user_id: Uuid) -> Result<SubscriptionUsage>;

    /// Atomically add one to the (user, model) counter for the current period.
    async fn increment_usage(&self, user_id: Uuid, model: ModelAccess) -> Result<()>;

    async fn append_usage_log(&self, entry: AiUsageLogEntry) -> Result<()>;
}

/// First day of the month containing `date`.
pub fn period_start_for(date: NaiveDate) -> NaiveDate {
    date.with_day0(0).unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_start_for() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 17).unwrap();
        assert_eq!(period_start_for(date), NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    }

    #[test]
    fn test_subscription_usage_defaults_to_zero() {
        let usage = SubscriptionUsage::free(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(usage.used(ModelAccess::Fast), 0);
        assert_eq!(usage.tier, SubscriptionTier::Free);
    }
}
