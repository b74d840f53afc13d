//! In-memory storage for development and tests

use super::{
    period_start_for, AiUsageLogEntry, AssetRecord, DebtRecord, ExpenseCategoryRecord,
    FinancialDataSource, GoalRecord, ProfileRecord, SubscriptionUsage, TransactionRecord,
    UsageLedger, UserRecord,
};
use crate::error::OrchestrationError;
use crate::models::{ModelAccess, SubscriptionTier};
use crate::Result;
use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Everything the store knows about one user's finances.
#[derive(Debug, Clone, Default)]
pub struct UserFinances {
    pub user: Option<UserRecord>,
    pub profile: Option<ProfileRecord>,
    pub expense_categories: Vec<ExpenseCategoryRecord>,
    pub debts: Vec<DebtRecord>,
    pub assets: Vec<AssetRecord>,
    pub goals: Vec<GoalRecord>,
    /// Oldest first; reads return the newest entries.
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug, Clone)]
struct SubscriptionRow {
    subscription_id: Option<Uuid>,
    tier: SubscriptionTier,
    limits: HashMap<ModelAccess, Option<u32>>,
}

type CounterKey = (Uuid, ModelAccess, NaiveDate);

/// In-memory implementation of both storage traits.
///
/// Counters live behind a single mutex, so increments never lose updates.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    finances: Arc<RwLock<HashMap<Uuid, UserFinances>>>,
    subscriptions: Arc<RwLock<HashMap<Uuid, SubscriptionRow>>>,
    counters: Arc<Mutex<HashMap<CounterKey, u32>>>,
    usage_log: Arc<RwLock<Vec<AiUsageLogEntry>>>,
    failing: Arc<RwLock<HashSet<&'static str>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_finances(&self, user_id: Uuid, finances: UserFinances) {
        self.finances.write().await.insert(user_id, finances);
    }

    pub async fn set_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
        tier: SubscriptionTier,
    ) {
        let mut subscriptions = self.subscriptions.write().await;
        let row = subscriptions.entry(user_id).or_insert_with(|| SubscriptionRow {
            subscription_id,
            tier,
            limits: HashMap::new(),
        });
        row.subscription_id = subscription_id;
        row.tier = tier;
    }

    /// Override the plan limit for one model.
    pub async fn set_plan_limit(&self, user_id: Uuid, model: ModelAccess, limit: Option<u32>) {
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions
            .entry(user_id)
            .or_insert_with(|| SubscriptionRow {
                subscription_id: None,
                tier: SubscriptionTier::Free,
                limits: HashMap::new(),
            })
            .limits
            .insert(model, limit);
    }

    /// Seed the current period's counter.
    pub async fn set_usage(&self, user_id: Uuid, model: ModelAccess, count: u32) {
        let period = period_start_for(Utc::now().date_naive());
        self.counters
            .lock()
            .await
            .insert((user_id, model, period), count);
    }

    pub async fn usage(&self, user_id: Uuid, model: ModelAccess) -> u32 {
        let period = period_start_for(Utc::now().date_naive());
        self.counters
            .lock()
            .await
            .get(&(user_id, model, period))
            .copied()
            .unwrap_or(0)
    }

    pub async fn usage_log(&self) -> Vec<AiUsageLogEntry> {
        self.usage_log.read().await.clone()
    }

    /// Make the named operation fail from now on (e.g. `"fetch_debts"`).
    pub async fn fail_on(&self, operation: &'static str) {
        self.failing.write().await.insert(operation);
    }

    async fn check(&self, operation: &'static str) -> Result<()> {
        if self.failing.read().await.contains(operation) {
            return Err(OrchestrationError::StorageError(format!(
                "{} unavailable",
                operation
            )));
        }
        Ok(())
    }

    async fn with_finances<T>(
        &self,
        operation: &'static str,
        user_id: Uuid,
        read: impl FnOnce(&UserFinances) -> T,
    ) -> Result<Option<T>> {
        self.check(operation).await?;
        let finances = self.finances.read().await;
        Ok(finances.get(&user_id).map(read))
    }
}

#[async_trait::async_trait]
impl FinancialDataSource for InMemoryStore {
    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>> {
        Ok(self
            .with_finances("fetch_profile", user_id, |f| f.profile.clone())
            .await?
            .flatten())
    }

    async fn fetch_expense_categories(&self, user_id: Uuid) -> Result<Vec<ExpenseCategoryRecord>> {
        Ok(self
            .with_finances("fetch_expense_categories", user_id, |f| {
                f.expense_categories.clone()
            })
            .await?
            .unwrap_or_default())
    }

    async fn fetch_debts(&self, user_id: Uuid) -> Result<Vec<DebtRecord>> {
        Ok(self
            .with_finances("fetch_debts", user_id, |f| f.debts.clone())
            .await?
            .unwrap_or_default())
    }

    async fn fetch_assets(&self, user_id: Uuid) -> Result<Vec<AssetRecord>> {
        Ok(self
            .with_finances("fetch_assets", user_id, |f| f.assets.clone())
            .await?
            .unwrap_or_default())
    }

    async fn fetch_goals(&self, user_id: Uuid) -> Result<Vec<GoalRecord>> {
        Ok(self
            .with_finances("fetch_goals", user_id, |f| f.goals.clone())
            .await?
            .unwrap_or_default())
    }

    async fn fetch_recent_transactions(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .with_finances("fetch_recent_transactions", user_id, |f| {
                f.transactions.iter().rev().take(limit).cloned().collect()
            })
            .await?
            .unwrap_or_default())
    }

    async fn fetch_user(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self
            .with_finances("fetch_user", user_id, |f| f.user.clone())
            .await?
            .flatten())
    }
}

#[async_trait::async_trait]
impl UsageLedger for InMemoryStore {
    async fn fetch_subscription_usage(&self, user_id: Uuid) -> Result<SubscriptionUsage> {
        self.check("fetch_subscription_usage").await?;

        let period_start = period_start_for(Utc::now().date_naive());
        let row = self.subscriptions.read().await.get(&user_id).cloned();

        let usage = {
            let counters = self.counters.lock().await;
            counters
                .iter()
                .filter(|((uid, _, period), _)| *uid == user_id && *period == period_start)
                .map(|((_, model, _), count)| (*model, *count))
                .collect()
        };

        Ok(match row {
            Some(row) => SubscriptionUsage {
                subscription_id: row.subscription_id,
                tier: row.tier,
                period_start,
                usage,
                limits: row.limits,
            },
            None => SubscriptionUsage {
                usage,
                ..SubscriptionUsage::free(period_start)
            },
        })
    }

    async fn increment_usage(&self, user_id: Uuid, model: ModelAccess) -> Result<()> {
        self.check("increment_usage").await?;
        let period = period_start_for(Utc::now().date_naive());
        let mut counters = self.counters.lock().await;
        *counters.entry((user_id, model, period)).or_insert(0) += 1;
        Ok(())
    }

    async fn append_usage_log(&self, entry: AiUsageLogEntry) -> Result<()> {
        self.check("append_usage_log").await?;
        self.usage_log.write().await.push(entry);
        Ok(())
    }
}
