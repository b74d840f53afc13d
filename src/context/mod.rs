//! Financial context builder
//!
//! Fans out to every record source at once and folds whatever comes back
//! into one [`FinancialContext`]. A failed or slow source degrades to an
//! empty default; it never aborts the build.

use crate::models::{
    AssetSummary, AssetType, DebtSummary, ExpenseSummary, FinancialContext, GoalSummary,
    IncomeSource, IncomeSummary, TransactionSample,
};
use crate::storage::{
    AssetRecord, DebtRecord, ExpenseCategoryRecord, FinancialDataSource, GoalRecord,
    ProfileRecord, TransactionRecord, UserRecord,
};
use crate::Result;
use chrono::{Datelike, NaiveDate, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Transactions sampled into the context.
pub const RECENT_TRANSACTION_LIMIT: usize = 20;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ContextBuilder {
    source: Arc<dyn FinancialDataSource>,
    fetch_timeout: Duration,
}

impl ContextBuilder {
    pub fn new(source: Arc<dyn FinancialDataSource>) -> Self {
        Self {
            source,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    /// Build a fresh context for one request.
    pub async fn build(&self, user_id: Uuid) -> FinancialContext {
        let source = &self.source;
        let timeout = self.fetch_timeout;

        let (profile, categories, debts, assets, goals, transactions, user) = tokio::join!(
            fetch_or_default("profile", timeout, source.fetch_profile(user_id)),
            fetch_or_default(
                "expense_categories",
                timeout,
                source.fetch_expense_categories(user_id)
            ),
            fetch_or_default("debts", timeout, source.fetch_debts(user_id)),
            fetch_or_default("assets", timeout, source.fetch_assets(user_id)),
            fetch_or_default("goals", timeout, source.fetch_goals(user_id)),
            fetch_or_default(
                "transactions",
                timeout,
                source.fetch_recent_transactions(user_id, RECENT_TRANSACTION_LIMIT)
            ),
            fetch_or_default("user", timeout, source.fetch_user(user_id)),
        );

        let context = assemble_context(
            user_id,
            Utc::now().date_naive(),
            RawFinances {
                profile,
                categories,
                debts,
                assets,
                goals,
                transactions,
                user,
            },
        );

        debug!(
            user_id = %user_id,
            debts = context.debts.len(),
            assets = context.assets.len(),
            goals = context.goals.len(),
            transactions = context.recent_transactions.len(),
            "Financial context built"
        );

        context
    }
}

async fn fetch_or_default<T, F>(name: &'static str, timeout: Duration, fetch: F) -> T
where
    T: Default,
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fetch).await {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            warn!(source = name, "Context fetch failed, using empty default: {}", error);
            T::default()
        }
        Err(_) => {
            warn!(source = name, timeout_ms = timeout.as_millis() as u64, "Context fetch timed out");
            T::default()
        }
    }
}

/// Everything the sources returned, before normalization.
#[derive(Debug, Default)]
pub struct RawFinances {
    pub profile: Option<ProfileRecord>,
    pub categories: Vec<ExpenseCategoryRecord>,
    pub debts: Vec<DebtRecord>,
    pub assets: Vec<AssetRecord>,
    pub goals: Vec<GoalRecord>,
    pub transactions: Vec<TransactionRecord>,
    pub user: Option<UserRecord>,
}

/// Normalize raw records. Pure, so it is tested without any storage.
pub fn assemble_context(user_id: Uuid, today: NaiveDate, raw: RawFinances) -> FinancialContext {
    let profile = raw.profile.unwrap_or_default();

    let sources: Vec<IncomeSource> = profile
        .income_sources
        .iter()
        .map(|s| IncomeSource {
            name: s.name.clone(),
            monthly_amount: parse_amount_opt(s.monthly_amount.as_deref()),
        })
        .collect();
    let stated_income = parse_amount_opt(profile.monthly_income.as_deref());
    let net_monthly = if stated_income > 0.0 {
        stated_income
    } else {
        sources.iter().map(|s| s.monthly_amount).sum()
    };

    let mut categories = std::collections::BTreeMap::new();
    for record in &raw.categories {
        *categories.entry(record.category.clone()).or_insert(0.0) +=
            parse_amount_opt(record.monthly_amount.as_deref());
    }
    let stated_expenses = parse_amount_opt(profile.monthly_expenses.as_deref());
    let monthly_total = if stated_expenses > 0.0 {
        stated_expenses
    } else {
        categories.values().sum()
    };

    let debts = raw
        .debts
        .iter()
        .map(|d| {
            let minimum_payment = parse_amount_opt(d.minimum_payment.as_deref());
            let monthly_payment = match parse_amount_opt(d.monthly_payment.as_deref()) {
                p if p > 0.0 => p,
                _ => minimum_payment,
            };
            DebtSummary {
                name: d.name.clone(),
                balance: parse_amount_opt(d.balance.as_deref()),
                apr: parse_amount_opt(d.apr.as_deref()),
                minimum_payment,
                monthly_payment,
            }
        })
        .collect();

    let assets = raw
        .assets
        .iter()
        .map(|a| AssetSummary {
            name: a.name.clone(),
            value: parse_amount_opt(a.value.as_deref()),
            asset_type: a
                .asset_type
                .as_deref()
                .map(AssetType::from_label)
                .unwrap_or(AssetType::Other),
        })
        .collect();

    let goals = raw
        .goals
        .iter()
        .map(|g| GoalSummary {
            name: g.name.clone(),
            horizon_months: g.target_date.map(|d| months_between(today, d)).unwrap_or(0),
            target: parse_amount_opt(g.target_amount.as_deref()),
            current: parse_amount_opt(g.current_amount.as_deref()),
        })
        .collect();

    // Magnitudes only; the sign convention differs between importers.
    let recent_transactions = raw
        .transactions
        .iter()
        .take(RECENT_TRANSACTION_LIMIT)
        .map(|t| TransactionSample {
            date: t.date,
            description: t.description.clone(),
            amount: t
                .amount
                .as_deref()
                .map(|a| parse_signed_amount(a).abs())
                .unwrap_or(0.0),
            category: t.category.clone(),
        })
        .collect();

    FinancialContext {
        user_id,
        display_name: raw.user.and_then(|u| u.display_name),
        income: IncomeSummary { net_monthly, sources },
        expenses: ExpenseSummary {
            monthly_total,
            categories,
        },
        debts,
        assets,
        goals,
        recent_transactions,
    }
}

/// Rough token footprint of a context: `ceil(json_len / 4)`.
///
/// Advisory only; this is not a tokenizer.
pub fn estimate_context_tokens(context: &FinancialContext) -> usize {
    let serialized_len = serde_json::to_string(context)
        .map(|s| s.len())
        .unwrap_or(0);
    serialized_len.div_ceil(4)
}

/// Pretty JSON of the context for embedding in prompts.
pub fn context_json(context: &FinancialContext) -> String {
    serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string())
}

/// Best-effort parse of a stored amount into a non-negative number.
///
/// Accepts currency symbols, thousands separators, percent signs and
/// accounting parentheses. Anything unparseable, negative, or non-finite
/// becomes 0.
pub fn parse_amount(raw: &str) -> f64 {
    let value = parse_signed_amount(raw);
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn parse_amount_opt(raw: Option<&str>) -> f64 {
    raw.map(parse_amount).unwrap_or(0.0)
}

fn parse_signed_amount(raw: &str) -> f64 {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('-') || (trimmed.starts_with('(') && trimmed.ends_with(')'));

    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => {
            if negative {
                -value
            } else {
                value
            }
        }
        _ => 0.0,
    }
}

/// Whole months from `from` until `to`, 0 when `to` is not in the future.
fn months_between(from: NaiveDate, to: NaiveDate) -> u32 {
    if to <= from {
        return 0;
    }
    let mut months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
    if to.day() < from.day() {
        months -= 1;
    }
    months.max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::UserFinances;
    use crate::storage::{IncomeSourceRecord, InMemoryStore};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_amount_variants() {
        assert_eq!(parse_amount("$1,250.50"), 1250.5);
        assert_eq!(parse_amount("19.99%"), 19.99);
        assert_eq!(parse_amount("  42 "), 42.0);
        assert_eq!(parse_amount(""), 0.0);
        assert_eq!(parse_amount("n/a"), 0.0);
        assert_eq!(parse_amount("-300"), 0.0);
        assert_eq!(parse_amount("(300.00)"), 0.0);
    }

    #[test]
    fn test_months_between() {
        assert_eq!(months_between(date(2026, 1, 15), date(2027, 1, 15)), 12);
        assert_eq!(months_between(date(2026, 1, 15), date(2026, 3, 14)), 1);
        assert_eq!(months_between(date(2026, 5, 1), date(2026, 1, 1)), 0);
    }

    #[test]
    fn test_income_falls_back_to_sources() {
        let raw = RawFinances {
            profile: Some(ProfileRecord {
                monthly_income: None,
                monthly_expenses: Some("".to_string()),
                income_sources: vec![
                    IncomeSourceRecord {
                        name: "Salary".to_string(),
                        monthly_amount: Some("$4,000".to_string()),
                    },
                    IncomeSourceRecord {
                        name: "Freelance".to_string(),
                        monthly_amount: Some("500".to_string()),
                    },
                ],
            }),
            categories: vec![
                ExpenseCategoryRecord {
                    category: "Rent".to_string(),
                    monthly_amount: Some("1,500".to_string()),
                },
                ExpenseCategoryRecord {
                    category: "Food".to_string(),
                    monthly_amount: Some("garbage".to_string()),
                },
            ],
            ..Default::default()
        };

        let context = assemble_context(Uuid::new_v4(), date(2026, 1, 1), raw);
        assert_eq!(context.income.net_monthly, 4500.0);
        assert_eq!(context.expenses.monthly_total, 1500.0);
        assert_eq!(context.expenses.categories.get("Food"), Some(&0.0));
    }

    #[test]
    fn test_debt_payment_defaults_to_minimum() {
        let raw = RawFinances {
            debts: vec![DebtRecord {
                name: "Visa".to_string(),
                balance: Some("$3,200".to_string()),
                apr: Some("24.9%".to_string()),
                minimum_payment: Some("95".to_string()),
                monthly_payment: None,
            }],
            ..Default::default()
        };
        let context = assemble_context(Uuid::new_v4(), date(2026, 1, 1), raw);
        let debt = &context.debts[0];
        assert_eq!(debt.balance, 3200.0);
        assert_eq!(debt.apr, 24.9);
        assert_eq!(debt.monthly_payment, 95.0);
    }

    #[test]
    fn test_estimate_tokens_is_ceil_of_quarter_length() {
        let context = FinancialContext::empty(Uuid::nil());
        let len = serde_json::to_string(&context).unwrap().len();
        assert_eq!(estimate_context_tokens(&context), (len + 3) / 4);
    }

    #[tokio::test]
    async fn test_failed_source_degrades_to_default() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_finances(
                user_id,
                UserFinances {
                    debts: vec![DebtRecord {
                        name: "Car loan".to_string(),
                        balance: Some("9000".to_string()),
                        ..Default::default()
                    }],
                    assets: vec![AssetRecord {
                        name: "Checking".to_string(),
                        value: Some("2500".to_string()),
                        asset_type: Some("cash".to_string()),
                    }],
                    ..Default::default()
                },
            )
            .await;
        store.fail_on("fetch_debts").await;

        let builder = ContextBuilder::new(Arc::new(store));
        let context = builder.build(user_id).await;

        assert!(context.debts.is_empty());
        assert_eq!(context.assets.len(), 1);
        assert_eq!(context.assets[0].asset_type, AssetType::Cash);
    }

    /// Debts never arrive in time; everything else comes from the store.
    struct StalledDebts {
        inner: InMemoryStore,
    }

    #[async_trait::async_trait]
    impl FinancialDataSource for StalledDebts {
        async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>> {
            self.inner.fetch_profile(user_id).await
        }

        async fn fetch_expense_categories(&self, user_id: Uuid) -> Result<Vec<ExpenseCategoryRecord>> {
            self.inner.fetch_expense_categories(user_id).await
        }

        async fn fetch_debts(&self, user_id: Uuid) -> Result<Vec<DebtRecord>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.inner.fetch_debts(user_id).await
        }

        async fn fetch_assets(&self, user_id: Uuid) -> Result<Vec<AssetRecord>> {
            self.inner.fetch_assets(user_id).await
        }

        async fn fetch_goals(&self, user_id: Uuid) -> Result<Vec<GoalRecord>> {
            self.inner.fetch_goals(user_id).await
        }

        async fn fetch_recent_transactions(
            &self,
            user_id: Uuid,
            limit: usize,
        ) -> Result<Vec<TransactionRecord>> {
            self.inner.fetch_recent_transactions(user_id, limit).await
        }

        async fn fetch_user(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
            self.inner.fetch_user(user_id).await
        }
    }

    #[tokio::test]
    async fn test_slow_source_times_out_without_stalling_build() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_finances(
                user_id,
                UserFinances {
                    profile: Some(ProfileRecord {
                        monthly_income: Some("$6,000".to_string()),
                        ..Default::default()
                    }),
                    debts: vec![DebtRecord {
                        name: "Visa".to_string(),
                        balance: Some("4200".to_string()),
                        ..Default::default()
                    }],
                    assets: vec![AssetRecord {
                        name: "Brokerage".to_string(),
                        value: Some("15000".to_string()),
                        asset_type: Some("equity".to_string()),
                    }],
                    ..Default::default()
                },
            )
            .await;

        let builder = ContextBuilder::new(Arc::new(StalledDebts { inner: store }))
            .with_fetch_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let context = builder.build(user_id).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(context.debts.is_empty());
        assert_eq!(context.assets.len(), 1);
        assert_eq!(context.income.net_monthly, 6000.0);
    }

    #[tokio::test]
    async fn test_transactions_are_bounded() {
        let store = InMemoryStore::new();
        let user_id = Uuid::new_v4();
        store
            .insert_finances(
                user_id,
                UserFinances {
                    transactions: (0..40)
                        .map(|i| TransactionRecord {
                            description: format!("coffee {}", i),
                            amount: Some("-4.50".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                },
            )
            .await;

        let context = ContextBuilder::new(Arc::new(store)).build(user_id).await;
        assert_eq!(context.recent_transactions.len(), RECENT_TRANSACTION_LIMIT);
        assert_eq!(context.recent_transactions[0].amount, 4.5);
    }
}
