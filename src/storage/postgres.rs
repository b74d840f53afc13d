//! Postgres-backed usage ledger
//!
//! Counters are incremented with a single upsert so concurrent requests for
//! the same (user, model, period) never lose an update.

use super::{period_start_for, AiUsageLogEntry, SubscriptionUsage, UsageLedger};
use crate::error::OrchestrationError;
use crate::models::{ModelAccess, SubscriptionTier};
use crate::Result;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

pub struct PgUsageLedger {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgUsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    /// Lazily connect; nothing touches the network until the first query.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        info!("Usage ledger backend: postgres");
        Ok(Self::new(pool))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let pool = &self.pool;

        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS ai_subscriptions (
                      user_id UUID PRIMARY KEY,
                      subscription_id UUID,
                      tier TEXT NOT NULL DEFAULT 'free',
                      limits JSONB NOT NULL DEFAULT '{}'::jsonb
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS ai_usage_counters (
                      user_id UUID NOT NULL,
                      model TEXT NOT NULL,
                      period_start DATE NOT NULL,
                      count INTEGER NOT NULL DEFAULT 0,
                      PRIMARY KEY (user_id, model, period_start)
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS ai_usage_log (
                      log_id UUID PRIMARY KEY,
                      user_id UUID NOT NULL,
                      subscription_id UUID,
                      query TEXT NOT NULL,
                      answer TEXT NOT NULL,
                      model_used TEXT NOT NULL,
                      model_id TEXT NOT NULL,
                      escalated BOOLEAN NOT NULL,
                      escalation_reason TEXT,
                      orchestrator TEXT,
                      tokens_in INTEGER NOT NULL,
                      tokens_out INTEGER NOT NULL,
                      cost DOUBLE PRECISION NOT NULL,
                      tier TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                OrchestrationError::StorageError(format!(
                    "Failed to initialize usage ledger schema: {}",
                    e
                ))
            })?;

        Ok(())
    }
}

/// One plan limit. `null` is unlimited; whole numbers (including `100.0`)
/// are limits. Anything else is rejected so the tier default applies.
fn parse_limit(value: &serde_json::Value) -> Option<Option<u32>> {
    if value.is_null() {
        return Some(None);
    }
    if let Some(limit) = value.as_u64() {
        return Some(Some(limit.min(u32::MAX as u64) as u32));
    }
    match value.as_f64() {
        Some(limit) if limit.is_finite() && limit >= 0.0 && limit.fract() == 0.0 => {
            Some(Some(limit.min(u32::MAX as f64) as u32))
        }
        _ => None,
    }
}

/// Decode the `limits` JSON object (`{"reasoning": 100, "fast": null}`).
fn parse_limits(raw: &str) -> HashMap<ModelAccess, Option<u32>> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(error) => {
            warn!("Ignoring malformed plan limits: {}", error);
            return HashMap::new();
        }
    };

    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(model, limit)| {
                    let access = ModelAccess::parse(model)?;
                    match parse_limit(limit) {
                        Some(limit) => Some((access, limit)),
                        None => {
                            warn!(model = %model, limit = %limit, "Ignoring invalid plan limit, using tier default");
                            None
                        }
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_usage(raw: &str) -> HashMap<ModelAccess, u32> {
    serde_json::from_str::<HashMap<String, i64>>(raw)
        .map(|counts| {
            counts
                .into_iter()
                .filter_map(|(model, count)| {
                    Some((ModelAccess::parse(&model)?, count.max(0) as u32))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl UsageLedger for PgUsageLedger {
    async fn fetch_subscription_usage(&self, user_id: Uuid) -> Result<SubscriptionUsage> {
        self.ensure_schema().await?;

        let period_start = period_start_for(Utc::now().date_naive());

        let row = sqlx::query(
            r#"
            SELECT
              s.subscription_id,
              s.tier,
              COALESCE(s.limits::text, '{}') AS limits,
              COALESCE(
                (SELECT json_object_agg(c.model, c.count)::text
                 FROM ai_usage_counters c
                 WHERE c.user_id = $1 AND c.period_start = $2),
                '{}'
              ) AS usage
            FROM (SELECT $1::uuid AS user_id) u
            LEFT JOIN ai_subscriptions s ON s.user_id = u.user_id
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .fetch_one(&self.pool)
        .await?;

        let tier = row
            .try_get::<Option<String>, _>("tier")
            .ok()
            .flatten()
            .and_then(|t| SubscriptionTier::parse(&t))
            .unwrap_or(SubscriptionTier::Free);
        let limits: String = row.try_get("limits").unwrap_or_else(|_| "{}".to_string());
        let usage: String = row.try_get("usage").unwrap_or_else(|_| "{}".to_string());

        Ok(SubscriptionUsage {
            subscription_id: row.try_get("subscription_id").ok().flatten(),
            tier,
            period_start,
            usage: parse_usage(&usage),
            limits: parse_limits(&limits),
        })
    }

    async fn increment_usage(&self, user_id: Uuid, model: ModelAccess) -> Result<()> {
        self.ensure_schema().await?;

        let period_start = period_start_for(Utc::now().date_naive());

        sqlx::query(
            r#"
            INSERT INTO ai_usage_counters (user_id, model, period_start, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (user_id, model, period_start)
            DO UPDATE SET count = ai_usage_counters.count + 1
            "#,
        )
        .bind(user_id)
        .bind(model.as_str())
        .bind(period_start)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_usage_log(&self, entry: AiUsageLogEntry) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO ai_usage_log
              (log_id, user_id, subscription_id, query, answer, model_used, model_id,
               escalated, escalation_reason, orchestrator, tokens_in, tokens_out, cost, tier, created_at)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.subscription_id)
        .bind(&entry.query)
        .bind(&entry.answer)
        .bind(entry.model_used.as_str())
        .bind(&entry.model_id)
        .bind(entry.escalated)
        .bind(&entry.escalation_reason)
        .bind(&entry.orchestrator)
        .bind(entry.tokens_in as i32)
        .bind(entry.tokens_out as i32)
        .bind(entry.cost)
        .bind(entry.tier.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limits() {
        let limits = parse_limits(r#"{"reasoning": 100, "fast": null, "bogus": 5}"#);
        assert_eq!(limits.get(&ModelAccess::Reasoning), Some(&Some(100)));
        assert_eq!(limits.get(&ModelAccess::Fast), Some(&None));
        assert_eq!(limits.len(), 2);
    }

    #[test]
    fn test_whole_number_float_limit_is_kept() {
        let limits = parse_limits(r#"{"reasoning": 100.0, "math": 0.0}"#);
        assert_eq!(limits.get(&ModelAccess::Reasoning), Some(&Some(100)));
        assert_eq!(limits.get(&ModelAccess::Math), Some(&Some(0)));
    }

    #[test]
    fn test_invalid_limits_fall_back_to_tier_default() {
        let limits = parse_limits(r#"{"math": -1, "reasoning": 2.5, "cfo": "lots", "fast": true}"#);
        assert!(limits.is_empty());
    }

    #[test]
    fn test_float_limit_still_enforces_quota() {
        use crate::models::{RouteDecision, RouteTier};
        use crate::tier::{resolve_model, ModelSelection};

        let mut usage = SubscriptionUsage::free(Utc::now().date_naive());
        usage.tier = SubscriptionTier::Basic;
        usage.limits = parse_limits(r#"{"reasoning": 100.0, "math": -1}"#);
        usage.usage.insert(ModelAccess::Reasoning, 5000);

        let decision = RouteDecision {
            tier: RouteTier::Top,
            reason: Some("test".to_string()),
        };
        match resolve_model("Should I refinance my loan?", &decision, &usage, None) {
            ModelSelection::Selected {
                model, downgraded, ..
            } => {
                assert_eq!(model, ModelAccess::Fast);
                assert!(downgraded);
            }
            other => panic!("expected a downgrade, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_limits_malformed() {
        assert!(parse_limits("not json").is_empty());
    }

    #[test]
    fn test_parse_usage() {
        let usage = parse_usage(r#"{"math": 7, "cfo": -2}"#);
        assert_eq!(usage.get(&ModelAccess::Math), Some(&7));
        assert_eq!(usage.get(&ModelAccess::Cfo), Some(&0));
    }
}
