//! Usage tracking
//!
//! Every completed query bumps the per-model counter and appends one audit
//! entry. Both writes are best-effort: failures are logged here and never
//! reach the caller.

use crate::llm::StreamMetrics;
use crate::models::{AdviceResponse, RouteDecision};
use crate::storage::{AiUsageLogEntry, SubscriptionUsage, UsageLedger};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Audit entry for a completed (non-streamed) answer.
pub fn entry_for_advice(
    user_id: Uuid,
    usage: &SubscriptionUsage,
    query: &str,
    response: &AdviceResponse,
) -> AiUsageLogEntry {
    AiUsageLogEntry {
        user_id,
        subscription_id: usage.subscription_id,
        query: query.to_string(),
        answer: response.answer.clone(),
        model_used: response.model_used,
        model_id: response.model_id.clone(),
        escalated: response.escalated,
        escalation_reason: response.escalation_reason.clone(),
        orchestrator: response.orchestrator_used.map(|k| k.as_str().to_string()),
        tokens_in: response.tokens_in,
        tokens_out: response.tokens_out,
        cost: response.cost,
        tier: usage.tier,
        created_at: Utc::now(),
    }
}

/// Audit entry for a stream that reached `Done`.
pub fn entry_for_stream(
    user_id: Uuid,
    usage: &SubscriptionUsage,
    query: &str,
    answer: String,
    decision: &RouteDecision,
    metrics: &StreamMetrics,
) -> AiUsageLogEntry {
    AiUsageLogEntry {
        user_id,
        subscription_id: usage.subscription_id,
        query: query.to_string(),
        answer,
        model_used: metrics.backend,
        model_id: metrics.model_id.clone(),
        escalated: decision.escalated(),
        escalation_reason: decision.reason.clone(),
        orchestrator: None,
        tokens_in: metrics.tokens_in,
        tokens_out: metrics.tokens_out,
        cost: metrics.cost,
        tier: usage.tier,
        created_at: Utc::now(),
    }
}

/// Count and log one completed query. Never fails.
pub async fn record_usage(ledger: &dyn UsageLedger, entry: AiUsageLogEntry) {
    let user_id = entry.user_id;
    let model = entry.model_used;

    if let Err(e) = ledger.increment_usage(user_id, model).await {
        warn!(user_id = %user_id, model = %model, error = %e, "failed to increment usage counter");
    }

    if let Err(e) = ledger.append_usage_log(entry).await {
        warn!(user_id = %user_id, model = %model, error = %e, "failed to append usage log");
        return;
    }

    debug!(user_id = %user_id, model = %model, "usage recorded");
}
