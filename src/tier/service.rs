//! Tier-aware entry point
//!
//! Wraps the advice service with subscription gating: route once, resolve a
//! model against live quota, answer through the precomputed route, then
//! record usage best-effort.

use super::{downgrade_notice, resolve_model, ModelSelection, QuotaExceeded};
use crate::advice::{AdviceOptions, HybridAdviceService, PrecomputedRoute};
use crate::audit;
use crate::context::estimate_context_tokens;
use crate::error::OrchestrationError;
use crate::llm::stream::spawn_stream;
use crate::llm::{ChatStream, StreamChunk};
use crate::models::{
    AdviceResponse, ChatMessage, ComplexitySignals, FinancialContext, ModelAccess, RouteDecision,
    RouteTier, SubscriptionTier,
};
use crate::router;
use crate::storage::{SubscriptionUsage, UsageLedger};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AdviceRequest {
    pub user_id: Uuid,
    pub message: String,
    pub history: Vec<ChatMessage>,
    /// Caller override, still clamped to the tier and subject to quota.
    pub force_model: Option<ModelAccess>,
    pub skip_escalation: bool,
}

impl AdviceRequest {
    pub fn new(user_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            user_id,
            message: message.into(),
            history: Vec::new(),
            force_model: None,
            skip_escalation: false,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_force_model(mut self, model: ModelAccess) -> Self {
        self.force_model = Some(model);
        self
    }

    pub fn skip_escalation(mut self) -> Self {
        self.skip_escalation = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TieredAdvice {
    #[serde(flatten)]
    pub response: AdviceResponse,
    pub preferred_model: ModelAccess,
    pub downgraded: bool,
    pub tier: SubscriptionTier,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdviceOutcome {
    Answered(TieredAdvice),
    QuotaExceeded(QuotaExceeded),
}

pub struct TieredStream {
    pub stream: ChatStream,
    pub model_used: ModelAccess,
    pub preferred_model: ModelAccess,
    pub downgraded: bool,
    pub escalated: bool,
    pub tier: SubscriptionTier,
}

pub enum StreamOutcome {
    Streaming(TieredStream),
    QuotaExceeded(QuotaExceeded),
}

/// Outcome of the shared gating steps.
enum Gate {
    Open {
        usage: SubscriptionUsage,
        route: PrecomputedRoute,
        preferred: ModelAccess,
        downgraded: bool,
    },
    Closed(QuotaExceeded),
}

#[derive(Clone)]
pub struct TieredAdviceService {
    advice: HybridAdviceService,
    ledger: Arc<dyn UsageLedger>,
}

impl TieredAdviceService {
    pub fn new(advice: HybridAdviceService, ledger: Arc<dyn UsageLedger>) -> Self {
        Self { advice, ledger }
    }

    pub async fn handle_query(&self, request: AdviceRequest) -> Result<AdviceOutcome> {
        let (usage, route, preferred, downgraded) = match self.gate(&request).await? {
            Gate::Open {
                usage,
                route,
                preferred,
                downgraded,
            } => (usage, route, preferred, downgraded),
            Gate::Closed(exceeded) => return Ok(AdviceOutcome::QuotaExceeded(exceeded)),
        };
        let selected = route.model;

        let options = AdviceOptions {
            history: request.history.clone(),
            precomputed: Some(route),
            skip_escalation: request.skip_escalation,
        };
        let mut response = self
            .advice
            .generate_advice(request.user_id, &request.message, options)
            .await?;

        if downgraded {
            response.answer = format!("{}{}", downgrade_notice(preferred, selected), response.answer);
        }

        let entry = audit::entry_for_advice(request.user_id, &usage, &request.message, &response);
        audit::record_usage(self.ledger.as_ref(), entry).await;

        info!(
            user_id = %request.user_id,
            model = %response.model_used,
            tokens_in = response.tokens_in,
            tokens_out = response.tokens_out,
            cost = response.cost,
            downgraded,
            "query answered"
        );

        Ok(AdviceOutcome::Answered(TieredAdvice {
            response,
            preferred_model: preferred,
            downgraded,
            tier: usage.tier,
        }))
    }

    /// Same gating as [`handle_query`](Self::handle_query), answered as a
    /// stream. Usage is recorded once `Done` reaches a listening consumer.
    pub async fn stream_query(&self, request: AdviceRequest) -> Result<StreamOutcome> {
        let (usage, route, preferred, downgraded) = match self.gate(&request).await? {
            Gate::Open {
                usage,
                route,
                preferred,
                downgraded,
            } => (usage, route, preferred, downgraded),
            Gate::Closed(exceeded) => return Ok(StreamOutcome::QuotaExceeded(exceeded)),
        };
        let selected = route.model;
        let decision = route.decision.clone();

        let options = AdviceOptions {
            history: request.history.clone(),
            precomputed: Some(route),
            skip_escalation: request.skip_escalation,
        };
        let upstream = self
            .advice
            .stream_advice(request.user_id, &request.message, options)
            .await?
            .stream;

        let notice = downgraded.then(|| downgrade_notice(preferred, selected));
        let ledger = self.ledger.clone();
        let user_id = request.user_id;
        let query = request.message;
        let tier = usage.tier;
        let escalated = decision.escalated();

        let stream = spawn_stream(move |mut sink| async move {
            let mut upstream = upstream;
            let mut answer = String::new();

            if let Some(notice) = notice {
                answer.push_str(&notice);
                if !sink.send(StreamChunk::text(notice)).await {
                    return;
                }
            }

            while let Some(chunk) = upstream.recv().await {
                if let StreamChunk::TextDelta { text } = &chunk {
                    answer.push_str(text);
                }
                let metrics = match &chunk {
                    StreamChunk::Done { metrics } => Some(metrics.clone()),
                    _ => None,
                };
                let terminal = chunk.is_terminal();

                if !sink.send(chunk).await {
                    return;
                }
                if let Some(metrics) = metrics {
                    let entry = audit::entry_for_stream(
                        user_id,
                        &usage,
                        &query,
                        std::mem::take(&mut answer),
                        &decision,
                        &metrics,
                    );
                    // Outlives this producer, which is aborted when the
                    // consumer drops the stream.
                    let ledger = ledger.clone();
                    tokio::spawn(async move {
                        audit::record_usage(ledger.as_ref(), entry).await;
                    });
                }
                if terminal {
                    return;
                }
            }
        });

        Ok(StreamOutcome::Streaming(TieredStream {
            stream,
            model_used: selected,
            preferred_model: preferred,
            downgraded,
            escalated,
            tier,
        }))
    }

    async fn gate(&self, request: &AdviceRequest) -> Result<Gate> {
        if request.message.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "Please enter a question.".to_string(),
            ));
        }

        let user_id = request.user_id;
        let usage = self.ledger.fetch_subscription_usage(user_id).await?;
        let context = self.advice.context_builder().build(user_id).await;
        let decision = route(&request.message, &context, request.skip_escalation);

        info!(
            user_id = %user_id,
            tier = %usage.tier,
            escalated = decision.escalated(),
            reason = decision.reason.as_deref().unwrap_or("-"),
            "route decided"
        );

        match resolve_model(&request.message, &decision, &usage, request.force_model) {
            ModelSelection::Selected {
                model,
                preferred,
                downgraded,
            } => {
                if downgraded {
                    warn!(
                        user_id = %user_id,
                        preferred = %preferred,
                        selected = %model,
                        "preferred model out of quota, downgrading"
                    );
                }
                Ok(Gate::Open {
                    usage,
                    route: PrecomputedRoute {
                        context,
                        decision,
                        model,
                    },
                    preferred,
                    downgraded,
                })
            }
            ModelSelection::QuotaExceeded(exceeded) => {
                info!(
                    user_id = %user_id,
                    tier = %usage.tier,
                    preferred = %exceeded.preferred_model,
                    "quota exceeded on every allowed model"
                );
                Ok(Gate::Closed(exceeded))
            }
        }
    }
}

fn route(message: &str, context: &FinancialContext, skip_escalation: bool) -> RouteDecision {
    if skip_escalation {
        return RouteDecision {
            tier: RouteTier::Fast,
            reason: None,
        };
    }
    let signals = ComplexitySignals::new(message, context, estimate_context_tokens(context));
    router::decide(&signals)
}
