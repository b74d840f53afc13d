//! Hybrid advice service
//!
//! Builds the context once, decides escalation, and serves the question
//! either through a structured domain orchestrator or a generic chat turn.
//! Both paths produce the same [`AdviceResponse`] shape.

use crate::context::{estimate_context_tokens, ContextBuilder};
use crate::error::OrchestrationError;
use crate::llm::{ChatRequest, ChatStream, ModelClient, ModelRegistry};
use crate::models::{
    AIResponse, AdviceResponse, ChatMessage, ChatRole, ComplexitySignals, FinancialContext,
    ModelAccess, RouteDecision, RouteTier,
};
use crate::orchestrators::{run_structured, OrchestratorSet, StructuredResult};
use crate::router;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub mod prompt;

pub use prompt::build_system_prompt;

/// Conversation turns forwarded to the model, most recent last.
pub const MAX_HISTORY_TURNS: usize = 10;

const GENERIC_MAX_TOKENS: u32 = 1024;
const GENERIC_TEMPERATURE: f32 = 0.7;

/// Work already done by a caller that ran the router itself.
#[derive(Debug, Clone)]
pub struct PrecomputedRoute {
    pub context: FinancialContext,
    pub decision: RouteDecision,
    pub model: ModelAccess,
}

#[derive(Debug, Clone, Default)]
pub struct AdviceOptions {
    pub history: Vec<ChatMessage>,
    pub precomputed: Option<PrecomputedRoute>,
    /// Answer with the fast model without consulting the router.
    pub skip_escalation: bool,
}

/// A generic answer being streamed, plus how it was routed.
pub struct AdviceStream {
    pub stream: ChatStream,
    pub model_used: ModelAccess,
    pub decision: RouteDecision,
}

#[derive(Clone)]
pub struct HybridAdviceService {
    registry: Arc<ModelRegistry>,
    context_builder: ContextBuilder,
    orchestrators: OrchestratorSet,
    top_model: ModelAccess,
}

impl HybridAdviceService {
    pub fn new(registry: Arc<ModelRegistry>, context_builder: ContextBuilder) -> Self {
        Self {
            registry,
            context_builder,
            orchestrators: OrchestratorSet::standard(),
            top_model: ModelAccess::Cfo,
        }
    }

    pub fn with_orchestrators(mut self, orchestrators: OrchestratorSet) -> Self {
        self.orchestrators = orchestrators;
        self
    }

    /// Model used for escalated questions when no caller picked one.
    pub fn with_top_model(mut self, top_model: ModelAccess) -> Self {
        self.top_model = top_model;
        self
    }

    pub fn context_builder(&self) -> &ContextBuilder {
        &self.context_builder
    }

    pub async fn generate_advice(
        &self,
        user_id: Uuid,
        message: &str,
        options: AdviceOptions,
    ) -> Result<AdviceResponse> {
        let AdviceOptions {
            history,
            precomputed,
            skip_escalation,
        } = options;
        let route = self.prepare(user_id, message, precomputed, skip_escalation).await;
        let client = self.registry.get(route.model)?;

        info!(
            user_id = %user_id,
            model = %route.model,
            escalated = route.decision.escalated(),
            "generating advice"
        );

        let mut spent: Option<AIResponse> = None;

        if route.decision.escalated() && route.model != ModelAccess::Fast {
            if let Some(orchestrator) = self.orchestrators.select(message, &route.context) {
                match run_structured(orchestrator.as_ref(), client.as_ref(), &route.context, message)
                    .await
                {
                    Ok(result) => return Ok(structured_response(result, &route.decision)),
                    Err(failure) => {
                        warn!(
                            user_id = %user_id,
                            orchestrator = %orchestrator.kind(),
                            error = %failure.error,
                            "orchestrator failed, falling back to generic answer"
                        );
                        spent = failure.spent;
                    }
                }
            }
        }

        let request = generic_request(&route.context, message, &history);
        let response = client
            .send_chat(&request)
            .await
            .map_err(OrchestrationError::from)?;

        Ok(generic_response(response, spent, &route.decision))
    }

    /// Stream a generic answer. Orchestrators never stream.
    pub async fn stream_advice(
        &self,
        user_id: Uuid,
        message: &str,
        options: AdviceOptions,
    ) -> Result<AdviceStream> {
        let AdviceOptions {
            history,
            precomputed,
            skip_escalation,
        } = options;
        let route = self.prepare(user_id, message, precomputed, skip_escalation).await;
        let client = self.registry.get(route.model)?;

        let request = generic_request(&route.context, message, &history);
        let stream = client
            .stream_chat(&request)
            .await
            .map_err(OrchestrationError::from)?;

        Ok(AdviceStream {
            stream,
            model_used: route.model,
            decision: route.decision,
        })
    }

    async fn prepare(
        &self,
        user_id: Uuid,
        message: &str,
        precomputed: Option<PrecomputedRoute>,
        skip_escalation: bool,
    ) -> PrecomputedRoute {
        if let Some(route) = precomputed {
            return route;
        }

        let context = self.context_builder.build(user_id).await;
        if skip_escalation {
            return PrecomputedRoute {
                context,
                decision: RouteDecision {
                    tier: RouteTier::Fast,
                    reason: None,
                },
                model: ModelAccess::Fast,
            };
        }

        let signals = ComplexitySignals::new(message, &context, estimate_context_tokens(&context));
        let decision = router::decide(&signals);
        let model = if decision.escalated() {
            self.top_model
        } else {
            ModelAccess::Fast
        };

        PrecomputedRoute {
            context,
            decision,
            model,
        }
    }
}

fn generic_request(context: &FinancialContext, message: &str, history: &[ChatMessage]) -> ChatRequest {
    let skip = history.len().saturating_sub(MAX_HISTORY_TURNS);
    // Backends expect the conversation to open with a user turn.
    let mut messages: Vec<ChatMessage> = history[skip..]
        .iter()
        .skip_while(|m| m.role == ChatRole::Assistant)
        .cloned()
        .collect();
    messages.push(ChatMessage::user(message));

    ChatRequest::new(messages)
        .with_system_prompt(build_system_prompt(context))
        .with_max_tokens(GENERIC_MAX_TOKENS)
        .with_temperature(GENERIC_TEMPERATURE)
}

fn structured_response(result: StructuredResult, decision: &RouteDecision) -> AdviceResponse {
    let StructuredResult {
        kind,
        data,
        answer,
        response,
    } = result;

    AdviceResponse {
        answer,
        model_used: response.backend,
        model_id: response.model_id,
        tokens_in: response.tokens_in,
        tokens_out: response.tokens_out,
        cost: response.cost,
        escalated: decision.escalated(),
        escalation_reason: decision.reason.clone(),
        orchestrator_used: Some(kind),
        structured_data: Some(data),
        tool_calls: response.tool_calls,
    }
}

/// Generic answer, with tokens from a failed orchestrator attempt folded in.
fn generic_response(
    response: AIResponse,
    spent: Option<AIResponse>,
    decision: &RouteDecision,
) -> AdviceResponse {
    let (extra_in, extra_out, extra_cost) = spent
        .map(|s| (s.tokens_in, s.tokens_out, s.cost))
        .unwrap_or((0, 0, 0.0));

    AdviceResponse {
        answer: response.text,
        model_used: response.backend,
        model_id: response.model_id,
        tokens_in: response.tokens_in + extra_in,
        tokens_out: response.tokens_out + extra_out,
        cost: response.cost + extra_cost,
        escalated: decision.escalated(),
        escalation_reason: decision.reason.clone(),
        orchestrator_used: None,
        structured_data: None,
        tool_calls: response.tool_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiErrorKind;
    use crate::llm::testing::{Scripted, ScriptedModel};
    use crate::models::OrchestratorKind;
    use crate::storage::memory::UserFinances;
    use crate::storage::{DebtRecord, InMemoryStore};
    use serde_json::json;

    struct Harness {
        service: HybridAdviceService,
        fast: Arc<ScriptedModel>,
        cfo: Arc<ScriptedModel>,
        store: InMemoryStore,
    }

    fn harness(fast: Vec<Scripted>, cfo: Vec<Scripted>) -> Harness {
        let fast = Arc::new(ScriptedModel::new(ModelAccess::Fast, fast));
        let cfo = Arc::new(ScriptedModel::new(ModelAccess::Cfo, cfo));
        let registry = ModelRegistry::new().with(fast.clone()).with(cfo.clone());
        let store = InMemoryStore::new();
        let service = HybridAdviceService::new(
            Arc::new(registry),
            ContextBuilder::new(Arc::new(store.clone())),
        );
        Harness {
            service,
            fast,
            cfo,
            store,
        }
    }

    fn debts(n: usize) -> UserFinances {
        UserFinances {
            debts: (0..n)
                .map(|i| DebtRecord {
                    name: format!("Card {}", i + 1),
                    balance: Some(format!("${},000", i + 2)),
                    apr: Some("21.9%".to_string()),
                    minimum_payment: Some("$60".to_string()),
                    monthly_payment: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn debt_plan() -> serde_json::Value {
        json!({
            "strategy": "avalanche",
            "payoff_months": 30,
            "total_interest": 2210.0,
            "recommended_monthly_payment": 520.0,
            "priority_order": ["Card 3", "Card 2", "Card 1"],
            "summary": "All three cards share the same APR, so target the largest balance while paying minimums on the rest."
        })
    }

    #[tokio::test]
    async fn test_simple_question_uses_fast_model() {
        let h = harness(vec![Scripted::Reply("Track spending weekly.".into())], vec![]);

        let response = h
            .service
            .generate_advice(Uuid::new_v4(), "Help me with my budget", AdviceOptions::default())
            .await
            .unwrap();

        assert_eq!(response.model_used, ModelAccess::Fast);
        assert!(!response.escalated);
        assert!(response.escalation_reason.is_none());
        assert!(response.orchestrator_used.is_none());
        assert_eq!(h.cfo.request_count().await, 0);
    }

    #[tokio::test]
    async fn test_escalated_debt_question_returns_structured_data() {
        let reply = format!("```json\n{}\n```", debt_plan());
        let h = harness(vec![], vec![Scripted::Reply(reply)]);
        let user_id = Uuid::new_v4();
        h.store.insert_finances(user_id, debts(3)).await;

        let response = h
            .service
            .generate_advice(user_id, "How should I pay off my debt?", AdviceOptions::default())
            .await
            .unwrap();

        assert!(response.escalated);
        assert!(response.escalation_reason.unwrap().contains("3 debts"));
        assert_eq!(response.orchestrator_used, Some(OrchestratorKind::Debt));
        assert_eq!(response.structured_data, Some(debt_plan()));
        assert_eq!(response.model_used, ModelAccess::Cfo);
        assert!(response.answer.contains("30 months"));
    }

    #[tokio::test]
    async fn test_retirement_plan_dispatches_to_retirement() {
        let plan = json!({
            "readiness": "on_track",
            "years_to_retirement": 10,
            "projected_nest_egg": 640000,
            "recommended_monthly_contribution": 900,
            "safe_withdrawal_rate": 4,
            "summary": "Keeping contributions steady for ten more years gets you to your target with a 4% draw."
        });
        let reply = format!("```json\n{}\n```", plan);
        let h = harness(vec![], vec![Scripted::Reply(reply)]);

        let response = h
            .service
            .generate_advice(
                Uuid::new_v4(),
                "Create a 10-year retirement plan",
                AdviceOptions::default(),
            )
            .await
            .unwrap();

        assert!(response.escalated);
        assert!(response
            .escalation_reason
            .unwrap()
            .contains("Multi-year planning"));
        assert_eq!(response.orchestrator_used, Some(OrchestratorKind::Retirement));
    }

    #[tokio::test]
    async fn test_invalid_structured_output_falls_back_with_combined_cost() {
        let h = harness(
            vec![],
            vec![
                Scripted::Reply("I think you should retire early!".into()),
                Scripted::Reply("Here is a narrative plan.".into()),
            ],
        );

        let response = h
            .service
            .generate_advice(
                Uuid::new_v4(),
                "Create a 10-year retirement plan",
                AdviceOptions::default(),
            )
            .await
            .unwrap();

        assert!(response.orchestrator_used.is_none());
        assert!(response.structured_data.is_none());
        assert_eq!(response.answer, "Here is a narrative plan.");
        assert_eq!(response.tokens_in, 200);
        assert_eq!(h.cfo.request_count().await, 2);
    }

    #[tokio::test]
    async fn test_model_error_propagates_user_safe() {
        let h = harness(vec![Scripted::Fail(AiErrorKind::RateLimit)], vec![]);

        let err = h
            .service
            .generate_advice(Uuid::new_v4(), "hello", AdviceOptions::default())
            .await
            .unwrap_err();

        assert!(err.user_message().contains("try again shortly"));
    }

    #[tokio::test]
    async fn test_precomputed_route_skips_context_build() {
        let h = harness(vec![], vec![]);
        h.store.fail_on("fetch_debts").await;

        let options = AdviceOptions {
            precomputed: Some(PrecomputedRoute {
                context: FinancialContext::empty(Uuid::nil()),
                decision: RouteDecision {
                    tier: RouteTier::Fast,
                    reason: None,
                },
                model: ModelAccess::Cfo,
            }),
            ..Default::default()
        };

        let response = h
            .service
            .generate_advice(Uuid::new_v4(), "quick one", options)
            .await
            .unwrap();

        assert_eq!(response.model_used, ModelAccess::Cfo);
        assert!(response.orchestrator_used.is_none());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let h = harness(vec![], vec![]);
        let history: Vec<ChatMessage> = (0..16)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("turn {}", i))
                } else {
                    ChatMessage::assistant(format!("turn {}", i))
                }
            })
            .collect();

        h.service
            .generate_advice(
                Uuid::new_v4(),
                "and now?",
                AdviceOptions {
                    history,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let requests = h.fast.requests.lock().await;
        let messages = &requests[0].messages;
        assert_eq!(messages.len(), MAX_HISTORY_TURNS + 1);
        assert_eq!(messages[0].content, "turn 6");
        assert_eq!(messages.last().unwrap().role, ChatRole::User);
    }

    #[tokio::test]
    async fn test_truncated_history_starts_with_user_turn() {
        let h = harness(vec![], vec![]);
        // 15 turns starting with a user message: the 10-turn window opens on
        // an assistant reply, which is dropped.
        let history: Vec<ChatMessage> = (0..15)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("turn {}", i))
                } else {
                    ChatMessage::assistant(format!("turn {}", i))
                }
            })
            .collect();

        h.service
            .generate_advice(
                Uuid::new_v4(),
                "and now?",
                AdviceOptions {
                    history,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let requests = h.fast.requests.lock().await;
        let messages = &requests[0].messages;
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "turn 6");
        assert_eq!(messages.len(), MAX_HISTORY_TURNS);
    }

    #[tokio::test]
    async fn test_skip_escalation_forces_fast() {
        let h = harness(vec![], vec![]);
        let user_id = Uuid::new_v4();
        h.store.insert_finances(user_id, debts(4)).await;

        let response = h
            .service
            .generate_advice(
                user_id,
                "pay off my debt",
                AdviceOptions {
                    skip_escalation: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.model_used, ModelAccess::Fast);
        assert!(!response.escalated);
    }

    #[tokio::test]
    async fn test_stream_advice_yields_text() {
        let h = harness(vec![Scripted::Reply("save more money".into())], vec![]);

        let mut advice = h
            .service
            .stream_advice(Uuid::new_v4(), "tips?", AdviceOptions::default())
            .await
            .unwrap();

        let mut text = String::new();
        while let Some(chunk) = advice.stream.recv().await {
            if let crate::llm::StreamChunk::TextDelta { text: t } = &chunk {
                text.push_str(t);
            }
            if chunk.is_terminal() {
                break;
            }
        }
        assert_eq!(text, "save more money");
        assert_eq!(advice.model_used, ModelAccess::Fast);
    }
}
