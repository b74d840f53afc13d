//! Tier & Quota Manager
//!
//! Per request: select preferred model -> build fallback list -> walk the
//! list against live usage -> serve with the first model that has quota, or
//! report `QuotaExceeded`. Nothing here is persisted; counters belong to the
//! usage ledger.

use crate::llm::pricing::calculate_cost;
use crate::models::{ModelAccess, RouteDecision, SubscriptionTier};
use crate::storage::SubscriptionUsage;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod service;

pub use service::{AdviceOutcome, AdviceRequest, StreamOutcome, TieredAdvice, TieredAdviceService, TieredStream};

/// (model, default monthly limit). `None` is unlimited.
type Plan = &'static [(ModelAccess, Option<u32>)];

const FREE_PLAN: Plan = &[(ModelAccess::Fast, Some(50))];

const BASIC_PLAN: Plan = &[
    (ModelAccess::Fast, None),
    (ModelAccess::Reasoning, Some(100)),
];

const PRO_PLAN: Plan = &[
    (ModelAccess::Fast, None),
    (ModelAccess::Reasoning, Some(300)),
    (ModelAccess::Math, Some(150)),
];

const PREMIUM_PLAN: Plan = &[
    (ModelAccess::Fast, None),
    (ModelAccess::Reasoning, Some(1000)),
    (ModelAccess::Math, Some(500)),
    (ModelAccess::Cfo, Some(100)),
];

fn plan_for(tier: SubscriptionTier) -> Plan {
    match tier {
        SubscriptionTier::Free => FREE_PLAN,
        SubscriptionTier::Basic => BASIC_PLAN,
        SubscriptionTier::Pro => PRO_PLAN,
        SubscriptionTier::Premium => PREMIUM_PLAN,
    }
}

/// Models a tier may use, in capability order.
pub fn allowed_models(tier: SubscriptionTier) -> Vec<ModelAccess> {
    plan_for(tier).iter().map(|(model, _)| *model).collect()
}

pub fn is_allowed(tier: SubscriptionTier, model: ModelAccess) -> bool {
    plan_for(tier).iter().any(|(m, _)| *m == model)
}

/// Plan override from storage, else the tier default. `None` is unlimited.
pub fn effective_limit(usage: &SubscriptionUsage, model: ModelAccess) -> Option<u32> {
    if let Some(limit) = usage.limits.get(&model) {
        return *limit;
    }
    plan_for(usage.tier)
        .iter()
        .find(|(m, _)| *m == model)
        .and_then(|(_, limit)| *limit)
}

pub fn has_remaining(used: u32, limit: Option<u32>) -> bool {
    limit.map_or(true, |limit| used < limit)
}

//
// ================= Query Classifiers =================
//

const HIGH_STAKES_KEYWORDS: &[&str] = &[
    "bankrupt",
    "foreclos",
    "inheritance",
    "estate plan",
    "divorce",
    "lawsuit",
    "sell my business",
    "sell my house",
    "sell my home",
    "life savings",
    "all my savings",
    "liquidate",
    "cash out my",
    "early withdrawal",
    "business acquisition",
];

const MATH_KEYWORDS: &[&str] = &[
    "calculate",
    "calculation",
    "how much will",
    "how much would",
    "how much do i need",
    "compound",
    "amortiz",
    "interest rate",
    "monthly payment",
    "payoff date",
    "how long will it take",
    "how many months",
    "how many years",
    "break-even",
    "break even",
    "future value",
    "present value",
    "net present",
    "percentage",
];

const REASONING_KEYWORDS: &[&str] = &[
    "should i",
    "pros and cons",
    "trade-off",
    "tradeoff",
    "which is better",
    "what if",
    "compare",
    "prioritize",
    "explain why",
];

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryShape {
    pub high_stakes: bool,
    pub math: bool,
    pub reasoning: bool,
}

pub fn classify_query(message: &str) -> QueryShape {
    let text = message.to_lowercase();
    QueryShape {
        high_stakes: contains_any(&text, HIGH_STAKES_KEYWORDS),
        math: contains_any(&text, MATH_KEYWORDS),
        reasoning: contains_any(&text, REASONING_KEYWORDS),
    }
}

/// Capability the query asks for, before tier gating.
fn requested_capability(shape: QueryShape, escalated: bool) -> ModelAccess {
    if escalated && shape.high_stakes {
        ModelAccess::Cfo
    } else if shape.math {
        ModelAccess::Math
    } else if shape.reasoning || escalated {
        ModelAccess::Reasoning
    } else {
        ModelAccess::Fast
    }
}

/// Most capable allowed model at or below `requested`.
pub fn clamp_to_allowed(requested: ModelAccess, tier: SubscriptionTier) -> ModelAccess {
    allowed_models(tier)
        .into_iter()
        .filter(|m| *m <= requested)
        .max()
        .unwrap_or(ModelAccess::Fast)
}

pub fn select_preferred_model(
    message: &str,
    decision: &RouteDecision,
    tier: SubscriptionTier,
) -> ModelAccess {
    let shape = classify_query(message);
    let requested = requested_capability(shape, decision.escalated());
    let preferred = clamp_to_allowed(requested, tier);

    debug!(
        ?shape,
        escalated = decision.escalated(),
        requested = %requested,
        preferred = %preferred,
        tier = %tier,
        "preferred model selected"
    );
    preferred
}

fn unit_cost(model: ModelAccess) -> f64 {
    calculate_cost(model, 1000, 1000)
}

/// Preferred first, then other allowed specialty models by ascending cost,
/// then the fast model last when it was not preferred.
pub fn build_fallback_list(preferred: ModelAccess, tier: SubscriptionTier) -> Vec<ModelAccess> {
    let allowed = allowed_models(tier);

    let mut specialty: Vec<ModelAccess> = allowed
        .iter()
        .copied()
        .filter(|m| *m != preferred && *m != ModelAccess::Fast)
        .collect();
    specialty.sort_by(|a, b| unit_cost(*a).total_cmp(&unit_cost(*b)));

    let mut list = Vec::with_capacity(allowed.len());
    list.push(preferred);
    list.extend(specialty);
    if preferred != ModelAccess::Fast && allowed.contains(&ModelAccess::Fast) {
        list.push(ModelAccess::Fast);
    }
    list
}

//
// ================= Resolution =================
//

/// Business outcome when no allowed model has quota left. Not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaExceeded {
    pub preferred_model: ModelAccess,
    pub used: u32,
    pub limit: Option<u32>,
    pub current_tier: SubscriptionTier,
    pub next_tier: Option<SubscriptionTier>,
    pub upgrade_required: bool,
    pub message: String,
}

impl QuotaExceeded {
    fn new(usage: &SubscriptionUsage, preferred: ModelAccess) -> Self {
        let used = usage.used(preferred);
        let limit = effective_limit(usage, preferred);
        let next_tier = usage.tier.next();

        let mut message = format!(
            "You've used all of this month's AI requests on your {} plan ({} of {} for {}).",
            usage.tier,
            used,
            limit.map_or_else(|| "unlimited".to_string(), |l| l.to_string()),
            preferred.display_name(),
        );
        match next_tier {
            Some(next) => message.push_str(&format!(" Upgrade to {} for more.", next)),
            None => message.push_str(" Your quota resets at the start of next month."),
        }

        Self {
            preferred_model: preferred,
            used,
            limit,
            current_tier: usage.tier,
            next_tier,
            upgrade_required: true,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelSelection {
    Selected {
        model: ModelAccess,
        preferred: ModelAccess,
        downgraded: bool,
    },
    QuotaExceeded(QuotaExceeded),
}

/// Walk the fallback list against current usage.
///
/// A forced model replaces the classifier's choice but is still clamped to
/// the tier and still subject to quota.
pub fn resolve_model(
    message: &str,
    decision: &RouteDecision,
    usage: &SubscriptionUsage,
    force_model: Option<ModelAccess>,
) -> ModelSelection {
    let preferred = match force_model {
        Some(model) => clamp_to_allowed(model, usage.tier),
        None => select_preferred_model(message, decision, usage.tier),
    };

    for model in build_fallback_list(preferred, usage.tier) {
        let used = usage.used(model);
        let limit = effective_limit(usage, model);

        if has_remaining(used, limit) {
            return ModelSelection::Selected {
                model,
                preferred,
                downgraded: model != preferred,
            };
        }
        debug!(model = %model, used, ?limit, "no quota left, trying next model");
    }

    ModelSelection::QuotaExceeded(QuotaExceeded::new(usage, preferred))
}

/// Prepended to answers served by a fallback model.
pub fn downgrade_notice(preferred: ModelAccess, selected: ModelAccess) -> String {
    format!(
        "> Note: you've reached this month's limit for the {} model, so this answer comes from the {} model.\n\n",
        preferred.display_name(),
        selected.display_name()
    )
}
