use std::sync::Arc;
use tiered_advice_orchestrator::{
    context::ContextBuilder,
    llm::ModelRegistry,
    storage::{
        memory::UserFinances, AssetRecord, DebtRecord, GoalRecord, InMemoryStore, ProfileRecord,
        UserRecord,
    },
    AdviceOutcome, AdviceRequest, HybridAdviceService, OrchestratorConfig, SubscriptionTier,
    TieredAdviceService,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn sample_finances(user_id: Uuid) -> UserFinances {
    let debt = |name: &str, balance: &str, apr: &str, minimum: &str| DebtRecord {
        name: name.to_string(),
        balance: Some(balance.to_string()),
        apr: Some(apr.to_string()),
        minimum_payment: Some(minimum.to_string()),
        monthly_payment: None,
    };

    UserFinances {
        user: Some(UserRecord {
            user_id,
            display_name: Some("Sample User".to_string()),
            email: None,
        }),
        profile: Some(ProfileRecord {
            monthly_income: Some("$6,400".to_string()),
            monthly_expenses: Some("$4,150".to_string()),
            income_sources: Vec::new(),
        }),
        debts: vec![
            debt("Visa", "$4,820.00", "24.99%", "$145"),
            debt("Store card", "$610", "29.9%", "$35"),
            debt("Car loan", "$11,300", "6.4%", "$312"),
        ],
        assets: vec![AssetRecord {
            name: "Brokerage".to_string(),
            value: Some("$18,200".to_string()),
            asset_type: Some("equity".to_string()),
        }],
        goals: vec![GoalRecord {
            name: "Emergency fund".to_string(),
            target_amount: Some("$15,000".to_string()),
            current_amount: Some("$3,500".to_string()),
            target_date: None,
        }],
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Tiered Advice Orchestrator demo starting");

    let config = OrchestratorConfig::from_env()?;
    let registry = Arc::new(ModelRegistry::from_config(&config)?);

    // Seed an in-memory store with one Pro user
    let store = InMemoryStore::new();
    let user_id = Uuid::new_v4();
    store.insert_finances(user_id, sample_finances(user_id)).await;
    store
        .set_subscription(user_id, Some(Uuid::new_v4()), SubscriptionTier::Pro)
        .await;

    let context_builder = ContextBuilder::new(Arc::new(store.clone()))
        .with_fetch_timeout(config.context_fetch_timeout);
    let advice = HybridAdviceService::new(registry, context_builder);
    let service = TieredAdviceService::new(advice, Arc::new(store.clone()));

    let message = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let message = if message.trim().is_empty() {
        "Should I use the avalanche or snowball method to pay off my debt?".to_string()
    } else {
        message
    };

    info!(user_id = %user_id, message = %message, "Running query");

    match service.handle_query(AdviceRequest::new(user_id, message)).await {
        Ok(AdviceOutcome::Answered(advice)) => {
            let response = &advice.response;
            println!("\n=== ADVICE ===");
            println!("Model: {} ({})", response.model_used, response.model_id);
            println!("Escalated: {}", response.escalated);
            if let Some(reason) = &response.escalation_reason {
                println!("Reason: {}", reason);
            }
            if let Some(kind) = response.orchestrator_used {
                println!("Orchestrator: {}", kind);
            }
            println!(
                "Tokens: {} in / {} out, cost ${:.5}",
                response.tokens_in, response.tokens_out, response.cost
            );
            println!("\n{}", response.answer);
            Ok(())
        }
        Ok(AdviceOutcome::QuotaExceeded(exceeded)) => {
            println!("\n=== QUOTA EXCEEDED ===");
            println!("{}", exceeded.message);
            Ok(())
        }
        Err(e) => {
            eprintln!("Advice failed: {}", e.user_message());
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
