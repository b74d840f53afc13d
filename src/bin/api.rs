use std::sync::Arc;
use tiered_advice_orchestrator::{
    api::start_server,
    context::ContextBuilder,
    llm::ModelRegistry,
    storage::{InMemoryStore, PgUsageLedger, UsageLedger},
    HybridAdviceService, OrchestratorConfig, TieredAdviceService,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;

    info!("Tiered Advice Orchestrator - API Server");
    info!("Port: {}", config.port);

    let registry = Arc::new(ModelRegistry::from_config(&config)?);

    // Financial records come from the in-memory store; usage goes to
    // Postgres when a database is configured.
    let store = InMemoryStore::new();
    let ledger: Arc<dyn UsageLedger> = match config.database_url.as_deref() {
        Some(url) => {
            info!("Usage ledger: Postgres");
            Arc::new(PgUsageLedger::connect_lazy(url)?)
        }
        None => {
            warn!("DATABASE_URL not set, usage counters are kept in memory");
            Arc::new(store.clone())
        }
    };

    let context_builder =
        ContextBuilder::new(Arc::new(store)).with_fetch_timeout(config.context_fetch_timeout);
    let advice = HybridAdviceService::new(registry, context_builder);
    let service = Arc::new(TieredAdviceService::new(advice, ledger));

    info!("Advice service initialized");
    start_server(service, config.port).await?;

    Ok(())
}
