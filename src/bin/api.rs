use connect_agent_orchestrator::{
    api::{start_server, AppState},
    gemini::{GeminiChannelFactory, GeminiClient},
    orchestrator::TurnOrchestrator,
    session::SessionManager,
    store::JsonFileStore,
    tools::{status::StatusTools, vaulta::VaultaTools, ToolRegistry},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    if std::env::var("GEMINI_API_KEY").is_err() {
        eprintln!("⚠️  GEMINI_API_KEY not set in .env");
        eprintln!("📌 See .env.example for setup instructions");
    }

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let store_path = std::env::var("SESSION_STORE_PATH")
        .unwrap_or_else(|_| "data/sessions.json".to_string());

    info!("🚀 Connect Agent Orchestrator - API Server");
    info!("📍 Port: {}", api_port);
    info!("💾 Session store: {}", store_path);

    // Create components once and inject them; no global state.
    let vaulta = Arc::new(VaultaTools::from_env());
    let mut registry = ToolRegistry::new();
    registry.register(vaulta.clone());
    registry.register(Arc::new(StatusTools::new()));
    let registry = Arc::new(registry);

    let gemini = Arc::new(GeminiClient::from_env());
    let channels = Arc::new(GeminiChannelFactory::new(
        gemini,
        &registry.descriptors(),
    ));

    let store = Arc::new(JsonFileStore::new(store_path));
    let manager = Arc::new(SessionManager::new(store, channels));
    let orchestrator = Arc::new(TurnOrchestrator::new(registry.clone()));

    let state = AppState {
        manager,
        orchestrator,
        registry,
        vaulta,
    };

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(state, api_port).await?;

    Ok(())
}
