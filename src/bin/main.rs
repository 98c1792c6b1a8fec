use std::sync::Arc;
use stockassist_engine::{
    backend::build_backend,
    config::EngineConfig,
    engine::{AnalysisEngine, AnalysisRequest},
    tools::create_default_registry,
    tracker::{InMemoryOperationStore, OperationStore},
};
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = EngineConfig::from_env()?;

    let message = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let message = if message.is_empty() {
        "What is the latest news on the S&P 500?".to_string()
    } else {
        message
    };

    info!("🚀 StockAssist Engine");
    info!("📍 Provider: {:?}", config.provider);

    let backend = build_backend(&config);
    let registry = Arc::new(create_default_registry(&config));
    let mut tool_names = registry.list();
    tool_names.sort_unstable();
    info!("🔧 Tools: {}", tool_names.join(", "));
    let store = Arc::new(InMemoryOperationStore::new());

    let engine = AnalysisEngine::new(
        backend,
        registry,
        Arc::clone(&store) as Arc<dyn OperationStore>,
        config,
    );

    let operation_id = engine.begin(Uuid::new_v4()).await?;
    info!("✅ Operation created: {}", operation_id);

    let result = engine
        .run(operation_id, AnalysisRequest::from_message(message))
        .await;

    if let Some(operation) = store.get(operation_id).await? {
        println!("\n--- Progress ---");
        for step in &operation.steps {
            println!("[{}] {}", step.timestamp.format("%H:%M:%S"), step.description);
        }
        println!("--- Status: {} ---\n", operation.status.as_str());
    }

    match result {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Operation failed: {}", e),
    }

    Ok(())
}
