use tracing_subscriber::EnvFilter;

use rag_retrieval::api;
use rag_retrieval::config::Config;
use rag_retrieval::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("LLM provider: {} ({})", config.llm.provider, config.llm.base_url);
    match &config.reranker.base_url {
        Some(url) => tracing::info!("Reranker: {url}"),
        None => tracing::info!("Reranker: not configured, results keep fused order"),
    }

    let state = AppState::new(config.clone())?;
    tracing::info!(
        "Loaded {} documents ({} vector entries)",
        state.catalog.len(),
        state.vectors.store().entry_count()
    );

    // No CORS layer: callers sit behind the same gateway that sets the owner header.
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}
