mod logging;
mod routes;

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use extract::{Classifier, Extractor, LanguageModel, OllamaClient, SchemaRegistry};
use index::{
    Embedder, EmbeddingClient, GraphBuilder, GraphStore, Neo4jGraphStore, QdrantVectorStore,
    SearchService, SqliteMetadataStore, StorageCoordinator, VectorStore,
};
use ingest::ChunkerConfig;
use pipeline::{
    AppConfig, Backoff, IntakeQueue, Metrics, Orchestrator, OrchestratorSettings, StageExecutor,
    Stages,
};

use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;
    info!(
        mode = ?config.mode,
        workers = config.concurrency.workers,
        queue_depth = config.concurrency.queue_depth,
        max_retries = config.retry.max_retries,
        "Starting document pipeline"
    );

    let metadata = Arc::new(
        SqliteMetadataStore::connect(
            &config.stores.database_url,
            config.stores.database_max_connections,
        )
        .await
        .with_context(|| format!("failed to open {}", config.stores.database_url))?,
    );

    let neo4j = Neo4jGraphStore::connect(
        &config.stores.neo4j_uri,
        &config.stores.neo4j_user,
        &config.stores.neo4j_password,
    )
    .await
    .context("failed to connect to Neo4j")?;
    if let Err(e) = neo4j.init_schema().await {
        warn!(error = %e, "Could not create graph indexes, continuing without them");
    }
    let graph: Arc<dyn GraphStore> = Arc::new(neo4j);

    let vectors: Arc<dyn VectorStore> = Arc::new(QdrantVectorStore::new(
        config.stores.qdrant_url.clone(),
        config.stores.qdrant_collection.clone(),
        config.stage_timeout(),
    ));

    let embedding_client = EmbeddingClient::new(
        config.stores.embedding_url.clone(),
        config.stores.embedding_model.clone(),
        config.stage_timeout(),
    );
    let dimension = (config.stores.embedding_dimension > 0).then_some(config.stores.embedding_dimension);
    let embedder = Arc::new(Embedder::new(Arc::new(embedding_client), dimension));

    let llm: Arc<dyn LanguageModel> = Arc::new(OllamaClient::new(
        config.extraction.llm_url.clone(),
        config.extraction.llm_model.clone(),
        std::time::Duration::from_secs(config.extraction.llm_timeout_secs),
    ));
    let registry = Arc::new(SchemaRegistry::builtin());

    let stages = Arc::new(Stages::new(
        Classifier::new(llm.clone(), registry.clone()),
        Extractor::new(llm, config.extraction.confidence_floor),
        registry,
        ChunkerConfig {
            target_tokens: config.chunking.target_tokens,
            overlap_tokens: config.chunking.overlap_tokens,
        },
        embedder.clone(),
        StorageCoordinator::new(metadata.clone(), GraphBuilder::new(graph.clone()), vectors.clone()),
    ));

    let metrics = Metrics::new();
    let queue = Arc::new(IntakeQueue::new(
        metadata.clone(),
        config.concurrency.queue_depth,
        config.lease(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        queue.clone(),
        stages,
        StageExecutor::new(Backoff::from_config(&config.retry), metrics.clone()),
        metrics.clone(),
        OrchestratorSettings::from_config(&config),
    ));

    let shutdown = CancellationToken::new();
    let workers = orchestrator.spawn_workers(shutdown.clone());

    let app = routes::router(AppState {
        queue,
        search: Arc::new(SearchService::new(metadata, vectors.clone(), embedder)),
        metrics,
        graph,
        vectors,
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    // Workers finish the document in hand; anything left is reclaimed on restart.
    shutdown.cancel();
    workers.wait().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    shutdown.cancelled().await;
                }
            }
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
