// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ragstone server: retrieval-augmented question answering with
//! per-tenant knowledge bases, a fixed-QA vector store, intent/safety
//! gating, tiered rate limiting and multi-tier caching behind one axum
//! surface.

pub mod api;
pub mod cache;
pub mod config;
pub mod fsutil;
pub mod gate;
pub mod ingest;
pub mod intent;
pub mod kb;
pub mod knowledge_graph;
pub mod llm;
pub mod locks;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod qa;
pub mod retrieval;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::middleware as axum_middleware;
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use cache::CacheCoordinator;
use config::ServerConfig;
use gate::AdmissionGate;
use ingest::IngestPipeline;
use intent::IntentEngine;
use kb::KbManager;
use llm::{
    ChatProvider, EmbeddingProvider, OpenAiCompatibleChat, OpenAiCompatibleEmbedder,
    OpenAiCompatibleReranker, RerankProvider,
};
use locks::KeyedLocks;
use metrics::{HealthProbe, MetricsRegistry};
use orchestrator::Orchestrator;
use qa::QaStore;
use retrieval::RetrievalEngine;

/// Startup failures, split so the binary can map them onto its exit
/// codes (1: configuration, 2: port bind).
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// The upstream adapters the server talks to. Bundled so tests can swap
/// in stubs without touching the rest of the wiring.
pub struct Providers {
    pub chat: Arc<dyn ChatProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub reranker: Option<Arc<dyn RerankProvider>>,
}

impl Providers {
    /// Real adapters from the configured endpoints.
    pub fn from_config(config: &ServerConfig) -> Result<Self, StartupError> {
        let chat = OpenAiCompatibleChat::new(
            config.llm.llm_api_base.clone(),
            config.llm.llm_api_key.clone(),
            config.llm.llm_model.clone(),
            Duration::from_secs(config.llm.llm_timeout),
        )
        .map_err(|e| StartupError::Config(e.to_string()))?;

        let embedder = OpenAiCompatibleEmbedder::new(
            config.embedding.embedding_api_base.clone(),
            config.embedding.embedding_api_key.clone(),
            config.embedding.embedding_model.clone(),
            config.embedding.embedding_dim,
            Duration::from_secs(config.embedding.embedding_timeout),
        )
        .map_err(|e| StartupError::Config(e.to_string()))?;

        let reranker: Option<Arc<dyn RerankProvider>> = if config.rerank.rerank_enabled {
            Some(Arc::new(
                OpenAiCompatibleReranker::new(
                    config.llm.llm_api_base.clone(),
                    config.llm.llm_api_key.clone(),
                    config.rerank.rerank_model.clone(),
                    Duration::from_secs(config.rerank.rerank_timeout),
                )
                .map_err(|e| StartupError::Config(e.to_string()))?,
            ))
        } else {
            None
        };

        Ok(Self {
            chat: Arc::new(chat),
            embedder: Arc::new(embedder),
            reranker,
        })
    }
}

/// Construct the application state: every component wired to its owner.
pub async fn build_state(
    config: ServerConfig,
    providers: Providers,
) -> Result<AppState, StartupError> {
    config
        .validate()
        .map_err(|e| StartupError::Config(e.to_string()))?;

    let locks = Arc::new(KeyedLocks::default());
    let caches = Arc::new(CacheCoordinator::new(
        config.cache.enable_cache,
        Duration::from_secs(config.cache.cache_ttl),
        &config.cache.per_cache_size_limits,
    ));
    let gate = Arc::new(AdmissionGate::new(&config.gate, config.tier_limits()));

    let kb_manager = Arc::new(
        KbManager::open(
            config.storage.working_dir.clone(),
            config.embedding.embedding_dim,
            locks.clone(),
        )
        .await
        .map_err(|e| StartupError::Config(e.to_string()))?,
    );

    let qa = Arc::new(
        QaStore::open(
            config.storage.qa_storage_dir.clone(),
            providers.embedder.clone(),
            caches.clone(),
            locks.clone(),
            config.intent.qa_similarity_threshold,
        )
        .map_err(|e| StartupError::Config(e.to_string()))?,
    );

    let intent_llm = config
        .intent
        .intent_enable_llm
        .then(|| providers.chat.clone());
    let intent = Arc::new(IntentEngine::new(&config.intent, intent_llm));

    let retrieval = Arc::new(RetrievalEngine::new(
        kb_manager.clone(),
        providers.chat.clone(),
        providers.embedder.clone(),
        providers.reranker.clone(),
        caches.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        intent,
        retrieval.clone(),
        kb_manager.clone(),
    ));

    let ingest = Arc::new(IngestPipeline::new(
        kb_manager.clone(),
        providers.embedder.clone(),
        caches.clone(),
        config.upload.allowed_file_types.clone(),
    ));

    let log_file = config.storage.log_dir.join("ragstone.jsonl");

    Ok(AppState {
        config: Arc::new(config),
        gate,
        caches,
        locks,
        qa,
        kb_manager,
        retrieval,
        orchestrator,
        ingest,
        embedder: providers.embedder,
        metrics: Arc::new(MetricsRegistry::new()),
        probe: Arc::new(HealthProbe::new(Duration::from_secs(30))),
        log_file,
    })
}

/// Assemble the router with the full middleware stack, outermost first:
/// CORS → identity extraction + rate gate → request logging → routes.
pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.server.enable_cors {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };
    let body_limit = state.config.upload.max_file_size;

    Router::new()
        .route("/health", get(api::system::health))
        .nest("/api/v1", api::api_router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::logging_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::admission_middleware,
        ))
        .layer(cors)
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .with_state(state)
}

/// Run the server until shutdown.
pub async fn run_server(config: ServerConfig) -> Result<(), StartupError> {
    let addr = config
        .socket_addr()
        .map_err(|e| StartupError::Config(e.to_string()))?;

    tracing::info!("Starting Ragstone server");

    let providers = Providers::from_config(&config)?;
    let state = build_state(config, providers).await?;

    // Periodic sweep keeps the lock table bounded by live usage.
    let sweep_locks = state.locks.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let removed = sweep_locks.sweep();
            if removed > 0 {
                tracing::debug!("lock sweep removed {} idle entries", removed);
            }
        }
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await
    .map_err(|e| StartupError::Runtime(e.to_string()))
}

/// Install the tracing stack: env-filtered console output plus JSON lines
/// into the request log file. The returned guard must stay alive for the
/// lifetime of the process.
pub fn init_tracing(
    config: &ServerConfig,
) -> Result<tracing_appender::non_blocking::WorkerGuard, StartupError> {
    std::fs::create_dir_all(&config.storage.log_dir)
        .map_err(|e| StartupError::Config(format!("cannot create log dir: {e}")))?;

    let file_appender =
        tracing_appender::rolling::never(&config.storage.log_dir, "ragstone.jsonl");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default_filter = if config.server.debug {
        "ragstone_server=debug,tower_http=debug"
    } else {
        "ragstone_server=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}
